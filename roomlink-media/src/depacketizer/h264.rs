//! H264 payload handling (RFC 6184)
//!
//! Dispatches on the NAL unit type: single NAL units pass through, STAP-A
//! aggregates are unpacked from their 16-bit length prefixes, and FU-A /
//! FU-B fragments are reassembled by re-synthesizing the NAL header from
//! the indicator and fragmentation-unit header bytes. The interleaved
//! packetization modes (STAP-B, MTAP) are not negotiated by this core and
//! are rejected as malformed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::MediaError;

const NAL_TYPE_MASK: u8 = 0x1f;
const NAL_REF_IDC_MASK: u8 = 0xe0;

const NAL_TYPE_IDR: u8 = 5;
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;
const NAL_TYPE_FU_B: u8 = 29;

const FU_START_MASK: u8 = 0x80;

const ANNEX_B_START_CODE: [u8; 4] = [0, 0, 0, 1];

const fn is_keyframe_nal(nal_type: u8) -> bool {
    matches!(nal_type, NAL_TYPE_IDR | NAL_TYPE_SPS | NAL_TYPE_PPS)
}

#[derive(Debug, Clone, Default)]
pub struct H264Depacketizer {
    buffer: BytesMut,
    frame_complete: bool,
    keyframe: bool,
}

impl H264Depacketizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_packet(&mut self, payload: &Bytes, is_last: bool) -> Result<(), MediaError> {
        if payload.is_empty() {
            return Err(MediaError::depacketize("empty H264 payload"));
        }

        let indicator = payload[0];
        let nal_type = indicator & NAL_TYPE_MASK;

        match nal_type {
            1..=23 => {
                if is_keyframe_nal(nal_type) {
                    self.keyframe = true;
                }
                self.buffer.put_slice(payload);
            }
            NAL_TYPE_STAP_A => self.add_stap_a(payload)?,
            NAL_TYPE_FU_A | NAL_TYPE_FU_B => self.add_fragmentation_unit(payload, nal_type)?,
            other => {
                return Err(MediaError::depacketize(format!(
                    "unsupported NAL unit type {other}"
                )));
            }
        }

        if is_last {
            self.frame_complete = true;
        }
        Ok(())
    }

    /// Unpack a STAP-A aggregate: NAL units concatenated with 16-bit length
    /// prefixes. Each contained unit is emitted with an Annex-B start code
    /// so the decoder can find the boundaries again. Unpacking goes through
    /// a scratch buffer: a truncated aggregate must commit nothing, leaving
    /// the accumulated frame intact when the fragment is discarded.
    fn add_stap_a(&mut self, payload: &Bytes) -> Result<(), MediaError> {
        let mut scratch = BytesMut::new();
        let mut keyframe = false;
        let mut offset = 1;
        while offset < payload.len() {
            if payload.len() < offset + 2 {
                return Err(MediaError::depacketize("truncated STAP-A length prefix"));
            }
            let nal_len = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
            offset += 2;
            if nal_len == 0 || payload.len() < offset + nal_len {
                return Err(MediaError::depacketize("truncated STAP-A NAL unit"));
            }
            let nal_type = payload[offset] & NAL_TYPE_MASK;
            if is_keyframe_nal(nal_type) {
                keyframe = true;
            }
            scratch.put_slice(&ANNEX_B_START_CODE);
            scratch.put_slice(&payload[offset..offset + nal_len]);
            offset += nal_len;
        }
        self.buffer.extend_from_slice(&scratch);
        self.keyframe |= keyframe;
        Ok(())
    }

    /// Reassemble an FU-A/FU-B fragment. The start fragment re-synthesizes
    /// the original NAL header from the indicator's NRI bits and the FU
    /// header's type bits; later fragments contribute payload only.
    fn add_fragmentation_unit(&mut self, payload: &Bytes, nal_type: u8) -> Result<(), MediaError> {
        // FU-B carries a 16-bit decoding order number after the FU header.
        let header_len = if nal_type == NAL_TYPE_FU_B { 4 } else { 2 };
        if payload.len() <= header_len {
            return Err(MediaError::depacketize("truncated fragmentation unit"));
        }

        let fu_header = payload[1];
        if fu_header & FU_START_MASK != 0 {
            let original_type = fu_header & NAL_TYPE_MASK;
            if is_keyframe_nal(original_type) {
                self.keyframe = true;
            }
            self.buffer
                .put_u8((payload[0] & NAL_REF_IDC_MASK) | original_type);
        }
        self.buffer.put_slice(&payload[header_len..]);
        Ok(())
    }

    #[must_use]
    pub const fn frame_complete(&self) -> bool {
        self.frame_complete
    }

    #[must_use]
    pub const fn is_keyframe(&self) -> bool {
        self.keyframe
    }

    pub fn take_frame(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.frame_complete = false;
        self.keyframe = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_nal_passthrough() {
        let mut d = H264Depacketizer::new();
        let nal = Bytes::from_static(&[0x65, 0x11, 0x22]); // IDR
        d.add_packet(&nal, true).unwrap();
        assert!(d.frame_complete());
        assert!(d.is_keyframe());
        assert_eq!(&d.take_frame()[..], &nal[..]);
    }

    #[test]
    fn test_non_idr_is_not_keyframe() {
        let mut d = H264Depacketizer::new();
        d.add_packet(&Bytes::from_static(&[0x41, 0x11]), true).unwrap(); // slice
        assert!(!d.is_keyframe());
    }

    #[test]
    fn test_fu_a_round_trip() {
        // Original IDR NAL unit, split at arbitrary points.
        let mut nal = vec![0x65u8];
        nal.extend((0u8..100).map(|i| i.wrapping_mul(7)));
        let splits = [(1usize, 30usize), (30, 31), (31, 101)];

        let mut d = H264Depacketizer::new();
        for (i, (from, to)) in splits.iter().enumerate() {
            let mut fragment = BytesMut::new();
            fragment.put_u8((nal[0] & NAL_REF_IDC_MASK) | NAL_TYPE_FU_A);
            let mut fu_header = nal[0] & NAL_TYPE_MASK;
            if i == 0 {
                fu_header |= FU_START_MASK;
            }
            if *to == nal.len() {
                fu_header |= 0x40; // end bit
            }
            fragment.put_u8(fu_header);
            fragment.put_slice(&nal[*from..*to]);
            d.add_packet(&fragment.freeze(), *to == nal.len()).unwrap();
        }

        assert!(d.frame_complete());
        assert!(d.is_keyframe());
        assert_eq!(&d.take_frame()[..], &nal[..]);
    }

    #[test]
    fn test_fu_b_skips_decoding_order_number() {
        let mut d = H264Depacketizer::new();
        // Start fragment of a non-IDR slice with DON 0x0102.
        let fragment = Bytes::from_static(&[
            0x40 | NAL_TYPE_FU_B,
            FU_START_MASK | 0x01,
            0x01,
            0x02,
            0xaa,
            0xbb,
        ]);
        d.add_packet(&fragment, true).unwrap();
        assert_eq!(&d.take_frame()[..], &[0x41, 0xaa, 0xbb]);
    }

    #[test]
    fn test_stap_a_unpacked_with_start_codes() {
        let mut buf = BytesMut::new();
        buf.put_u8(NAL_TYPE_STAP_A);
        buf.put_u16(2);
        buf.put_slice(&[0x67, 0x42]); // SPS
        buf.put_u16(2);
        buf.put_slice(&[0x68, 0xce]); // PPS

        let mut d = H264Depacketizer::new();
        d.add_packet(&buf.freeze(), true).unwrap();
        assert!(d.is_keyframe());
        assert_eq!(
            &d.take_frame()[..],
            &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xce]
        );
    }

    #[test]
    fn test_truncated_stap_a_rejected() {
        let mut d = H264Depacketizer::new();
        let bad = Bytes::from_static(&[NAL_TYPE_STAP_A, 0x00, 0x09, 0x67]);
        assert!(d.add_packet(&bad, false).is_err());
    }

    #[test]
    fn test_truncated_stap_a_leaves_state_intact() {
        let mut d = H264Depacketizer::new();
        d.add_packet(&Bytes::from_static(&[0x41, 0x11, 0x22]), false)
            .unwrap();

        // Complete SPS, then a second unit whose length prefix overruns
        // the payload. The whole aggregate must be discarded.
        let mut buf = BytesMut::new();
        buf.put_u8(NAL_TYPE_STAP_A);
        buf.put_u16(2);
        buf.put_slice(&[0x67, 0x42]); // SPS
        buf.put_u16(9);
        buf.put_u8(0x68);
        assert!(d.add_packet(&buf.freeze(), false).is_err());

        assert!(!d.is_keyframe());
        assert_eq!(&d.take_frame()[..], &[0x41, 0x11, 0x22]);
    }

    #[test]
    fn test_unsupported_type_rejected() {
        let mut d = H264Depacketizer::new();
        assert!(d.add_packet(&Bytes::from_static(&[25, 0x00]), false).is_err()); // STAP-B
    }
}
