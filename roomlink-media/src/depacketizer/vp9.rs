//! VP9 payload descriptor handling (RFC 9628)
//!
//! The descriptor carries picture id, layer indices and an optional
//! scalability structure, all of variable length driven by the flag bits
//! of the first byte. Everything is skipped; only the B (begin) and P
//! (inter-picture predicted) bits feed keyframe detection.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::MediaError;

const VP9_I_MASK: u8 = 0b1000_0000; // picture id present
const VP9_P_MASK: u8 = 0b0100_0000; // inter-picture predicted
const VP9_L_MASK: u8 = 0b0010_0000; // layer indices present
const VP9_F_MASK: u8 = 0b0001_0000; // flexible mode
const VP9_B_MASK: u8 = 0b0000_1000; // start of frame
const VP9_V_MASK: u8 = 0b0000_0010; // scalability structure present

// Extended (two-byte) picture id
const VP9_M_MASK: u8 = 0b1000_0000;

// Scalability structure header
const VP9_SS_Y_MASK: u8 = 0b0001_0000;
const VP9_SS_G_MASK: u8 = 0b0000_1000;

#[derive(Debug, Clone, Default)]
pub struct Vp9Depacketizer {
    buffer: BytesMut,
    frame_complete: bool,
    keyframe: bool,
}

impl Vp9Depacketizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_packet(&mut self, payload: &Bytes, is_last: bool) -> Result<(), MediaError> {
        if payload.is_empty() {
            return Err(MediaError::depacketize("empty VP9 payload"));
        }

        let b0 = payload[0];
        let mut offset = 1;

        if b0 & VP9_I_MASK != 0 {
            if payload.len() <= offset {
                return Err(MediaError::depacketize("truncated VP9 picture id"));
            }
            if payload[offset] & VP9_M_MASK != 0 {
                offset += 1;
            }
            offset += 1;
        }

        if b0 & VP9_L_MASK != 0 {
            offset += 1;
            // Non-flexible mode carries TL0PICIDX after the layer byte.
            if b0 & VP9_F_MASK == 0 {
                offset += 1;
            }
        }

        if b0 & VP9_F_MASK != 0 && b0 & VP9_P_MASK != 0 {
            // Up to three reference index bytes, each chaining on its low bit.
            for _ in 0..3 {
                if payload.len() <= offset {
                    return Err(MediaError::depacketize("truncated VP9 reference indices"));
                }
                let more = payload[offset] & 0x01 != 0;
                offset += 1;
                if !more {
                    break;
                }
            }
        }

        if b0 & VP9_V_MASK != 0 {
            offset = Self::skip_scalability_structure(payload, offset)?;
        }

        if payload.len() <= offset {
            return Err(MediaError::depacketize("VP9 descriptor consumed whole payload"));
        }

        if b0 & VP9_B_MASK != 0 {
            self.keyframe = b0 & VP9_P_MASK == 0;
        }

        self.buffer.put_slice(&payload[offset..]);
        if is_last {
            self.frame_complete = true;
        }
        Ok(())
    }

    fn skip_scalability_structure(payload: &Bytes, mut offset: usize) -> Result<usize, MediaError> {
        if payload.len() <= offset {
            return Err(MediaError::depacketize("truncated VP9 scalability structure"));
        }
        let header = payload[offset];
        offset += 1;
        let spatial_layers = ((header >> 5) & 0x07) as usize + 1;

        if header & VP9_SS_Y_MASK != 0 {
            // 16-bit width and height per spatial layer.
            offset += spatial_layers * 4;
        }
        if header & VP9_SS_G_MASK != 0 {
            if payload.len() <= offset {
                return Err(MediaError::depacketize("truncated VP9 picture group count"));
            }
            let group_count = payload[offset] as usize;
            offset += 1;
            for _ in 0..group_count {
                if payload.len() <= offset {
                    return Err(MediaError::depacketize("truncated VP9 picture group"));
                }
                let ref_count = ((payload[offset] >> 2) & 0x03) as usize;
                offset += 1 + ref_count;
            }
        }

        if payload.len() < offset {
            return Err(MediaError::depacketize("truncated VP9 scalability structure"));
        }
        Ok(offset)
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

    fn fragment(descriptor: &[u8], body: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(descriptor);
        buf.put_slice(body);
        buf.freeze()
    }

    #[test]
    fn test_keyframe_from_begin_without_prediction() {
        let mut d = Vp9Depacketizer::new();
        d.add_packet(&fragment(&[VP9_B_MASK], &[0xaa]), true).unwrap();
        assert!(d.is_keyframe());

        d.reset();
        d.add_packet(&fragment(&[VP9_B_MASK | VP9_P_MASK], &[0xaa]), true).unwrap();
        assert!(!d.is_keyframe());
    }

    #[test]
    fn test_round_trip_with_varied_descriptors() {
        let frame: Vec<u8> = (0u8..200).rev().collect();
        let mut d = Vp9Depacketizer::new();

        // Start fragment: picture id (2 bytes) + layer indices, non-flexible.
        let start_descriptor = [
            VP9_I_MASK | VP9_L_MASK | VP9_B_MASK,
            VP9_M_MASK | 0x01,
            0x02,
            0x00, // layer byte
            0x00, // TL0PICIDX
        ];
        d.add_packet(&fragment(&start_descriptor, &frame[..77]), false).unwrap();

        // Middle fragment: one-byte picture id.
        d.add_packet(&fragment(&[VP9_I_MASK, 0x11], &frame[77..130]), false).unwrap();

        // End fragment: bare descriptor.
        d.add_packet(&fragment(&[0u8], &frame[130..]), true).unwrap();

        assert!(d.frame_complete());
        assert!(d.is_keyframe());
        assert_eq!(&d.take_frame()[..], &frame[..]);
    }

    #[test]
    fn test_scalability_structure_skipped() {
        let mut d = Vp9Depacketizer::new();
        // V set; SS: 2 spatial layers (n_s = 1), Y + G, one picture group
        // entry with 2 reference diffs.
        let descriptor = [
            VP9_B_MASK | VP9_V_MASK,
            0b0011_1000,             // n_s=1, Y, G
            0x01, 0x40, 0x00, 0xb4,  // layer 0: 320x180
            0x02, 0x80, 0x01, 0x68,  // layer 1: 640x360
            0x01,                    // n_g = 1
            0b0000_1000, 0x01, 0x02, // group entry, r=2, two p_diffs
        ];
        d.add_packet(&fragment(&descriptor, &[0xde, 0xad]), true).unwrap();
        assert_eq!(&d.take_frame()[..], &[0xde, 0xad]);
    }

    #[test]
    fn test_flexible_mode_reference_indices() {
        let mut d = Vp9Depacketizer::new();
        // F + P + B: two chained reference bytes then payload.
        let descriptor = [VP9_F_MASK | VP9_P_MASK | VP9_B_MASK, 0x03, 0x02];
        d.add_packet(&fragment(&descriptor, &[0x10, 0x20]), true).unwrap();
        assert_eq!(&d.take_frame()[..], &[0x10, 0x20]);
        assert!(!d.is_keyframe());
    }

    #[test]
    fn test_truncated_descriptor_rejected() {
        let mut d = Vp9Depacketizer::new();
        assert!(d.add_packet(&Bytes::from_static(&[VP9_I_MASK]), false).is_err());
        assert!(d
            .add_packet(&Bytes::from_static(&[VP9_V_MASK | VP9_B_MASK]), false)
            .is_err());
    }
}
