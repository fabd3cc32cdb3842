//! VP8 payload descriptor handling (RFC 7741)

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::MediaError;

// Required descriptor byte
const VP8_X_MASK: u8 = 0b1000_0000;
const VP8_S_MASK: u8 = 0b0001_0000;
const VP8_PID_MASK: u8 = 0b0000_0111;

// Extension byte
const VP8_I_MASK: u8 = 0b1000_0000;
const VP8_L_MASK: u8 = 0b0100_0000;
const VP8_T_MASK: u8 = 0b0010_0000;
const VP8_K_MASK: u8 = 0b0001_0000;

// Picture ID extension flag
const VP8_M_MASK: u8 = 0b1000_0000;

// First VP8 payload byte: frame type lives in the low bit (0 = keyframe).
const VP8_P_MASK: u8 = 0b0000_0001;

#[derive(Debug, Clone, Default)]
pub struct Vp8Depacketizer {
    buffer: BytesMut,
    frame_complete: bool,
    keyframe: bool,
}

impl Vp8Depacketizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_packet(&mut self, payload: &Bytes, is_last: bool) -> Result<(), MediaError> {
        if payload.is_empty() {
            return Err(MediaError::depacketize("empty VP8 payload"));
        }

        let b0 = payload[0];
        let start_of_partition = b0 & VP8_S_MASK != 0;
        let partition_index = b0 & VP8_PID_MASK;
        let mut offset = 1;

        if b0 & VP8_X_MASK != 0 {
            if payload.len() <= offset {
                return Err(MediaError::depacketize("truncated VP8 extension byte"));
            }
            let ext = payload[offset];
            offset += 1;

            if ext & VP8_I_MASK != 0 {
                if payload.len() <= offset {
                    return Err(MediaError::depacketize("truncated VP8 picture id"));
                }
                // 15-bit picture id spans a second byte when M is set.
                if payload[offset] & VP8_M_MASK != 0 {
                    offset += 1;
                }
                offset += 1;
            }
            if ext & VP8_L_MASK != 0 {
                offset += 1;
            }
            if ext & (VP8_T_MASK | VP8_K_MASK) != 0 {
                offset += 1;
            }
        }

        if payload.len() <= offset {
            return Err(MediaError::depacketize("VP8 descriptor consumed whole payload"));
        }

        // Keyframe detection only applies to the fragment that starts the
        // frame: S bit set and partition index 0.
        if start_of_partition && partition_index == 0 {
            self.keyframe = payload[offset] & VP8_P_MASK == 0;
        }

        self.buffer.put_slice(&payload[offset..]);
        if is_last {
            self.frame_complete = true;
        }
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

    fn fragment(descriptor: &[u8], body: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(descriptor);
        buf.put_slice(body);
        buf.freeze()
    }

    #[test]
    fn test_keyframe_low_bit() {
        let mut d = Vp8Depacketizer::new();
        // S bit set, partition 0, first payload byte has low bit 0.
        d.add_packet(&fragment(&[VP8_S_MASK], &[0x00, 0xaa]), true).unwrap();
        assert!(d.frame_complete());
        assert!(d.is_keyframe());

        d.reset();
        // Flipping the low bit makes it an interframe.
        d.add_packet(&fragment(&[VP8_S_MASK], &[0x01, 0xaa]), true).unwrap();
        assert!(!d.is_keyframe());
    }

    #[test]
    fn test_multi_fragment_round_trip() {
        let frame: Vec<u8> = (0u8..=250).collect();
        let mut d = Vp8Depacketizer::new();
        let chunks: Vec<&[u8]> = vec![&frame[..40], &frame[40..41], &frame[41..200], &frame[200..]];
        for (i, chunk) in chunks.iter().enumerate() {
            let descriptor = if i == 0 { [VP8_S_MASK] } else { [0u8] };
            let last = i == chunks.len() - 1;
            d.add_packet(&fragment(&descriptor, chunk), last).unwrap();
        }
        assert!(d.frame_complete());
        assert_eq!(&d.take_frame()[..], &frame[..]);
    }

    #[test]
    fn test_extension_bytes_stripped() {
        let mut d = Vp8Depacketizer::new();
        // X + S, extension byte with I+L+T, two-byte picture id (M set).
        let descriptor = [
            VP8_X_MASK | VP8_S_MASK,
            VP8_I_MASK | VP8_L_MASK | VP8_T_MASK,
            VP8_M_MASK | 0x12,
            0x34,
            0x00, // TL0PICIDX
            0x00, // TID/KEYIDX
        ];
        d.add_packet(&fragment(&descriptor, &[0x00, 0x01, 0x02]), true).unwrap();
        assert_eq!(&d.take_frame()[..], &[0x00, 0x01, 0x02]);
        assert!(d.is_keyframe());
    }

    #[test]
    fn test_malformed_leaves_state_intact() {
        let mut d = Vp8Depacketizer::new();
        d.add_packet(&fragment(&[VP8_S_MASK], &[0x00, 0x01]), false).unwrap();
        // Descriptor claims an extension byte that is not there.
        assert!(d.add_packet(&Bytes::from_static(&[VP8_X_MASK]), false).is_err());
        assert!(!d.frame_complete());
        // Accumulated fragment survives the malformed packet.
        d.add_packet(&fragment(&[0u8], &[0x02]), true).unwrap();
        assert_eq!(&d.take_frame()[..], &[0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut d = Vp8Depacketizer::new();
        d.add_packet(&fragment(&[VP8_S_MASK], &[0x00, 0x01]), true).unwrap();
        d.reset();
        assert!(!d.frame_complete());
        assert!(!d.is_keyframe());
        assert!(d.take_frame().is_empty());
    }
}
