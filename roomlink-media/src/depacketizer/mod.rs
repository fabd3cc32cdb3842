//! Codec depacketizers
//!
//! Reassemble codec frames from RTP payloads. Each consumer owns one
//! depacketizer, selected once from the negotiated MIME type; there is no
//! shared state across consumers or codecs. The common contract:
//!
//! - `add_packet(payload, is_last)` strips the codec's descriptor header
//!   and accumulates the remaining fragment;
//! - `frame_complete()` turns true once the last-packet marker is seen;
//! - `is_keyframe()` reflects the most recent start-of-frame fragment;
//! - `take_frame()` concatenates fragments in arrival order;
//! - `reset()` clears all accumulated state for the next frame.
//!
//! A malformed descriptor discards only the offending fragment; the
//! accumulated state is left intact to await the next marker-bit frame
//! boundary.

mod h264;
mod vp8;
mod vp9;

pub use h264::H264Depacketizer;
pub use vp8::Vp8Depacketizer;
pub use vp9::Vp9Depacketizer;

use bytes::Bytes;

use crate::error::MediaError;
use crate::types::CodecKind;

/// Tagged-variant depacketizer, enum-dispatched per consumer.
#[derive(Debug, Clone)]
pub enum Depacketizer {
    Vp8(Vp8Depacketizer),
    Vp9(Vp9Depacketizer),
    H264(H264Depacketizer),
}

impl Depacketizer {
    /// Select a depacketizer for a negotiated codec. Audio codecs carry
    /// one complete frame per packet and need none.
    #[must_use]
    pub fn for_codec(codec: CodecKind) -> Option<Self> {
        match codec {
            CodecKind::Vp8 => Some(Self::Vp8(Vp8Depacketizer::new())),
            CodecKind::Vp9 => Some(Self::Vp9(Vp9Depacketizer::new())),
            CodecKind::H264 => Some(Self::H264(H264Depacketizer::new())),
            CodecKind::Opus => None,
        }
    }

    /// Strip the descriptor from one RTP payload and accumulate the
    /// fragment. `is_last` is the RTP marker bit.
    pub fn add_packet(&mut self, payload: &Bytes, is_last: bool) -> Result<(), MediaError> {
        match self {
            Self::Vp8(d) => d.add_packet(payload, is_last),
            Self::Vp9(d) => d.add_packet(payload, is_last),
            Self::H264(d) => d.add_packet(payload, is_last),
        }
    }

    #[must_use]
    pub fn frame_complete(&self) -> bool {
        match self {
            Self::Vp8(d) => d.frame_complete(),
            Self::Vp9(d) => d.frame_complete(),
            Self::H264(d) => d.frame_complete(),
        }
    }

    #[must_use]
    pub fn is_keyframe(&self) -> bool {
        match self {
            Self::Vp8(d) => d.is_keyframe(),
            Self::Vp9(d) => d.is_keyframe(),
            Self::H264(d) => d.is_keyframe(),
        }
    }

    /// The reassembled frame accumulated so far, fragments concatenated in
    /// arrival order.
    pub fn take_frame(&mut self) -> Bytes {
        match self {
            Self::Vp8(d) => d.take_frame(),
            Self::Vp9(d) => d.take_frame(),
            Self::H264(d) => d.take_frame(),
        }
    }

    /// Return to the empty state. Fragments are never retained across a
    /// completed-frame boundary.
    pub fn reset(&mut self) {
        match self {
            Self::Vp8(d) => d.reset(),
            Self::Vp9(d) => d.reset(),
            Self::H264(d) => d.reset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection() {
        assert!(matches!(
            Depacketizer::for_codec(CodecKind::Vp8),
            Some(Depacketizer::Vp8(_))
        ));
        assert!(matches!(
            Depacketizer::for_codec(CodecKind::Vp9),
            Some(Depacketizer::Vp9(_))
        ));
        assert!(matches!(
            Depacketizer::for_codec(CodecKind::H264),
            Some(Depacketizer::H264(_))
        ));
        assert!(Depacketizer::for_codec(CodecKind::Opus).is_none());
    }
}
