//! Decode/encode collaborator interface
//!
//! The pixel-level codec back-ends (FFmpeg video decoders, Opus) live
//! outside this core. They are reached through these narrow traits, and
//! the factory handle is created once at startup and threaded through the
//! session constructor rather than lazily initialized process-global
//! state.

use bytes::Bytes;

use crate::types::{CodecKind, ConsumerId, MediaKind};

/// A decoded frame ready for the rendering collaborator. Audio decoders
/// report zero dimensions.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

/// An encoded frame produced by the outbound pipeline.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub is_keyframe: bool,
}

/// Decodes reassembled frames for one consumer.
///
/// `Ok(None)` means the frame was consumed but no picture is ready yet
/// (decoder priming); `Err` is a decode failure, which the session counts
/// toward the keyframe-request escalation instead of aborting the stream.
pub trait FrameDecoder: Send {
    fn decode(&mut self, frame: &[u8]) -> anyhow::Result<Option<DecodedFrame>>;
}

/// Encodes raw frames for the outbound direction. A keyframe can be
/// forced on the next frame when feedback demands one.
pub trait FrameEncoder: Send {
    fn encode(&mut self, data: &[u8], width: u32, height: u32) -> anyhow::Result<Option<EncodedFrame>>;

    fn force_keyframe(&mut self);
}

/// Creates one decoder per consumer from the negotiated codec.
pub trait DecoderFactory: Send + Sync {
    fn create(&self, kind: MediaKind, codec: CodecKind) -> anyhow::Result<Box<dyn FrameDecoder>>;
}

/// A reassembled-and-decoded frame tagged with its consumer, handed to the
/// rendering collaborator over the bounded frame channel.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub consumer_id: ConsumerId,
    pub kind: MediaKind,
    pub is_keyframe: bool,
    pub frame: DecodedFrame,
}
