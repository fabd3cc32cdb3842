//! `RoomLink` media transport core
//!
//! Client-side media engine for multi-party conferencing against an SFU
//! (Selective Forwarding Unit) room server. One WebRTC transport carries
//! every remote participant's streams; this crate owns everything between
//! the wire and the codec back-ends:
//!
//! - **`MediaSession`**: per-transport actor owning the consumer registry,
//!   negotiation scheduling and the packet dispatch path
//! - **`ConsumerRegistry`** / **`PacketRouter`**: tiered SSRC-to-consumer
//!   resolution for streams multiplexed on the shared transport
//! - **`Depacketizer`**: VP8 / VP9 / H.264 frame reassembly from RTP
//! - **`KeyframeThrottle`**: rate-limited keyframe recovery, both upstream
//!   (via signaling) and for the local encoder (via RTCP feedback)
//!
//! The ICE/DTLS engine, the signaling channel and the pixel-level codecs
//! are collaborators injected through traits ([`WebRtcEngine`],
//! [`SignalingClient`], [`DecoderFactory`]); this crate never owns a
//! socket or a decoder implementation.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomlink_media::{MediaConfig, MediaSession, TransportId};
//!
//! let session = MediaSession::new(
//!     TransportId::from("transport-1"),
//!     MediaConfig::default(),
//!     engine,
//!     signaling,
//!     decoders,
//! );
//! session.initialize(ice, candidates, dtls).await?;
//! session.connect().await?;
//! session.register_consumer(announcement).await?;
//! let frames = session.take_frame_receiver();
//! ```

mod codec_io;
mod config;
mod consumer;
mod depacketizer;
mod error;
mod keyframe;
mod router;
mod rtp;
mod sdp;
mod session;
mod signaling;
mod transport;
mod types;

pub use codec_io::{
    DecodedFrame, DecoderFactory, EncodedFrame, FrameDecoder, FrameEncoder, MediaFrame,
};
pub use config::MediaConfig;
pub use consumer::{ConsumerEntry, ConsumerRegistry};
pub use depacketizer::Depacketizer;
pub use error::{MediaError, Result};
pub use keyframe::{FailureStreak, KeyframeThrottle, ThrottleKey};
pub use router::{PacketRouter, RouteOutcome};
pub use rtp::RtpPacket;
pub use sdp::{DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters};
pub use session::{
    ConsumerStats, MediaSession, SessionEvent, SessionSnapshot, SessionStats,
};
pub use signaling::{
    NewConsumer, RtpCodec, RtpEncoding, RtpHeaderExtension, RtpParameters, RtxEncoding,
    SignalingClient,
};
pub use transport::{EngineConnectionState, TransportSession, TransportState, WebRtcEngine};
pub use types::{CodecKind, ConsumerId, MediaKind, ProducerId, TransportId};
