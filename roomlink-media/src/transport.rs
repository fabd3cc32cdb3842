//! Transport session state and the underlying ICE/DTLS engine seam
//!
//! `TransportSession` is owned exclusively by the session actor; the
//! negotiation logic has call-level access only and never mutates state
//! from outside the actor. The concrete ICE/DTLS engine is injected as a
//! `WebRtcEngine` handle created once at startup.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

use crate::sdp::{DtlsParameters, IceCandidate, IceParameters};
use crate::types::{CodecKind, MediaKind};

/// Transport lifecycle. `Closed` is terminal and releases every owned
/// resource synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Connectivity transitions reported by the ICE/DTLS engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineConnectionState {
    Connected,
    Disconnected,
    Failed,
}

/// Remote transport parameters plus local connection bookkeeping.
#[derive(Debug)]
pub struct TransportSession {
    state: TransportState,
    ice_parameters: Option<IceParameters>,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: Option<DtlsParameters>,
    pub recv_video_tracks: u32,
    pub recv_audio_tracks: u32,
    pub send_video_tracks: u32,
    pub send_audio_tracks: u32,
}

impl TransportSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: TransportState::New,
            ice_parameters: None,
            ice_candidates: Vec::new(),
            dtls_parameters: None,
            recv_video_tracks: 0,
            recv_audio_tracks: 0,
            send_video_tracks: 0,
            send_audio_tracks: 0,
        }
    }

    /// Store the server-side transport parameters. A second call is a
    /// warning-level no-op, not an error.
    pub fn initialize(
        &mut self,
        ice: IceParameters,
        candidates: Vec<IceCandidate>,
        dtls: DtlsParameters,
    ) {
        if self.ice_parameters.is_some() {
            warn!("Transport already initialized, ignoring duplicate initialize call");
            return;
        }
        info!(
            candidates = candidates.len(),
            ice_lite = ice.ice_lite,
            "Transport initialized with remote ICE/DTLS parameters"
        );
        self.ice_parameters = Some(ice);
        self.ice_candidates = candidates;
        self.dtls_parameters = Some(dtls);
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.ice_parameters.is_some()
    }

    #[must_use]
    pub fn remote_parameters(
        &self,
    ) -> Option<(&IceParameters, &[IceCandidate], &DtlsParameters)> {
        match (&self.ice_parameters, &self.dtls_parameters) {
            (Some(ice), Some(dtls)) => Some((ice, &self.ice_candidates, dtls)),
            _ => None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> TransportState {
        self.state
    }

    /// Transition the state machine. Transitions out of `Closed` are
    /// refused; everything else follows the engine.
    pub fn set_state(&mut self, next: TransportState) -> bool {
        if self.state == TransportState::Closed || self.state == next {
            return false;
        }
        info!(from = %self.state, to = %next, "Transport state changed");
        self.state = next;
        true
    }

    pub fn record_recv_track(&mut self, kind: MediaKind) {
        match kind {
            MediaKind::Video => self.recv_video_tracks += 1,
            MediaKind::Audio => self.recv_audio_tracks += 1,
        }
    }

    pub fn record_send_track(&mut self, kind: MediaKind) {
        match kind {
            MediaKind::Video => self.send_video_tracks += 1,
            MediaKind::Audio => self.send_audio_tracks += 1,
        }
    }
}

impl Default for TransportSession {
    fn default() -> Self {
        Self::new()
    }
}

/// The underlying ICE/DTLS engine driving the single multiplexed channel.
///
/// Implementations wrap a concrete WebRTC stack; this core drives the
/// session-description dance and outbound sending through the seam and
/// receives raw packets and connectivity events back through the
/// `MediaSession` handle.
#[async_trait]
pub trait WebRtcEngine: Send + Sync {
    /// Local DTLS parameters (role + certificate fingerprints), needed for
    /// the `connectWebRtcTransport` handshake step.
    async fn local_dtls_parameters(&self) -> anyhow::Result<DtlsParameters>;

    /// Append a receive-only track of the given codec. Returns the
    /// media-line index the track occupies; tracks are append-only and
    /// never reordered or removed.
    async fn add_recv_track(
        &self,
        kind: MediaKind,
        codec: CodecKind,
        payload_type: u8,
        clock_rate: u32,
    ) -> anyhow::Result<u32>;

    async fn set_remote_description(&self, sdp: &str) -> anyhow::Result<()>;

    /// Generate the local answer-equivalent description.
    async fn create_local_description(&self) -> anyhow::Result<String>;

    async fn set_local_description(&self, sdp: &str) -> anyhow::Result<()>;

    /// Start ICE/DTLS. Called exactly once per session; later negotiation
    /// passes reuse the running transport.
    async fn start(&self) -> anyhow::Result<()>;

    /// Send one outbound media packet on the multiplexed channel.
    async fn send_media(&self, packet: Bytes) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

impl From<EngineConnectionState> for TransportState {
    fn from(state: EngineConnectionState) -> Self {
        match state {
            EngineConnectionState::Connected => Self::Connected,
            EngineConnectionState::Disconnected => Self::Disconnected,
            EngineConnectionState::Failed => Self::Failed,
        }
    }
}
