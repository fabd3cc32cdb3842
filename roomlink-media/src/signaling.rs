//! Signaling collaborator contract
//!
//! Wire payloads exchanged with the room server (camelCase JSON) and the
//! narrow request surface this core consumes. The transport choice behind
//! the trait (WebSocket, HTTP long-poll, ...) is the shell's business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use crate::sdp::DtlsParameters;

/// One negotiated codec inside `rtpParameters`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodec {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
}

impl RtpCodec {
    /// Whether this codec entry describes a retransmission stream.
    #[must_use]
    pub fn is_rtx(&self) -> bool {
        self.mime_type.to_ascii_lowercase().ends_with("/rtx")
    }
}

/// Retransmission stream of one encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtxEncoding {
    pub ssrc: u32,
}

/// One encoding inside `rtpParameters`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncoding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtxEncoding>,
}

/// One negotiated RTP header extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    pub uri: String,
    pub id: u16,
}

/// RTP parameters of one producer or consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    pub codecs: Vec<RtpCodec>,
    #[serde(default)]
    pub encodings: Vec<RtpEncoding>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtension>,
}

impl RtpParameters {
    /// The primary (non-RTX) codec of these parameters.
    #[must_use]
    pub fn primary_codec(&self) -> Option<&RtpCodec> {
        self.codecs.iter().find(|c| !c.is_rtx())
    }

    /// Advertised media SSRC of the first encoding, if any.
    #[must_use]
    pub fn primary_ssrc(&self) -> Option<u32> {
        self.encodings.first().and_then(|e| e.ssrc)
    }

    /// Advertised RTX SSRC of the first encoding, if any.
    #[must_use]
    pub fn rtx_ssrc(&self) -> Option<u32> {
        self.encodings
            .first()
            .and_then(|e| e.rtx.as_ref())
            .map(|rtx| rtx.ssrc)
    }
}

/// `newConsumer` notification announcing one remote stream to pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConsumer {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub producer_paused: bool,
}

/// Requests this core sends to the room server.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// `connectWebRtcTransport`: hand the server our DTLS parameters once
    /// they are known locally.
    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> anyhow::Result<()>;

    /// `produce`: register an outbound stream, returning the server-assigned
    /// producer id.
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        source: &str,
    ) -> anyhow::Result<ProducerId>;

    /// Ask the server to have a producer emit a keyframe for one of our
    /// consumers. Callers are expected to rate-limit.
    async fn request_keyframe(&self, consumer_id: &ConsumerId) -> anyhow::Result<()>;
}
