//! Consumer registry
//!
//! One entry per remote logical stream. The registry is owned by the
//! session actor; every mutation is serialized through its command loop,
//! so the plain map here needs no locking of its own.

use std::collections::HashMap;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::error::MediaError;
use crate::signaling::NewConsumer;
use crate::types::{CodecKind, ConsumerId, MediaKind};

/// Per-consumer metadata for routing and negotiation.
#[derive(Debug, Clone)]
pub struct ConsumerEntry {
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub codec: CodecKind,
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    /// SSRC advertised at registration time; 0 when unknown. The wire may
    /// disagree, which is what the router's lower tiers are for.
    pub expected_ssrc: u32,
    /// Retransmission SSRC; 0 when the encoding has no RTX stream.
    pub rtx_ssrc: u32,
    pub created_at: Instant,
    /// Strictly increasing registration sequence. `created_at` alone is not
    /// guaranteed distinct on coarse clocks, and media-line order must be
    /// deterministic.
    pub created_seq: u64,
    /// Latched on the first successful dispatch.
    pub has_received_rtp: bool,
    /// Media-line/track index occupied after a negotiation pass.
    pub track_index: Option<u32>,
}

impl ConsumerEntry {
    /// Whether the entry is still young enough for dynamic SSRC assignment.
    #[must_use]
    pub fn is_fresh(&self, now: Instant, freshness: Duration) -> bool {
        now.saturating_duration_since(self.created_at) <= freshness
    }
}

/// Registry of all live consumers, iterable in registration order.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    entries: HashMap<ConsumerId, ConsumerEntry>,
    next_seq: u64,
}

impl ConsumerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer from a `newConsumer` notification.
    ///
    /// Exactly one entry may exist per consumer id; a duplicate id is
    /// rejected rather than silently replacing a live stream.
    pub fn insert(&mut self, announcement: &NewConsumer) -> Result<&ConsumerEntry, MediaError> {
        if self.entries.contains_key(&announcement.consumer_id) {
            return Err(MediaError::AlreadyExists(format!(
                "consumer {}",
                announcement.consumer_id
            )));
        }

        let codec_params = announcement
            .rtp_parameters
            .primary_codec()
            .ok_or_else(|| {
                MediaError::InvalidParameters(format!(
                    "consumer {} has no non-RTX codec",
                    announcement.consumer_id
                ))
            })?;
        let codec = CodecKind::from_mime_type(&codec_params.mime_type)?;
        if codec.kind() != announcement.kind {
            return Err(MediaError::InvalidParameters(format!(
                "codec {} does not match kind {}",
                codec_params.mime_type, announcement.kind
            )));
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = ConsumerEntry {
            id: announcement.consumer_id.clone(),
            kind: announcement.kind,
            codec,
            mime_type: codec_params.mime_type.clone(),
            payload_type: codec_params.payload_type,
            clock_rate: codec_params.clock_rate,
            expected_ssrc: announcement.rtp_parameters.primary_ssrc().unwrap_or(0),
            rtx_ssrc: announcement.rtp_parameters.rtx_ssrc().unwrap_or(0),
            created_at: Instant::now(),
            created_seq: seq,
            has_received_rtp: false,
            track_index: None,
        };

        debug!(
            consumer_id = %entry.id,
            kind = %entry.kind,
            mime_type = %entry.mime_type,
            expected_ssrc = entry.expected_ssrc,
            rtx_ssrc = entry.rtx_ssrc,
            created_seq = seq,
            "Registered consumer"
        );

        Ok(self
            .entries
            .entry(announcement.consumer_id.clone())
            .or_insert(entry))
    }

    pub fn remove(&mut self, id: &ConsumerId) -> Option<ConsumerEntry> {
        self.entries.remove(id)
    }

    #[must_use]
    pub fn get(&self, id: &ConsumerId) -> Option<&ConsumerEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &ConsumerId) -> Option<&mut ConsumerEntry> {
        self.entries.get_mut(id)
    }

    #[must_use]
    pub fn contains(&self, id: &ConsumerId) -> bool {
        self.entries.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConsumerEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConsumerEntry> {
        self.entries.values_mut()
    }

    /// All entries sorted by registration order. This ordering is what keeps
    /// locally generated media lines aligned with the transport's
    /// append-only track list.
    #[must_use]
    pub fn ordered(&self) -> Vec<&ConsumerEntry> {
        let mut entries: Vec<&ConsumerEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.created_seq);
        entries
    }

    /// Whether any entry still lacks a backing track.
    #[must_use]
    pub fn has_unbacked(&self) -> bool {
        self.entries.values().any(|e| e.track_index.is_none())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{RtpCodec, RtpEncoding, RtpParameters, RtxEncoding};
    use crate::types::ProducerId;

    fn announcement(id: &str, kind: MediaKind, mime: &str, ssrc: Option<u32>) -> NewConsumer {
        NewConsumer {
            consumer_id: ConsumerId::from(id),
            producer_id: ProducerId::from("p"),
            kind,
            rtp_parameters: RtpParameters {
                codecs: vec![RtpCodec {
                    mime_type: mime.to_string(),
                    payload_type: 96,
                    clock_rate: 90_000,
                    channels: None,
                }],
                encodings: vec![RtpEncoding {
                    ssrc,
                    rtx: Some(RtxEncoding { ssrc: 9999 }),
                }],
                header_extensions: vec![],
            },
            producer_paused: false,
        }
    }

    #[tokio::test]
    async fn test_insert_and_ordering() {
        let mut registry = ConsumerRegistry::new();
        registry
            .insert(&announcement("b", MediaKind::Video, "video/VP8", Some(1)))
            .unwrap();
        registry
            .insert(&announcement("a", MediaKind::Video, "video/VP9", Some(2)))
            .unwrap();
        let ordered: Vec<&str> = registry.ordered().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ordered, vec!["b", "a"]);
        assert!(registry.ordered()[0].created_seq < registry.ordered()[1].created_seq);
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let mut registry = ConsumerRegistry::new();
        let nc = announcement("c1", MediaKind::Video, "video/VP8", Some(1));
        registry.insert(&nc).unwrap();
        assert!(matches!(
            registry.insert(&nc),
            Err(MediaError::AlreadyExists(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_kind_mismatch_rejected() {
        let mut registry = ConsumerRegistry::new();
        let nc = announcement("c1", MediaKind::Audio, "video/VP8", Some(1));
        assert!(matches!(
            registry.insert(&nc),
            Err(MediaError::InvalidParameters(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_window() {
        let mut registry = ConsumerRegistry::new();
        registry
            .insert(&announcement("c1", MediaKind::Video, "video/VP8", None))
            .unwrap();
        let freshness = Duration::from_secs(30);
        let entry = registry.get(&ConsumerId::from("c1")).unwrap().clone();
        assert!(entry.is_fresh(Instant::now(), freshness));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!entry.is_fresh(Instant::now(), freshness));
    }
}
