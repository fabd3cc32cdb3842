//! SSRC/Index packet router
//!
//! Maps an inbound packet to a consumer with a tiered resolution strategy.
//! The SSRC observed on the wire is not guaranteed to equal the SSRC
//! advertised at registration time, and the stream index reported by the
//! engine is unreliable when several same-kind lines share one transport,
//! so a packet walks the tiers from cheapest to most speculative:
//!
//! 1. learned route (hot path)
//! 2. exact expected-SSRC match
//! 3. retransmission SSRC match (repair packets are dropped)
//! 4. dynamic assignment to the newest unassigned same-kind entry inside
//!    the freshness window
//! 5. payload-type re-bind of an already-bound entry (server SSRC churn)
//! 6. stream-index fallback, kind-checked
//! 7. drop and account
//!
//! A route, once learned, is authoritative over every lower tier. The
//! tiering is deliberately probabilistic-but-bounded: it accepts a small,
//! time-boxed risk of misrouting the very first packet of a newly joined
//! stream in exchange for working even when signaling and the wire
//! disagree on identifiers.

use std::collections::HashMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::consumer::ConsumerRegistry;
use crate::types::{ConsumerId, MediaKind};

/// How a packet was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Deliver to this consumer. `newly_bound` is set when this packet
    /// established the route.
    Deliver {
        consumer_id: ConsumerId,
        newly_bound: bool,
    },
    /// Repair (RTX) packet; the decoder tolerates loss, so it is dropped
    /// instead of being forwarded raw to the depacketizer.
    RepairDropped,
    /// No tier matched. Never fabricate a consumer.
    NoMatch,
}

/// Minimum spacing of warn-level no-match diagnostics.
const MISS_LOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct PacketRouter {
    /// Learned `ssrc -> consumer` routes. At most one live route per SSRC.
    routes: HashMap<u32, ConsumerId>,
    /// `streamIndex -> consumer` map recorded during negotiation passes.
    stream_index: HashMap<u32, ConsumerId>,
    last_miss_log: Option<Instant>,
}

impl PacketRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the media-line index a consumer's track occupies.
    pub fn record_stream_index(&mut self, index: u32, consumer_id: ConsumerId) {
        self.stream_index.insert(index, consumer_id);
    }

    #[must_use]
    pub fn stream_index_map(&self) -> &HashMap<u32, ConsumerId> {
        &self.stream_index
    }

    #[must_use]
    pub fn route_for(&self, ssrc: u32) -> Option<&ConsumerId> {
        self.routes.get(&ssrc)
    }

    /// Resolve an inbound packet to a consumer, establishing a learned
    /// route when a lower tier matches.
    pub fn resolve(
        &mut self,
        registry: &mut ConsumerRegistry,
        ssrc: u32,
        payload_type: u8,
        kind: MediaKind,
        stream_index_hint: Option<u32>,
        freshness: Duration,
    ) -> RouteOutcome {
        // Tier 1: learned route.
        if let Some(consumer_id) = self.routes.get(&ssrc) {
            return RouteOutcome::Deliver {
                consumer_id: consumer_id.clone(),
                newly_bound: false,
            };
        }

        // Tier 2: exact expected-SSRC match. The candidate id is cloned out
        // into a local first so the registry borrow ends before the bind.
        let expected = registry
            .iter()
            .find(|e| e.kind == kind && e.expected_ssrc != 0 && e.expected_ssrc == ssrc)
            .map(|e| e.id.clone());
        if let Some(id) = expected {
            self.bind(registry, ssrc, &id);
            debug!(consumer_id = %id, ssrc, "Bound route via expected SSRC");
            return RouteOutcome::Deliver {
                consumer_id: id,
                newly_bound: true,
            };
        }

        // Tier 3: retransmission stream. Repair payloads are not RTP-payload
        // compatible with the depacketizers, so they are dropped here.
        if registry
            .iter()
            .any(|e| e.kind == kind && e.rtx_ssrc != 0 && e.rtx_ssrc == ssrc)
        {
            return RouteOutcome::RepairDropped;
        }

        // Tier 4: dynamic assignment to the newest unassigned same-kind
        // entry inside the freshness window. Stale entries are skipped, not
        // guessed into.
        let now = Instant::now();
        let mut stale_candidates = 0usize;
        let mut newest: Option<(u64, ConsumerId)> = None;
        for entry in registry.iter() {
            if entry.kind != kind || entry.has_received_rtp {
                continue;
            }
            if !entry.is_fresh(now, freshness) {
                stale_candidates += 1;
                continue;
            }
            if newest.as_ref().is_none_or(|(seq, _)| entry.created_seq > *seq) {
                newest = Some((entry.created_seq, entry.id.clone()));
            }
        }
        if stale_candidates > 0 {
            debug!(
                ssrc,
                stale_candidates,
                "Skipped stale unassigned consumers during dynamic assignment"
            );
        }
        if let Some((_, id)) = newest {
            self.bind(registry, ssrc, &id);
            info!(consumer_id = %id, ssrc, "Dynamically assigned SSRC to newest unassigned consumer");
            return RouteOutcome::Deliver {
                consumer_id: id,
                newly_bound: true,
            };
        }

        // Tier 5: payload-type fallback onto an already-bound entry.
        // Handles server-side SSRC churn by re-binding that consumer's
        // route to the new SSRC.
        let churned = registry
            .iter()
            .filter(|e| e.kind == kind && e.has_received_rtp && e.payload_type == payload_type)
            .max_by_key(|e| e.created_seq)
            .map(|e| e.id.clone());
        if let Some(id) = churned {
            // Purge the consumer's previous routes so the churned stream
            // does not keep two live SSRCs pointing at one depacketizer.
            self.routes.retain(|_, v| v != &id);
            self.bind(registry, ssrc, &id);
            info!(consumer_id = %id, ssrc, payload_type, "Re-bound route after SSRC churn");
            return RouteOutcome::Deliver {
                consumer_id: id,
                newly_bound: true,
            };
        }

        // Tier 6: stream-index fallback, only when the mapped entry's kind
        // matches the packet's media type.
        let indexed = stream_index_hint
            .and_then(|index| self.stream_index.get(&index))
            .cloned();
        if let Some(id) = indexed {
            if registry.get(&id).is_some_and(|e| e.kind == kind) {
                self.bind(registry, ssrc, &id);
                debug!(consumer_id = %id, ssrc, "Bound route via stream index fallback");
                return RouteOutcome::Deliver {
                    consumer_id: id,
                    newly_bound: true,
                };
            }
        }

        // Tier 7: give up.
        if self
            .last_miss_log
            .is_none_or(|t| now.saturating_duration_since(t) >= MISS_LOG_INTERVAL)
        {
            warn!(ssrc, payload_type, kind = %kind, "Unroutable packet dropped");
            self.last_miss_log = Some(now);
        }
        RouteOutcome::NoMatch
    }

    fn bind(&mut self, registry: &mut ConsumerRegistry, ssrc: u32, id: &ConsumerId) {
        self.routes.insert(ssrc, id.clone());
        if let Some(entry) = registry.get_mut(id) {
            entry.has_received_rtp = true;
        }
    }

    /// Drop every route and index mapping referencing a consumer. Called as
    /// part of consumer teardown so a dangling route can never resurrect a
    /// destroyed consumer if its SSRC reappears.
    pub fn purge_consumer(&mut self, id: &ConsumerId) {
        self.routes.retain(|_, v| v != id);
        self.stream_index.retain(|_, v| v != id);
    }

    pub fn clear(&mut self) {
        self.routes.clear();
        self.stream_index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{NewConsumer, RtpCodec, RtpEncoding, RtpParameters, RtxEncoding};
    use crate::types::ProducerId;

    const FRESH: Duration = Duration::from_secs(30);

    fn register(
        registry: &mut ConsumerRegistry,
        id: &str,
        kind: MediaKind,
        ssrc: Option<u32>,
        rtx: Option<u32>,
    ) {
        let mime = match kind {
            MediaKind::Video => "video/VP8",
            MediaKind::Audio => "audio/opus",
        };
        registry
            .insert(&NewConsumer {
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
                        rtx: rtx.map(|ssrc| RtxEncoding { ssrc }),
                    }],
                    header_extensions: vec![],
                },
                producer_paused: false,
            })
            .unwrap();
    }

    fn deliver_to(outcome: RouteOutcome) -> ConsumerId {
        match outcome {
            RouteOutcome::Deliver { consumer_id, .. } => consumer_id,
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expected_ssrc_match_then_learned_route() {
        let mut registry = ConsumerRegistry::new();
        let mut router = PacketRouter::new();
        register(&mut registry, "c1", MediaKind::Video, Some(100), None);

        let outcome = router.resolve(&mut registry, 100, 96, MediaKind::Video, None, FRESH);
        assert_eq!(deliver_to(outcome).as_str(), "c1");
        assert!(registry.get(&ConsumerId::from("c1")).unwrap().has_received_rtp);

        // Second packet takes the learned route.
        let outcome = router.resolve(&mut registry, 100, 96, MediaKind::Video, None, FRESH);
        assert_eq!(
            outcome,
            RouteOutcome::Deliver {
                consumer_id: ConsumerId::from("c1"),
                newly_bound: false
            }
        );
    }

    #[tokio::test]
    async fn test_learned_route_authoritative_over_later_registration() {
        let mut registry = ConsumerRegistry::new();
        let mut router = PacketRouter::new();
        register(&mut registry, "c1", MediaKind::Video, None, None);

        // Dynamic assignment binds ssrc 500 to c1.
        let outcome = router.resolve(&mut registry, 500, 96, MediaKind::Video, None, FRESH);
        assert_eq!(deliver_to(outcome).as_str(), "c1");

        // A later consumer claims ssrc 500 as its expected SSRC; the
        // learned route must still win.
        register(&mut registry, "c2", MediaKind::Video, Some(500), None);
        let outcome = router.resolve(&mut registry, 500, 96, MediaKind::Video, None, FRESH);
        assert_eq!(deliver_to(outcome).as_str(), "c1");
    }

    #[tokio::test]
    async fn test_rtx_dropped() {
        let mut registry = ConsumerRegistry::new();
        let mut router = PacketRouter::new();
        register(&mut registry, "c1", MediaKind::Video, Some(100), Some(101));
        let outcome = router.resolve(&mut registry, 101, 97, MediaKind::Video, None, FRESH);
        assert_eq!(outcome, RouteOutcome::RepairDropped);
    }

    #[tokio::test]
    async fn test_dynamic_assignment_prefers_newest() {
        let mut registry = ConsumerRegistry::new();
        let mut router = PacketRouter::new();
        register(&mut registry, "old", MediaKind::Video, None, None);
        register(&mut registry, "new", MediaKind::Video, None, None);

        let outcome = router.resolve(&mut registry, 777, 96, MediaKind::Video, None, FRESH);
        assert_eq!(deliver_to(outcome).as_str(), "new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_boundary_skips_stale_entry() {
        let mut registry = ConsumerRegistry::new();
        let mut router = PacketRouter::new();
        register(&mut registry, "stale", MediaKind::Video, None, None);

        tokio::time::advance(FRESH + Duration::from_secs(1)).await;

        // Tier 4 must skip the stale entry; with no index hint resolution
        // falls all the way through.
        let outcome = router.resolve(&mut registry, 888, 96, MediaKind::Video, None, FRESH);
        assert_eq!(outcome, RouteOutcome::NoMatch);
        assert!(!registry.get(&ConsumerId::from("stale")).unwrap().has_received_rtp);
    }

    #[tokio::test]
    async fn test_payload_type_rebind_on_ssrc_churn() {
        let mut registry = ConsumerRegistry::new();
        let mut router = PacketRouter::new();
        register(&mut registry, "c1", MediaKind::Video, Some(100), None);

        // Bind via expected SSRC first.
        router.resolve(&mut registry, 100, 96, MediaKind::Video, None, FRESH);

        // Server churns the SSRC: same payload type, new SSRC, consumer
        // already bound. Tier 5 re-binds and purges the old route.
        let outcome = router.resolve(&mut registry, 200, 96, MediaKind::Video, None, FRESH);
        assert_eq!(deliver_to(outcome).as_str(), "c1");
        assert!(router.route_for(100).is_none());
        assert_eq!(router.route_for(200).map(ConsumerId::as_str), Some("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_index_fallback_kind_checked() {
        let mut registry = ConsumerRegistry::new();
        let mut router = PacketRouter::new();
        register(&mut registry, "v1", MediaKind::Video, None, None);
        register(&mut registry, "a1", MediaKind::Audio, None, None);
        router.record_stream_index(0, ConsumerId::from("v1"));
        router.record_stream_index(1, ConsumerId::from("a1"));

        // Age both entries out of the dynamic-assignment window so tier 6
        // is actually exercised.
        tokio::time::advance(FRESH + Duration::from_secs(1)).await;

        // Audio packet pointing at the video index must never cross kinds.
        let outcome = router.resolve(&mut registry, 333, 100, MediaKind::Audio, Some(0), FRESH);
        assert_eq!(outcome, RouteOutcome::NoMatch);

        let outcome = router.resolve(&mut registry, 333, 100, MediaKind::Audio, Some(1), FRESH);
        assert_eq!(deliver_to(outcome).as_str(), "a1");
    }

    #[tokio::test]
    async fn test_purge_consumer_prevents_resurrection() {
        let mut registry = ConsumerRegistry::new();
        let mut router = PacketRouter::new();
        register(&mut registry, "c1", MediaKind::Video, Some(100), None);
        router.record_stream_index(0, ConsumerId::from("c1"));
        router.resolve(&mut registry, 100, 96, MediaKind::Video, None, FRESH);

        registry.remove(&ConsumerId::from("c1"));
        router.purge_consumer(&ConsumerId::from("c1"));

        let outcome = router.resolve(&mut registry, 100, 96, MediaKind::Video, Some(0), FRESH);
        assert_eq!(outcome, RouteOutcome::NoMatch);
        assert!(router.stream_index_map().is_empty());
    }
}
