//! Media session configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Media session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Debounce window for consumer batching before a negotiation pass (ms)
    pub negotiation_debounce_ms: u64,
    /// Freshness window for dynamic SSRC assignment: a consumer older than
    /// this is never bound by guess (seconds)
    pub assignment_freshness_secs: u64,
    /// Minimum interval between upstream keyframe requests per stream (ms)
    pub keyframe_request_min_interval_ms: u64,
    /// Consecutive decode failures before a keyframe request is escalated
    pub decode_failure_threshold: u32,
    /// Payload type of synthetic bandwidth-probe packets
    pub probe_payload_type: u8,
    /// SSRC of synthetic bandwidth-probe packets
    pub probe_ssrc: u32,
    /// Capacity of the bounded decoded-frame handoff channel
    pub frame_channel_capacity: usize,
    /// Capacity of the bounded packet intake channel from the transport
    pub packet_channel_capacity: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            negotiation_debounce_ms: 200,
            assignment_freshness_secs: 30,
            keyframe_request_min_interval_ms: 1000,
            decode_failure_threshold: 10,
            probe_payload_type: 127,
            probe_ssrc: 1234,
            frame_channel_capacity: 64,
            packet_channel_capacity: 512,
        }
    }
}

impl MediaConfig {
    #[must_use]
    pub const fn negotiation_debounce(&self) -> Duration {
        Duration::from_millis(self.negotiation_debounce_ms)
    }

    #[must_use]
    pub const fn assignment_freshness(&self) -> Duration {
        Duration::from_secs(self.assignment_freshness_secs)
    }

    #[must_use]
    pub const fn keyframe_request_min_interval(&self) -> Duration {
        Duration::from_millis(self.keyframe_request_min_interval_ms)
    }
}
