//! Keyframe request throttle
//!
//! Upstream keyframe requests are triggered from two directions: sustained
//! decode failures on a consumer, and RTCP receiver reports observed on a
//! video stream (treated as a PLI/FIR proxy, since this layer does not
//! parse payload-specific feedback). Both funnel through this per-key
//! minimum-interval limiter so a struggling stream cannot spam the server
//! or the local encoder.

use std::collections::HashMap;
use tokio::time::{Duration, Instant};

/// What a keyframe request is aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ThrottleKey {
    /// Ask the server to have a remote producer emit a keyframe.
    Consumer(crate::types::ConsumerId),
    /// Ask the local encoder for a keyframe on the outbound stream.
    LocalEncoder,
}

#[derive(Debug)]
pub struct KeyframeThrottle {
    min_interval: Duration,
    last_request: HashMap<ThrottleKey, Instant>,
}

impl KeyframeThrottle {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: HashMap::new(),
        }
    }

    /// Whether a request for this key may go out now. Recording happens on
    /// admission, so a suppressed request does not extend the window.
    pub fn allow(&mut self, key: ThrottleKey) -> bool {
        let now = Instant::now();
        match self.last_request.get(&key) {
            Some(last) if now.saturating_duration_since(*last) < self.min_interval => false,
            _ => {
                self.last_request.insert(key, now);
                true
            }
        }
    }

    /// Forget a key, typically on consumer teardown.
    pub fn forget(&mut self, key: &ThrottleKey) {
        self.last_request.remove(key);
    }

    pub fn clear(&mut self) {
        self.last_request.clear();
    }
}

/// Tracks consecutive decode failures for one consumer; crossing the
/// threshold arms a keyframe request.
#[derive(Debug, Default)]
pub struct FailureStreak {
    consecutive: u32,
}

impl FailureStreak {
    /// Record one failure; returns true when the streak reaches the
    /// threshold. The streak restarts after firing so the next escalation
    /// needs a full run of fresh failures.
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        self.consecutive += 1;
        if self.consecutive >= threshold {
            self.consecutive = 0;
            true
        } else {
            false
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConsumerId;

    #[tokio::test(start_paused = true)]
    async fn test_throttle_window() {
        let mut throttle = KeyframeThrottle::new(Duration::from_secs(1));
        let key = ThrottleKey::Consumer(ConsumerId::from("c1"));

        assert!(throttle.allow(key.clone()));
        assert!(!throttle.allow(key.clone()));

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(throttle.allow(key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let mut throttle = KeyframeThrottle::new(Duration::from_secs(1));
        assert!(throttle.allow(ThrottleKey::Consumer(ConsumerId::from("c1"))));
        assert!(throttle.allow(ThrottleKey::Consumer(ConsumerId::from("c2"))));
        assert!(throttle.allow(ThrottleKey::LocalEncoder));
    }

    #[test]
    fn test_failure_streak() {
        let mut streak = FailureStreak::default();
        assert!(!streak.record_failure(3));
        assert!(!streak.record_failure(3));
        assert!(streak.record_failure(3));
        // Streak restarts after firing.
        assert!(!streak.record_failure(3));
        streak.record_success();
        assert!(!streak.record_failure(3));
        assert!(!streak.record_failure(3));
    }
}
