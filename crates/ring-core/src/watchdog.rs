//! Follower-side coordinator failure detection.
//!
//! A follower that has not received a Sync for longer than its threshold
//! assumes the coordinator is gone and starts an election. Thresholds are
//! staggered by id so that concurrent initiators are rare; a concurrent
//! start is still safe because the highest id wins either way.

use crate::NodeId;
use std::time::{Duration, Instant};

/// Configuration for the election watchdog.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// How often the watchdog checks (default: 1s)
    pub check_interval: Duration,
    /// Silence tolerated by node 0 (default: 6s)
    pub base_timeout: Duration,
    /// Extra silence tolerated per id (default: 1s)
    pub stagger_per_id: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            base_timeout: Duration::from_secs(6),
            stagger_per_id: Duration::from_secs(1),
        }
    }
}

impl WatchdogConfig {
    /// Silence threshold for `id`: `base_timeout + id * stagger_per_id`.
    pub fn threshold(&self, id: NodeId) -> Duration {
        self.base_timeout + self.stagger_per_id.saturating_mul(id.as_u32())
    }
}

/// Tracks the last moment the coordinator was heard from.
#[derive(Debug, Clone)]
pub struct ElectionWatchdog {
    threshold: Duration,
    last_sync: Instant,
}

impl ElectionWatchdog {
    pub fn new(config: &WatchdogConfig, id: NodeId, now: Instant) -> Self {
        Self {
            threshold: config.threshold(id),
            last_sync: now,
        }
    }

    /// Record coordinator activity (Sync received, or an election touched us).
    pub fn refresh(&mut self, now: Instant) {
        self.last_sync = now;
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Time since the coordinator was last heard from.
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_sync)
    }

    /// Whether the silence has exceeded the threshold.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.silence(now) > self.threshold
    }
}
