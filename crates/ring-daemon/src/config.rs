//! Runtime configuration for a ring node.

use ring_core::WatchdogConfig;
use std::time::Duration;

/// Timing and failure-handling knobs for a [`crate::Node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// How often the coordinator pushes the replica (default: 5s)
    pub sync_interval: Duration,
    /// Bound on a whole outbound call: dial, request and reply (default: 3s)
    pub rpc_timeout: Duration,
    /// Consecutive Sync failures before a member is pruned (default: 3)
    pub prune_after_failures: u32,
    /// Delay after a Sync before a follower scrambles one replica slot
    /// (default: off)
    pub drift_after: Option<Duration>,
    /// Follower election watchdog
    pub watchdog: WatchdogConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(3),
            prune_after_failures: 3,
            drift_after: None,
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Short timings for tests driving real sockets.
    pub fn fast() -> Self {
        Self {
            sync_interval: Duration::from_millis(100),
            rpc_timeout: Duration::from_millis(500),
            prune_after_failures: 2,
            drift_after: None,
            watchdog: WatchdogConfig {
                check_interval: Duration::from_millis(50),
                base_timeout: Duration::from_millis(600),
                stagger_per_id: Duration::from_millis(150),
            },
        }
    }
}
