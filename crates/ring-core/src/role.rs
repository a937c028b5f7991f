//! Node roles and follower sub-phases.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// The role a node currently plays.
///
/// A node is in exactly one role at a time and only ever moves from
/// follower to coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Follower,
    Coordinator,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Coordinator => write!(f, "coordinator"),
        }
    }
}

/// What a follower is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FollowerPhase {
    /// Waiting for Sync
    #[default]
    Idle,
    /// Took part in an election pass that has not been announced yet
    DiscoveryInProgress,
    /// Finished a pass and is handing the ring to the winner
    AnnouncePending,
    /// Won the election; the role swap is underway
    PromotingToCoordinator,
}
