//! Node events for monitoring and tests.

use ring_core::{NodeId, ReplicaState, RingTopology};

/// Capacity of the per-node event channel. Slow subscribers lag and skip.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something observable happened on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The coordinator acknowledged our RegisterNode
    Registered { coordinator: NodeId },
    /// This node started an election
    ElectionStarted,
    /// A ring and coordinator were installed locally
    RingAdopted {
        ring: RingTopology,
        coordinator: NodeId,
    },
    /// This node became coordinator
    Promoted,
    /// The local replica was overwritten by a Sync
    ReplicaSynced { replica: ReplicaState },
    /// A peer was removed from the local ring and directory
    PeerPruned { peer: NodeId },
}
