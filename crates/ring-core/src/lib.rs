//! ring-core: membership ring, ring election and replica sync protocol.
//!
//! This crate provides the runtime-free parts of a ring node:
//! - Node identity, ring topology and the membership directory
//! - The ElectionMessage envelope and RPC framing
//! - `NodeState`, the per-node state machine driving Discovery, Announce,
//!   Synchronize and promotion
//! - The staggered election watchdog

pub mod directory;
pub mod node_id;
pub mod protocol;
pub mod replica;
pub mod ring;
pub mod role;
pub mod state;
pub mod watchdog;

pub use directory::MembershipDirectory;
pub use node_id::{NodeId, NodeIdError, NodeIdentity};
pub use protocol::{
    ElectionMessage, MAX_MESSAGE_SIZE, MessageKind, Operation, ProtocolError, RejectReason,
    RpcReply, RpcRequest,
};
pub use replica::{INITIAL_REPLICA_LEN, ReplicaState};
pub use ring::RingTopology;
pub use role::{FollowerPhase, Role};
pub use state::{Adoption, Completion, Hop, NodeState, WatchdogAction};
pub use watchdog::{ElectionWatchdog, WatchdogConfig};
