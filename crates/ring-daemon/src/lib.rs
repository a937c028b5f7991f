//! ring-daemon library: the networked ring node.
//!
//! The binary is a thin wrapper over [`Node`]; integration tests start
//! several nodes in one process through this library.

pub mod config;
mod coordinator;
pub mod events;
mod follower;
pub mod node;
pub mod persistence;
pub mod rpc;
pub mod server;

// Re-export key types for convenience
pub use config::NodeConfig;
pub use events::NodeEvent;
pub use node::{Bootstrap, Node};
pub use persistence::{DirectoryFile, DirectoryRecord};
pub use rpc::{RpcClient, RpcError};
pub use server::RpcServer;
