//! Wire protocol: the ElectionMessage envelope and its RPC framing.

mod envelope;
mod rpc;

pub use envelope::{ElectionMessage, MessageKind, ProtocolError};
pub use rpc::{MAX_MESSAGE_SIZE, Operation, RejectReason, RpcReply, RpcRequest};
