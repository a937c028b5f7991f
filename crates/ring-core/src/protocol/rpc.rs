//! RPC framing: one request frame, one reply frame per connection.

use super::envelope::ElectionMessage;
use crate::Role;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Maximum size of a single request or reply frame (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Remote operations exposed by a node.
///
/// Each operation is served by exactly one role, except `BecomeCoordinator`
/// which both roles accept so that a repeated promotion is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    /// Follower: one Discovery hop (election or membership)
    DiscoverRing,
    /// Follower: adopt an announced ring
    UpdateRing,
    /// Follower: overwrite the local replica
    Synchronize,
    /// Promote the receiver to coordinator
    BecomeCoordinator,
    /// Coordinator: admit a newcomer
    RegisterNode,
    /// Coordinator: launch a membership Discovery pass
    InitiateRingDiscovery,
    /// Coordinator: adopt the final ring and announce it
    InitiateRingUpdate,
}

impl Operation {
    /// Whether a node in `role` handles this operation.
    pub fn served_by(&self, role: Role) -> bool {
        match self {
            Operation::BecomeCoordinator => true,
            Operation::DiscoverRing | Operation::UpdateRing | Operation::Synchronize => {
                role == Role::Follower
            }
            Operation::RegisterNode
            | Operation::InitiateRingDiscovery
            | Operation::InitiateRingUpdate => role == Role::Coordinator,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::DiscoverRing => "DiscoverRing",
            Operation::UpdateRing => "UpdateRing",
            Operation::Synchronize => "Synchronize",
            Operation::BecomeCoordinator => "BecomeCoordinator",
            Operation::RegisterNode => "RegisterNode",
            Operation::InitiateRingDiscovery => "InitiateRingDiscovery",
            Operation::InitiateRingUpdate => "InitiateRingUpdate",
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub op: Operation,
    pub message: ElectionMessage,
}

impl RpcRequest {
    pub fn new(op: Operation, message: ElectionMessage) -> Self {
        Self { op, message }
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("RpcRequest serialization should not fail")
    }

    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

/// Why a node refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "camelCase")]
pub enum RejectReason {
    /// The receiver's current role does not serve this operation
    WrongRole { role: Role, op: Operation },
    /// The request could not be decoded or failed validation
    Malformed { detail: String },
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::WrongRole { role, op } => {
                write!(f, "{op} is not served by a {role}")
            }
            RejectReason::Malformed { detail } => write!(f, "malformed request: {detail}"),
        }
    }
}

/// Reply frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RpcReply {
    Ack { message: ElectionMessage },
    Rejected { reason: RejectReason },
}

impl RpcReply {
    pub fn ack(message: ElectionMessage) -> Self {
        RpcReply::Ack { message }
    }

    pub fn wrong_role(role: Role, op: Operation) -> Self {
        RpcReply::Rejected {
            reason: RejectReason::WrongRole { role, op },
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        RpcReply::Rejected {
            reason: RejectReason::Malformed {
                detail: detail.into(),
            },
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("RpcReply serialization should not fail")
    }

    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}
