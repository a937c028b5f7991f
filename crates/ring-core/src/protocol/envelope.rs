//! The ElectionMessage envelope.
//!
//! One envelope type travels on every operation. Which fields must be present
//! depends on what the receiving handler does with it, so handlers call the
//! `require_*` accessors and reject the request before touching shared state
//! if a field is missing.

use super::rpc::Operation;
use crate::{MembershipDirectory, NodeId, NodeIdentity, ReplicaState, RingTopology};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Protocol violations detected while validating an incoming envelope.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{kind:?} message is missing its ring snapshot")]
    MissingRing { kind: MessageKind },

    #[error("{kind:?} message is missing its directory snapshot")]
    MissingDirectory { kind: MessageKind },

    #[error("{kind:?} message is missing its replica payload")]
    MissingPayload { kind: MessageKind },

    #[error("{kind:?} message does not name a joining node")]
    MissingJoining { kind: MessageKind },

    #[error("node {0} appears more than once in the ring snapshot")]
    DuplicateRingMember(NodeId),

    #[error("node {0} is in only one of the ring and directory snapshots")]
    InconsistentSnapshot(NodeId),

    #[error("expected a {expected:?} message, got {actual:?}")]
    UnexpectedKind {
        expected: MessageKind,
        actual: MessageKind,
    },

    #[error("announced coordinator {0} is not part of the announced ring")]
    CoordinatorNotInRing(NodeId),

    #[error("{0} has no handler in this role")]
    Unhandled(Operation),
}

/// Discriminator for [`ElectionMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Election Discovery pass: elects the highest id seen
    Discover,
    /// Membership Discovery pass launched by the coordinator for a newcomer
    NewNodeDiscover,
    /// Installs a finalized ring and coordinator on every member
    Announce,
    /// Coordinator pushes the replica
    Sync,
    /// Acknowledgement
    Ack,
}

/// The wire envelope exchanged by every RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionMessage {
    pub kind: MessageKind,
    /// Sender, or the joining node on NewNodeDiscover
    pub node_id: NodeId,
    /// Candidate coordinator (Discover) or target coordinator (everything else)
    pub coordinator_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ring: Option<RingTopology>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<MembershipDirectory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ReplicaState>,
    /// Newcomer being introduced on RegisterNode / NewNodeDiscover
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joining: Option<NodeIdentity>,
}

impl ElectionMessage {
    fn bare(kind: MessageKind, node_id: NodeId, coordinator_id: NodeId) -> Self {
        Self {
            kind,
            node_id,
            coordinator_id,
            ring: None,
            directory: None,
            payload: None,
            joining: None,
        }
    }

    /// Seed an election: `initiator` is the first candidate and the first
    /// member of the snapshot.
    pub fn discover(initiator: &NodeIdentity) -> Self {
        let mut directory = MembershipDirectory::new();
        directory.insert_identity(initiator);
        Self {
            ring: Some(RingTopology::single(initiator.id)),
            directory: Some(directory),
            ..Self::bare(MessageKind::Discover, initiator.id, initiator.id)
        }
    }

    /// Seed a membership pass from the coordinator on behalf of `joining`.
    pub fn new_node_discover(coordinator: &NodeIdentity, joining: NodeIdentity) -> Self {
        let mut directory = MembershipDirectory::new();
        directory.insert_identity(coordinator);
        Self {
            ring: Some(RingTopology::single(coordinator.id)),
            directory: Some(directory),
            joining: Some(joining.clone()),
            ..Self::bare(MessageKind::NewNodeDiscover, joining.id, coordinator.id)
        }
    }

    /// RegisterNode request sent by a newcomer to the coordinator it believes in.
    pub fn register(joining: NodeIdentity, coordinator_id: NodeId) -> Self {
        Self {
            joining: Some(joining.clone()),
            ..Self::bare(MessageKind::NewNodeDiscover, joining.id, coordinator_id)
        }
    }

    /// Announce a finalized ring with `coordinator_id` as coordinator.
    pub fn announce(
        sender: NodeId,
        coordinator_id: NodeId,
        ring: RingTopology,
        directory: MembershipDirectory,
    ) -> Self {
        Self {
            ring: Some(ring),
            directory: Some(directory),
            ..Self::bare(MessageKind::Announce, sender, coordinator_id)
        }
    }

    /// Replica push from the coordinator.
    pub fn sync(coordinator_id: NodeId, replica: ReplicaState) -> Self {
        Self {
            payload: Some(replica),
            ..Self::bare(MessageKind::Sync, coordinator_id, coordinator_id)
        }
    }

    /// Plain acknowledgement from `sender`.
    pub fn ack(sender: NodeId, coordinator_id: NodeId) -> Self {
        Self::bare(MessageKind::Ack, sender, coordinator_id)
    }

    /// Acknowledgement carrying the authoritative replica (RegisterNode reply).
    pub fn ack_with_replica(sender: NodeId, replica: ReplicaState) -> Self {
        Self {
            payload: Some(replica),
            ..Self::bare(MessageKind::Ack, sender, sender)
        }
    }

    /// Structural checks that apply whatever the operation.
    ///
    /// A ring snapshot must not repeat ids, and when both snapshots are
    /// present they must name the same members.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Some(ring) = &self.ring {
            let mut seen = HashSet::with_capacity(ring.len());
            for id in ring.iter() {
                if !seen.insert(id) {
                    return Err(ProtocolError::DuplicateRingMember(id));
                }
            }
            if let Some(directory) = &self.directory {
                if let Some(id) = ring.iter().find(|id| !directory.contains(*id)) {
                    return Err(ProtocolError::InconsistentSnapshot(id));
                }
                if let Some(id) = directory.ids().find(|id| !seen.contains(id)) {
                    return Err(ProtocolError::InconsistentSnapshot(id));
                }
            }
        }
        Ok(())
    }

    /// Require the message to be of `expected` kind.
    pub fn expect_kind(&self, expected: MessageKind) -> Result<(), ProtocolError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedKind {
                expected,
                actual: self.kind,
            })
        }
    }

    /// Both snapshots, or the protocol error describing which is missing.
    pub fn require_snapshot(&self) -> Result<(&RingTopology, &MembershipDirectory), ProtocolError> {
        let ring = self
            .ring
            .as_ref()
            .ok_or(ProtocolError::MissingRing { kind: self.kind })?;
        let directory = self
            .directory
            .as_ref()
            .ok_or(ProtocolError::MissingDirectory { kind: self.kind })?;
        Ok((ring, directory))
    }

    pub fn require_payload(&self) -> Result<&ReplicaState, ProtocolError> {
        self.payload
            .as_ref()
            .ok_or(ProtocolError::MissingPayload { kind: self.kind })
    }

    pub fn require_joining(&self) -> Result<&NodeIdentity, ProtocolError> {
        self.joining
            .as_ref()
            .ok_or(ProtocolError::MissingJoining { kind: self.kind })
    }

    /// One Discovery hop at `node`.
    ///
    /// On an election pass, a node with a higher id than the current
    /// candidate claims the candidacy and restarts the snapshot from itself.
    /// The node then appends itself to the snapshot. The candidate id only
    /// moves upward, except through [`ElectionMessage::forget`].
    pub fn claim_or_append(&mut self, node: &NodeIdentity) -> Result<(), ProtocolError> {
        self.require_snapshot()?;

        if self.kind == MessageKind::Discover && node.id > self.coordinator_id {
            self.coordinator_id = node.id;
            self.ring = Some(RingTopology::new());
            self.directory = Some(MembershipDirectory::new());
        }

        if let (Some(ring), Some(directory)) = (self.ring.as_mut(), self.directory.as_mut()) {
            ring.push(node.id);
            directory.insert_identity(node);
        }
        Ok(())
    }

    /// Drop `id` from both snapshots (peer found unreachable mid-pass).
    ///
    /// If `id` was the election candidate, candidacy falls back to the
    /// highest id still in the snapshot.
    pub fn forget(&mut self, id: NodeId) {
        if let Some(ring) = self.ring.as_mut() {
            ring.remove(id);
            if self.kind == MessageKind::Discover && self.coordinator_id == id {
                self.coordinator_id = ring.max_id().unwrap_or(self.node_id);
            }
        }
        if let Some(directory) = self.directory.as_mut() {
            directory.remove(id);
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("ElectionMessage serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}
