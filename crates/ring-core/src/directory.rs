//! Membership directory: node id → network address.

use crate::{NodeId, NodeIdentity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mapping from node id to `host:port`.
///
/// Ordered by id so that snapshots, allocation and the bootstrap ring are
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MembershipDirectory {
    entries: BTreeMap<NodeId, String>,
}

impl MembershipDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smallest id ≥ 1 not already present.
    ///
    /// Ids vacated by departed nodes are reused. Id 0 is reserved for the
    /// bootstrap coordinator.
    pub fn allocate_id(&self) -> NodeId {
        let mut candidate = 1u32;
        while self.entries.contains_key(&NodeId::new(candidate)) {
            candidate += 1;
        }
        NodeId::new(candidate)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Insert or replace the address of `id`.
    ///
    /// Returns the previous address if there was one.
    pub fn insert(&mut self, id: NodeId, address: impl Into<String>) -> Option<String> {
        self.entries.insert(id, address.into())
    }

    /// Insert an identity.
    pub fn insert_identity(&mut self, identity: &NodeIdentity) -> Option<String> {
        self.insert(identity.id, identity.address.clone())
    }

    /// Remove `id`. Idempotent.
    pub fn remove(&mut self, id: NodeId) -> Option<String> {
        self.entries.remove(&id)
    }

    pub fn address(&self, id: NodeId) -> Option<&str> {
        self.entries.get(&id).map(String::as_str)
    }

    /// Identity of `id`, if known.
    pub fn identity(&self, id: NodeId) -> Option<NodeIdentity> {
        self.address(id).map(|address| NodeIdentity::new(id, address))
    }

    /// All ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.keys().copied()
    }

    /// All identities in ascending id order.
    pub fn identities(&self) -> impl Iterator<Item = NodeIdentity> + '_ {
        self.entries
            .iter()
            .map(|(id, address)| NodeIdentity::new(*id, address.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(NodeId, String)> for MembershipDirectory {
    fn from_iter<I: IntoIterator<Item = (NodeId, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
