//! Ring topology: the ordered, cyclic membership list.
//!
//! Every member's successor is the next id in sequence order, wrapping to the
//! first entry. Rings are small, so every operation is a linear scan.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Ordered sequence of node ids forming exactly one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RingTopology {
    members: Vec<NodeId>,
}

impl RingTopology {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ring containing only `id`.
    pub fn single(id: NodeId) -> Self {
        Self { members: vec![id] }
    }

    /// Create a ring from an ordered list, dropping repeated ids.
    pub fn from_members(members: impl IntoIterator<Item = NodeId>) -> Self {
        let mut ring = Self::new();
        for id in members {
            ring.push(id);
        }
        ring
    }

    /// Successor of `id`, wrapping to the first entry.
    ///
    /// Returns `None` if the ring has one member or fewer, or if `id` is not
    /// part of the ring.
    pub fn successor(&self, id: NodeId) -> Option<NodeId> {
        if self.members.len() <= 1 {
            return None;
        }
        let index = self.index_of(id)?;
        Some(self.members[(index + 1) % self.members.len()])
    }

    /// Position of `id` in traversal order.
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.members.iter().position(|m| *m == id)
    }

    /// Insert `id` immediately ahead of `target` so it is the last member
    /// visited before `target`.
    ///
    /// If `target` is not in the ring, `id` is appended. Does nothing if `id`
    /// is already a member. Returns true if the ring changed.
    pub fn insert_before(&mut self, id: NodeId, target: NodeId) -> bool {
        if self.contains(id) {
            return false;
        }
        match self.index_of(target) {
            Some(index) => self.members.insert(index, id),
            None => self.members.push(id),
        }
        true
    }

    /// Append `id` at the end of traversal order (no-op if present).
    pub fn push(&mut self, id: NodeId) -> bool {
        if self.contains(id) {
            return false;
        }
        self.members.push(id);
        true
    }

    /// Remove `id` from the ring. Idempotent.
    ///
    /// Returns true if `id` was a member.
    pub fn remove(&mut self, id: NodeId) -> bool {
        match self.index_of(id) {
            Some(index) => {
                self.members.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in traversal order.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied()
    }

    /// Highest id in the ring (the would-be election winner).
    pub fn max_id(&self) -> Option<NodeId> {
        self.members.iter().copied().max()
    }

    /// Check whether `other` describes the same cycle, possibly starting at a
    /// different member.
    pub fn same_cycle(&self, other: &RingTopology) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let Some(first) = self.members.first() else {
            return true;
        };
        let Some(offset) = other.index_of(*first) else {
            return false;
        };
        let n = self.len();
        (0..n).all(|i| self.members[i] == other.members[(offset + i) % n])
    }
}

impl Display for RingTopology {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, id) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{id}")?;
        }
        write!(f, "]")
    }
}

impl FromIterator<NodeId> for RingTopology {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        Self::from_members(iter)
    }
}
