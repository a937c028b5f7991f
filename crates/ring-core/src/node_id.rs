//! NodeId: identifier of a ring member.
//!
//! Ids are small non-negative integers. The bootstrap coordinator is always
//! `0`; newcomers receive the smallest free id from the directory allocator.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeIdError {
    #[error("Invalid node ID: {0}")]
    InvalidFormat(#[from] std::num::ParseIntError),
}

/// A unique identifier for a node in the ring.
///
/// Ordering is numeric and is what elections compare: the highest id wins.
///
/// # Examples
/// ```
/// use ring_core::NodeId;
///
/// let id: NodeId = "3".parse().unwrap();
/// assert_eq!(id, NodeId::new(3));
/// assert!(NodeId::new(3) > NodeId::new(1));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// The id taken by the first node of a fresh ring.
    pub const BOOTSTRAP: NodeId = NodeId(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Port this node listens on under the `base_port + id` convention.
    ///
    /// Returns `None` if the sum does not fit in a port number.
    pub fn port(&self, base_port: u16) -> Option<u16> {
        u16::try_from(self.0)
            .ok()
            .and_then(|offset| base_port.checked_add(offset))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<NodeId> for u32 {
    fn from(id: NodeId) -> u32 {
        id.0
    }
}

/// Immutable id + address pair assigned once at process start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    pub id: NodeId,
    /// `host:port` the node accepts RPC connections on
    pub address: String,
}

impl NodeIdentity {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }

    /// Build an identity following the `host:(base_port + id)` convention.
    pub fn conventional(id: NodeId, host: &str, base_port: u16) -> Option<Self> {
        let port = id.port(base_port)?;
        Some(Self::new(id, format!("{host}:{port}")))
    }
}

impl Display for NodeIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}@{}", self.id, self.address)
    }
}
