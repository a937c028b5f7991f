//! The shared directory file.
//!
//! Every process on a host reads the same JSON file at startup to pick its id
//! and find the ring. It holds the membership directory and, once known, the
//! coordinator:
//!
//! ```json
//! { "nodes": { "0": "127.0.0.1:8000", "1": "127.0.0.1:8001" }, "coordinator": 0 }
//! ```

use crate::node::Bootstrap;
use anyhow::Result;
use ring_core::{MembershipDirectory, NodeId, NodeIdentity};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Contents of the directory file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    #[serde(default)]
    pub nodes: MembershipDirectory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<NodeId>,
}

impl DirectoryRecord {
    /// Pick this process's id and how it enters the ring.
    ///
    /// An empty file makes node 0 the coordinator. Otherwise the next free id
    /// joins the recorded coordinator, or the highest id if none is recorded.
    pub fn plan(&self) -> (NodeId, Bootstrap) {
        if self.nodes.is_empty() {
            return (NodeId::BOOTSTRAP, Bootstrap::Coordinator);
        }

        let id = self.nodes.allocate_id();
        let coordinator = self
            .coordinator
            .filter(|c| self.nodes.contains(*c))
            .or_else(|| self.nodes.ids().max())
            .unwrap_or(NodeId::BOOTSTRAP);
        let bootstrap = Bootstrap::Join {
            directory: self.nodes.clone(),
            coordinator,
        };
        (id, bootstrap)
    }
}

/// The directory file on disk.
pub struct DirectoryFile {
    path: PathBuf,
}

impl DirectoryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file. A missing file is an empty directory.
    pub fn load(&self) -> Result<DirectoryRecord> {
        if !self.path.exists() {
            return Ok(DirectoryRecord::default());
        }

        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(DirectoryRecord::default());
        }
        let record: DirectoryRecord = serde_json::from_str(&contents)?;
        Ok(record)
    }

    pub fn save(&self, record: &DirectoryRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let contents = serde_json::to_string_pretty(record)?;
        fs::write(&self.path, contents)?;
        Ok(())
    }

    /// Drop `id` from the file, clearing the coordinator if it was `id`.
    pub fn remove_node(&self, id: NodeId) -> Result<()> {
        let mut record = self.load()?;
        record.nodes.remove(id);
        if record.coordinator == Some(id) {
            record.coordinator = None;
        }
        self.save(&record)
    }

    /// Add `identity` to the file, keeping whatever else it holds.
    pub fn insert_node(&self, identity: &NodeIdentity) -> Result<()> {
        let mut record = self.load()?;
        record.nodes.insert_identity(identity);
        self.save(&record)
    }

    pub fn set_coordinator(&self, id: NodeId) -> Result<()> {
        let mut record = self.load()?;
        record.coordinator = Some(id);
        self.save(&record)
    }
}
