//! Node state persistence.
//!
//! A [`NodeSnapshot`] is written as one MessagePack blob through a
//! [`StateStore`]. Snapshots are taken on stop and, when checkpointing is
//! enabled, after every tick that changed durable state.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use minnow_core::{MessageCodec, MsgPackCodec, Value};
use serde::{Deserialize, Serialize};

use crate::error::StateStoreError;
use crate::link::Link;
use crate::tunnel::Tunnel;

/// Durable state of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Runtime id.
    pub id: String,
    /// Node name.
    pub name: String,
    /// Proxy the node was attached to.
    pub proxy_id: Option<String>,
    /// Links to peer runtimes, proxy link excluded.
    pub links: Vec<Link>,
    /// Token tunnels.
    pub tunnels: Vec<Tunnel>,
    /// Serialized actors, queue contents included.
    pub actors: Vec<Value>,
}

impl NodeSnapshot {
    /// Encode as MessagePack.
    pub fn encode(&self) -> Result<Vec<u8>, StateStoreError> {
        Ok(MsgPackCodec.encode(self)?)
    }

    /// Decode from MessagePack.
    pub fn decode(buf: &[u8]) -> Result<Self, StateStoreError> {
        Ok(MsgPackCodec.decode(buf)?)
    }
}

/// Backend holding the latest snapshot.
#[async_trait(?Send)]
pub trait StateStore {
    /// Latest snapshot, `None` on first start.
    async fn load(&self) -> Result<Option<NodeSnapshot>, StateStoreError>;

    /// Replace the stored snapshot.
    async fn save(&self, snapshot: &NodeSnapshot) -> Result<(), StateStoreError>;

    /// Forget the stored snapshot.
    async fn clear(&self) -> Result<(), StateStoreError>;
}

/// Snapshot kept in a single file.
///
/// Saving writes a sibling temporary file and renames it over the target,
/// so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File holding the snapshot.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait(?Send)]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Option<NodeSnapshot>, StateStoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(buf) => {
                let snapshot = NodeSnapshot::decode(&buf)?;
                tracing::debug!(path = %self.path.display(), bytes = buf.len(), "state loaded");
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &NodeSnapshot) -> Result<(), StateStoreError> {
        let buf = snapshot.encode()?;
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &buf).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), bytes = buf.len(), "state saved");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StateStoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Snapshot kept in memory, for tests and nodes without storage.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    data: RefCell<Option<Vec<u8>>>,
}

impl MemoryStateStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a snapshot is stored.
    pub fn is_empty(&self) -> bool {
        self.data.borrow().is_none()
    }
}

#[async_trait(?Send)]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<NodeSnapshot>, StateStoreError> {
        self.data
            .borrow()
            .as_deref()
            .map(NodeSnapshot::decode)
            .transpose()
    }

    async fn save(&self, snapshot: &NodeSnapshot) -> Result<(), StateStoreError> {
        *self.data.borrow_mut() = Some(snapshot.encode()?);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StateStoreError> {
        self.data.borrow_mut().take();
        Ok(())
    }
}
