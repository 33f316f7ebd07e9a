//! Locally held blocks and the folder layout of a worker.
//!
//! Local layout:
//!
//! ```text
//! <data folder root>
//! ├── data
//! │   └── <block id>          committed blocks
//! └── users
//!     └── <session id>
//!         └── <block id>      blocks still being written by a session
//! ```
//!
//! Durable layout:
//!
//! ```text
//! <underfs root>
//! ├── data
//! │   └── <file id>           checkpointed files
//! └── workers
//!     └── <worker id>
//!         └── users
//!             └── <session id>
//! ```

use common::{BlockId, SessionId};
use log::{debug, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::ufs::join_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Visible to the writing session only.
    Temporary,
    /// Immutable, lockable and evictable.
    Committed,
}

#[derive(Debug, Clone)]
pub struct BlockMeta {
    pub block_id: BlockId,
    pub size: u64,
    pub location: PathBuf,
    pub state: BlockState,
    pub owner: Option<SessionId>,
    pub last_access: Instant,
}

impl BlockMeta {
    pub fn is_committed(&self) -> bool {
        self.state == BlockState::Committed
    }
}

/// Maps sessions and blocks to their local and durable folders.
#[derive(Debug, Clone)]
pub struct WorkerPaths {
    local_root: PathBuf,
    worker_id: u64,
}

impl WorkerPaths {
    pub fn new<P: AsRef<Path>>(local_root: P, worker_id: u64) -> Self {
        Self {
            local_root: local_root.as_ref().to_path_buf(),
            worker_id,
        }
    }

    /// Returns the folder of committed blocks,
    /// (e.g. `<root>/data`).
    pub fn data_folder(&self) -> PathBuf {
        self.local_root.join("data")
    }

    /// Returns the root of all session temp folders,
    /// (e.g. `<root>/users`).
    pub fn users_folder(&self) -> PathBuf {
        self.local_root.join("users")
    }

    /// Returns the local temp folder of a session,
    /// (e.g. `<root>/users/<session id>`).
    pub fn user_temp_folder(&self, session_id: SessionId) -> PathBuf {
        self.users_folder().join(session_id.to_string())
    }

    /// Returns the durable temp folder of a session,
    /// (e.g. `/workers/<worker id>/users/<session id>`).
    pub fn user_underfs_temp_folder(&self, session_id: SessionId) -> String {
        format!("/workers/{}/users/{}", self.worker_id, session_id)
    }

    /// Returns the durable folder of checkpointed files,
    /// (e.g. `/data`).
    pub fn underfs_data_folder(&self) -> String {
        "/data".to_string()
    }

    pub fn block_path(&self, block_id: BlockId) -> PathBuf {
        self.data_folder().join(block_id.to_string())
    }

    pub fn temp_block_path(&self, session_id: SessionId, block_id: BlockId) -> PathBuf {
        self.user_temp_folder(session_id).join(block_id.to_string())
    }

    pub fn checkpoint_path(&self, file_id: u64) -> String {
        join_path(&self.underfs_data_folder(), &file_id.to_string())
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }
}

pub struct BlockStore {
    paths: WorkerPaths,
    blocks: RwLock<HashMap<BlockId, BlockMeta>>,
}

impl BlockStore {
    pub fn new(paths: WorkerPaths) -> Self {
        Self {
            paths,
            blocks: RwLock::new(HashMap::new()),
        }
    }

    pub fn paths(&self) -> &WorkerPaths {
        &self.paths
    }

    /// Registers every block file already present in the data folder as
    /// committed and returns their total size.
    pub async fn recover(&self) -> std::io::Result<u64> {
        let data = self.paths.data_folder();
        tokio::fs::create_dir_all(&data).await?;
        tokio::fs::create_dir_all(self.paths.users_folder()).await?;

        let mut found = Vec::new();
        let mut dir = tokio::fs::read_dir(&data).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(block_id) = name.to_str().and_then(|n| n.parse::<BlockId>().ok()) else {
                warn!("ignoring unexpected entry {:?} in data folder", entry.path());
                continue;
            };
            let meta = entry.metadata().await?;
            if meta.is_file() {
                found.push((block_id, meta.len(), entry.path()));
            }
        }

        let now = Instant::now();
        let mut blocks = self.blocks.write().await;
        let mut total = 0;
        for (block_id, size, location) in found {
            total += size;
            blocks.insert(
                block_id,
                BlockMeta {
                    block_id,
                    size,
                    location,
                    state: BlockState::Committed,
                    owner: None,
                    last_access: now,
                },
            );
        }
        debug!("recovered {} blocks ({} bytes)", blocks.len(), total);
        Ok(total)
    }

    pub async fn get(&self, block_id: BlockId) -> Option<BlockMeta> {
        self.blocks.read().await.get(&block_id).cloned()
    }

    pub async fn committed(&self, block_id: BlockId) -> Option<BlockMeta> {
        self.get(block_id).await.filter(BlockMeta::is_committed)
    }

    /// Records a block written by `session_id` that is not committed yet.
    /// Returns false, leaving the store untouched, when the block is already
    /// committed.
    pub async fn stage(&self, session_id: SessionId, block_id: BlockId, size: u64) -> bool {
        let location = self.paths.temp_block_path(session_id, block_id);
        let mut blocks = self.blocks.write().await;
        if blocks.get(&block_id).is_some_and(BlockMeta::is_committed) {
            return false;
        }
        blocks.insert(
            block_id,
            BlockMeta {
                block_id,
                size,
                location,
                state: BlockState::Temporary,
                owner: Some(session_id),
                last_access: Instant::now(),
            },
        );
        true
    }

    /// Commits `block_id` at `location`, replacing a temporary entry if there
    /// is one. Returns false when the block was committed already.
    pub async fn promote(&self, block_id: BlockId, size: u64, location: PathBuf) -> bool {
        let mut blocks = self.blocks.write().await;
        if blocks.get(&block_id).is_some_and(BlockMeta::is_committed) {
            return false;
        }
        blocks.insert(
            block_id,
            BlockMeta {
                block_id,
                size,
                location,
                state: BlockState::Committed,
                owner: None,
                last_access: Instant::now(),
            },
        );
        true
    }

    /// Refreshes the access time used by the eviction policy.
    pub async fn access(&self, block_id: BlockId) -> bool {
        let mut blocks = self.blocks.write().await;
        match blocks.get_mut(&block_id) {
            Some(b) if b.is_committed() => {
                b.last_access = Instant::now();
                true
            }
            _ => false,
        }
    }

    pub async fn remove(&self, block_id: BlockId) -> Option<BlockMeta> {
        self.blocks.write().await.remove(&block_id)
    }

    /// Forgets every temporary block staged by `session_id`.
    pub async fn remove_temporary(&self, session_id: SessionId) -> Vec<BlockMeta> {
        let mut blocks = self.blocks.write().await;
        let ids: Vec<BlockId> = blocks
            .values()
            .filter(|b| b.state == BlockState::Temporary && b.owner == Some(session_id))
            .map(|b| b.block_id)
            .collect();
        ids.iter().filter_map(|id| blocks.remove(id)).collect()
    }

    /// Removes and returns the least recently accessed committed block for
    /// which `is_pinned` is false.
    pub async fn take_least_recent<F>(&self, is_pinned: F) -> Option<BlockMeta>
    where
        F: Fn(BlockId) -> bool,
    {
        let mut blocks = self.blocks.write().await;
        let victim = blocks
            .values()
            .filter(|b| b.is_committed() && !is_pinned(b.block_id))
            .min_by_key(|b| (b.last_access, b.block_id))
            .map(|b| b.block_id)?;
        blocks.remove(&victim)
    }

    pub async fn committed_ids(&self) -> Vec<BlockId> {
        let blocks = self.blocks.read().await;
        let mut ids: Vec<BlockId> = blocks
            .values()
            .filter(|b| b.is_committed())
            .map(|b| b.block_id)
            .collect();
        ids.sort_unstable();
        ids
    }
}
