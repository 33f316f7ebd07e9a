//! Persistence of cached files to the under file system.
//!
//! A checkpoint is all or nothing: the blocks of a file are pinned, then
//! concatenated into a temporary object in the session's durable temp folder,
//! renamed into the durable data folder and only then committed to the
//! coordinator. Whatever fails, the object this attempt wrote is removed and
//! the coordinator is not told. A file the coordinator already knows a
//! checkpoint of is left alone, and only one attempt per file runs at a time
//! on a worker.
//!
//! Submodules:
//! - `queue`: bounded queue and worker pool behind asynchronous checkpoints

pub mod queue;

use common::{FileId, SessionId};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::block::lock::LockTable;
use crate::block::store::{BlockMeta, BlockStore};
use crate::coordinator::{Coordinator, FileInfo};
use crate::error::{Result, WorkerError};
use crate::ufs::{UnderFileSystem, join_path};

pub use queue::CheckpointQueue;

/// Session id the asynchronous checkpoint workers pin blocks under. It is
/// never registered, so the reaper never reclaims it.
pub const CHECKPOINT_SESSION: SessionId = SessionId::MAX;

pub struct Checkpointer {
    store: Arc<BlockStore>,
    locks: Arc<LockTable>,
    coordinator: Arc<dyn Coordinator>,
    ufs: Arc<dyn UnderFileSystem>,
    in_flight: Mutex<HashMap<FileId, Arc<Mutex<()>>>>,
}

impl Checkpointer {
    pub fn new(
        store: Arc<BlockStore>,
        locks: Arc<LockTable>,
        coordinator: Arc<dyn Coordinator>,
        ufs: Arc<dyn UnderFileSystem>,
    ) -> Self {
        Self {
            store,
            locks,
            coordinator,
            ufs,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Writes file `file_id` to durable storage on behalf of `session_id`.
    /// Waits for another attempt on the same file to finish first.
    pub async fn checkpoint(&self, session_id: SessionId, file_id: FileId) -> Result<()> {
        let claim = self.claim(file_id).await;
        let result = self.checkpoint_claimed(session_id, file_id).await;
        self.release(file_id, claim).await;
        result
    }

    async fn claim(&self, file_id: FileId) -> OwnedMutexGuard<()> {
        let slot = self
            .in_flight
            .lock()
            .await
            .entry(file_id)
            .or_default()
            .clone();
        slot.lock_owned().await
    }

    async fn release(&self, file_id: FileId, claim: OwnedMutexGuard<()>) {
        drop(claim);
        let mut in_flight = self.in_flight.lock().await;
        // nobody else waits on the slot once the map holds the last reference
        if in_flight
            .get(&file_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            in_flight.remove(&file_id);
        }
    }

    async fn checkpoint_claimed(&self, session_id: SessionId, file_id: FileId) -> Result<()> {
        let info = self.coordinator.file_info(file_id).await?;
        if let Some(path) = &info.checkpoint_path {
            debug!("file {file_id} already checkpointed at {path}");
            return Ok(());
        }

        // pin first so nothing validated below can be evicted mid-copy
        for &block_id in &info.block_ids {
            self.locks.lock(block_id, session_id).await;
        }
        let result = self.checkpoint_pinned(session_id, &info).await;
        for &block_id in &info.block_ids {
            self.locks.unlock(block_id, session_id).await;
        }
        result
    }

    async fn checkpoint_pinned(&self, session_id: SessionId, info: &FileInfo) -> Result<()> {
        let file_id = info.file_id;
        let mut blocks = Vec::with_capacity(info.block_ids.len());
        for &block_id in &info.block_ids {
            let block = self
                .store
                .committed(block_id)
                .await
                .ok_or_else(|| WorkerError::block_not_found(block_id))?;
            blocks.push(block);
        }
        let actual: u64 = blocks.iter().map(|b| b.size).sum();
        if actual != info.length {
            return Err(WorkerError::SizeMismatch {
                what: format!("file {file_id}"),
                declared: info.length,
                actual,
            });
        }
        self.persist(session_id, file_id, &blocks, actual).await
    }

    async fn persist(
        &self,
        session_id: SessionId,
        file_id: FileId,
        blocks: &[BlockMeta],
        length: u64,
    ) -> Result<()> {
        let paths = self.store.paths();
        let temp_folder = paths.user_underfs_temp_folder(session_id);
        let temp_path = join_path(&temp_folder, &file_id.to_string());
        let dst_path = paths.checkpoint_path(file_id);

        if let Err(e) = self
            .write_object(&temp_folder, &temp_path, &dst_path, blocks, length)
            .await
        {
            if let Err(de) = self.ufs.delete(&temp_path, false).await {
                warn!("failed to remove partial checkpoint {temp_path}: {de}");
            }
            return Err(WorkerError::checkpoint(file_id, e.to_string()));
        }

        // the object at dst_path is the one written above: the coordinator
        // had no checkpoint of this file and no other attempt is running
        if let Err(e) = self
            .coordinator
            .add_checkpoint(paths.worker_id(), file_id, length, &dst_path)
            .await
        {
            warn!("coordinator rejected checkpoint of file {file_id}: {e}");
            if let Err(de) = self.ufs.delete(&dst_path, false).await {
                warn!("failed to remove orphaned checkpoint {dst_path}: {de}");
            }
            return Err(e.into());
        }

        info!("checkpointed file {file_id} ({length} bytes) to {dst_path}");
        Ok(())
    }

    async fn write_object(
        &self,
        temp_folder: &str,
        temp_path: &str,
        dst_path: &str,
        blocks: &[BlockMeta],
        length: u64,
    ) -> std::io::Result<()> {
        self.ufs.mkdirs(temp_folder).await?;
        let mut writer = self.ufs.create(temp_path).await?;
        let mut written = 0;
        for block in blocks {
            let mut file = tokio::fs::File::open(&block.location).await?;
            written += tokio::io::copy(&mut file, &mut writer).await?;
        }
        writer.shutdown().await?;
        drop(writer);
        if written != length {
            return Err(std::io::Error::other(format!(
                "copied {written} bytes, expected {length}"
            )));
        }
        debug!("wrote {written} bytes to {temp_path}");
        if self.ufs.exists(dst_path).await? {
            warn!("replacing uncommitted checkpoint object {dst_path}");
        }
        self.ufs.rename(temp_path, dst_path).await
    }
}
