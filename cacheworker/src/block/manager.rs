use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{BlockId, CheckpointStatus, FileId, SessionId};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::Instant;

use super::lock::LockTable;
use super::reaper::SessionCleaner;
use super::session::{SessionRegistry, UserSession};
use super::space::{SpaceAllocator, SpaceUsage};
use super::store::{BlockStore, WorkerPaths};
use crate::checkpoint::{CheckpointQueue, Checkpointer};
use crate::coordinator::Coordinator;
use crate::error::{Result, WorkerError};
use crate::ufs::UnderFileSystem;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub capacity_bytes: u64,
    pub heartbeat_interval: Duration,
    pub zombie_multiplier: u32,
    pub checkpoint_workers: usize,
    pub checkpoint_queue_capacity: usize,
}

impl ManagerOptions {
    /// A session whose last heartbeat is older than this is reclaimed.
    pub fn zombie_threshold(&self) -> Duration {
        self.heartbeat_interval * self.zombie_multiplier
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            capacity_bytes: 1 << 30,
            heartbeat_interval: Duration::from_millis(1000),
            zombie_multiplier: 3,
            checkpoint_workers: 2,
            checkpoint_queue_capacity: 64,
        }
    }
}

/// Resources a session currently holds on this worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUsage {
    pub session_id: SessionId,
    pub reserved_bytes: u64,
    pub held_locks: HashMap<BlockId, u32>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Every operation the worker offers, composed from its block store, lock
/// table, space allocator, session registry and checkpoint machinery.
pub struct BlockDataManager {
    options: ManagerOptions,
    store: Arc<BlockStore>,
    locks: Arc<LockTable>,
    space: SpaceAllocator,
    sessions: SessionRegistry,
    coordinator: Arc<dyn Coordinator>,
    ufs: Arc<dyn UnderFileSystem>,
    checkpointer: Arc<Checkpointer>,
    queue: CheckpointQueue,
}

impl BlockDataManager {
    /// Loads the blocks left in the data folder and starts the checkpoint
    /// workers.
    pub async fn open(
        paths: WorkerPaths,
        options: ManagerOptions,
        coordinator: Arc<dyn Coordinator>,
        ufs: Arc<dyn UnderFileSystem>,
    ) -> Result<Self> {
        let store = Arc::new(BlockStore::new(paths));
        let committed = store.recover().await?;
        let locks = Arc::new(LockTable::new());
        let space = SpaceAllocator::new(
            options.capacity_bytes,
            committed,
            locks.clone(),
            store.clone(),
        );
        let checkpointer = Arc::new(Checkpointer::new(
            store.clone(),
            locks.clone(),
            coordinator.clone(),
            ufs.clone(),
        ));
        let queue = CheckpointQueue::start(
            checkpointer.clone(),
            options.checkpoint_queue_capacity,
            options.checkpoint_workers,
        );
        info!(
            "block data manager ready: {} bytes committed of {} bytes",
            committed, options.capacity_bytes
        );
        Ok(Self {
            options,
            store,
            locks,
            space,
            sessions: SessionRegistry::new(),
            coordinator,
            ufs,
            checkpointer,
            queue,
        })
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn paths(&self) -> &WorkerPaths {
        self.store.paths()
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn data_folder(&self) -> PathBuf {
        self.paths().data_folder()
    }

    pub fn user_temp_folder(&self, session_id: SessionId) -> PathBuf {
        self.paths().user_temp_folder(session_id)
    }

    pub fn user_underfs_temp_folder(&self, session_id: SessionId) -> String {
        self.paths().user_underfs_temp_folder(session_id)
    }

    /// Creates the local and durable temp folders of a session.
    pub async fn create_user_folders(&self, session_id: SessionId) -> Result<()> {
        let _session = self.sessions.enter(session_id).await;
        self.make_user_folders(session_id).await
    }

    async fn make_user_folders(&self, session_id: SessionId) -> Result<()> {
        tokio::fs::create_dir_all(self.user_temp_folder(session_id)).await?;
        self.ufs
            .mkdirs(&self.user_underfs_temp_folder(session_id))
            .await?;
        Ok(())
    }

    pub async fn access_block(&self, block_id: BlockId) {
        if !self.store.access(block_id).await {
            debug!("access to unknown block {block_id} ignored");
        }
    }

    /// Moves a block written by `session_id` from its temp folder into the
    /// data folder once its size matches what the coordinator declared.
    /// Caching a committed block again only reports it to the coordinator.
    pub async fn cache_block(&self, session_id: SessionId, block_id: BlockId) -> Result<()> {
        if self.store.committed(block_id).await.is_some() {
            return self.report_cached(session_id, block_id).await;
        }
        let src = self.paths().temp_block_path(session_id, block_id);
        temp_block_size(&src, block_id).await?;
        let declared = self.coordinator.block_info(block_id).await?.length;

        match self.commit_temp_block(session_id, block_id, declared).await? {
            Some(actual) => {
                debug!("block {block_id} ({actual} bytes) committed by session {session_id}");
                self.coordinator
                    .cache_block(self.paths().worker_id(), block_id, actual)
                    .await?;
                Ok(())
            }
            None => self.report_cached(session_id, block_id).await,
        }
    }

    /// Stages, accounts and moves the temp block into place while the session
    /// cannot be reclaimed. Returns None when the block turned out to be
    /// committed already.
    async fn commit_temp_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        declared: u64,
    ) -> Result<Option<u64>> {
        let _session = self.sessions.enter(session_id).await;
        // the session may have been reclaimed while the coordinator answered
        let src = self.paths().temp_block_path(session_id, block_id);
        let actual = temp_block_size(&src, block_id).await?;
        if !self.store.stage(session_id, block_id, actual).await {
            return Ok(None);
        }
        if actual != declared {
            return Err(WorkerError::SizeMismatch {
                what: format!("block {block_id}"),
                declared,
                actual,
            });
        }

        let from_reservation = self.space.commit_block(session_id, actual).await?;
        let dst = self.paths().block_path(block_id);
        if let Err(e) = tokio::fs::rename(&src, &dst).await {
            self.space
                .rollback_commit(session_id, actual, from_reservation)
                .await;
            return Err(block_io_error(block_id, e));
        }
        if !self.store.promote(block_id, actual, dst).await {
            // another session committed the same block meanwhile
            self.space
                .rollback_commit(session_id, actual, from_reservation)
                .await;
            return Ok(None);
        }
        Ok(Some(actual))
    }

    async fn report_cached(&self, session_id: SessionId, block_id: BlockId) -> Result<()> {
        let block = self
            .store
            .committed(block_id)
            .await
            .ok_or_else(|| WorkerError::block_not_found(block_id))?;
        warn!("block {block_id} cached again by session {session_id}, reporting it only");
        self.coordinator
            .cache_block(self.paths().worker_id(), block_id, block.size)
            .await?;
        Ok(())
    }

    pub async fn lock_block(&self, block_id: BlockId, session_id: SessionId) -> u32 {
        let _session = self.sessions.enter(session_id).await;
        self.locks.lock(block_id, session_id).await
    }

    pub async fn unlock_block(&self, block_id: BlockId, session_id: SessionId) -> u32 {
        let _session = self.sessions.enter(session_id).await;
        self.locks.unlock(block_id, session_id).await
    }

    /// Reserves `bytes` for `session_id`, evicting cold blocks if needed.
    /// A granted session gets its temp folders, ready for writing.
    pub async fn request_space(&self, session_id: SessionId, bytes: u64) -> bool {
        let _session = self.sessions.enter(session_id).await;
        if let Err(e) = self.space.request_space(session_id, bytes).await {
            info!("space request of session {session_id} refused: {e}");
            return false;
        }
        if let Err(e) = self.make_user_folders(session_id).await {
            warn!("failed to create temp folders of session {session_id}: {e}");
        }
        true
    }

    pub async fn return_space(&self, session_id: SessionId, bytes: u64) {
        let _session = self.sessions.enter(session_id).await;
        self.space.return_space(session_id, bytes).await;
    }

    pub async fn user_heartbeat(&self, session_id: SessionId) {
        if self.sessions.touch(session_id).await {
            info!("new session {session_id}");
        }
    }

    /// Synchronously writes file `file_id` to durable storage.
    pub async fn add_checkpoint(&self, session_id: SessionId, file_id: FileId) -> Result<()> {
        self.sessions.ensure(session_id).await;
        self.checkpointer.checkpoint(session_id, file_id).await
    }

    /// Queues file `file_id` for checkpointing. Returns false when the queue
    /// is full.
    pub async fn async_checkpoint(&self, file_id: FileId) -> Result<bool> {
        self.queue.submit(file_id).await
    }

    pub async fn checkpoint_status(&self, file_id: FileId) -> Option<CheckpointStatus> {
        self.queue.status(file_id).await
    }

    /// Tears a session down right away. Returns false when the session was
    /// not registered (for example because it was already reclaimed).
    pub async fn release_session(&self, session_id: SessionId) -> bool {
        let released = {
            let mut sessions = self.sessions.write().await;
            match sessions.remove(session_id) {
                Some(session) => {
                    self.reclaim(&session).await;
                    true
                }
                None => false,
            }
        };
        if released {
            self.remove_durable_folder(session_id).await;
        }
        released
    }

    /// Reclaims every session that missed its heartbeats.
    pub async fn cleanup_users(&self) -> usize {
        let threshold = self.options.zombie_threshold();
        let expired = {
            let mut sessions = self.sessions.write().await;
            let expired = sessions.take_expired(threshold, Instant::now());
            for session in &expired {
                warn!(
                    "session {} timed out, last heartbeat at {}",
                    session.session_id, session.last_heartbeat_at
                );
                self.reclaim(session).await;
            }
            expired
        };
        for session in &expired {
            self.remove_durable_folder(session.session_id).await;
        }
        expired.len()
    }

    /// Tells the coordinator about evicted blocks. Ids it could not take are
    /// kept for the next call.
    pub async fn report_removed_blocks(&self) -> usize {
        let removed = self.space.take_removed_blocks().await;
        if removed.is_empty() {
            return 0;
        }
        match self
            .coordinator
            .remove_blocks(self.paths().worker_id(), &removed)
            .await
        {
            Ok(()) => {
                debug!("reported {} evicted blocks", removed.len());
                removed.len()
            }
            Err(e) => {
                warn!("failed to report {} evicted blocks: {e}", removed.len());
                self.space.restore_removed_blocks(removed).await;
                0
            }
        }
    }

    /// Returns what `session_id` holds, or None if it is not registered.
    pub async fn session_usage(&self, session_id: SessionId) -> Option<SessionUsage> {
        let session = self.sessions.get(session_id).await?;
        Some(SessionUsage {
            session_id,
            reserved_bytes: self.space.reserved_by(session_id).await,
            held_locks: self.locks.held_by(session_id).await,
            last_heartbeat_at: session.last_heartbeat_at,
        })
    }

    pub async fn space_usage(&self) -> SpaceUsage {
        self.space.usage().await
    }

    pub async fn take_removed_blocks(&self) -> Vec<BlockId> {
        self.space.take_removed_blocks().await
    }

    /// Reads up to `length` bytes of a committed block from `offset`.
    pub async fn read_block(&self, block_id: BlockId, offset: u64, length: u64) -> Result<Vec<u8>> {
        let block = self
            .store
            .committed(block_id)
            .await
            .ok_or_else(|| WorkerError::block_not_found(block_id))?;
        if offset > block.size {
            return Err(WorkerError::BlockInfoInvalid(format!(
                "offset {offset} is past the end of block {block_id} ({} bytes)",
                block.size
            )));
        }
        let length = length.min(block.size - offset);

        let mut file = match tokio::fs::File::open(&block.location).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkerError::block_not_found(block_id));
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).await?;
        self.store.access(block_id).await;
        Ok(buf)
    }

    /// Stops the checkpoint workers.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }

    /// Releases locks, reservation, temporary blocks and the local temp folder
    /// of a session that was just removed from the registry. Called with the
    /// registry guard held, so no call of that session runs meanwhile.
    async fn reclaim(&self, session: &UserSession) {
        let session_id = session.session_id;
        let locks = self.locks.release_session(session_id).await;
        let reserved = self.space.release_session(session_id).await;
        let temporary = self.store.remove_temporary(session_id).await;
        let local = self.user_temp_folder(session_id);
        match tokio::fs::remove_dir_all(&local).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!("failed to remove {}: {e}", local.display());
            }
            _ => {}
        }
        info!(
            "reclaimed session {session_id}: {} locked blocks, {reserved} reserved bytes, {} temporary blocks",
            locks.len(),
            temporary.len()
        );
    }

    async fn remove_durable_folder(&self, session_id: SessionId) {
        let durable = self.user_underfs_temp_folder(session_id);
        if let Err(e) = self.ufs.delete(&durable, true).await {
            warn!("failed to remove {durable}: {e}");
        }
    }
}

/// Size of a block still in a session temp folder.
async fn temp_block_size(path: &Path, block_id: BlockId) -> Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(WorkerError::block_not_found(block_id)),
        Err(e) => Err(block_io_error(block_id, e)),
    }
}

/// Local failures while caching a block are reported against the block.
fn block_io_error(block_id: BlockId, e: std::io::Error) -> WorkerError {
    if e.kind() == std::io::ErrorKind::NotFound {
        WorkerError::block_not_found(block_id)
    } else {
        WorkerError::BlockInfoInvalid(format!("block {block_id} cannot be cached: {e}"))
    }
}

#[async_trait]
impl SessionCleaner for BlockDataManager {
    async fn cleanup_users(&self) -> usize {
        let reclaimed = BlockDataManager::cleanup_users(self).await;
        self.report_removed_blocks().await;
        reclaimed
    }
}
