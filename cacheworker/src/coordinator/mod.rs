//! Client seam towards the cluster coordinator that owns file and block metadata.
//!
//! The worker never owns metadata of record: it asks the coordinator for the
//! declared size of blocks and files and reports cached blocks and finished
//! checkpoints back. `InMemoryCoordinator` backs standalone mode and tests.

use async_trait::async_trait;
use common::{BlockId, FileId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("file {0} does not exist")]
    FileNotFound(FileId),
    #[error("block {0} does not exist")]
    BlockNotFound(BlockId),
    #[error("{0}")]
    InvalidBlockInfo(String),
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub file_id: FileId,
    pub length: u64,
    pub block_ids: Vec<BlockId>,
    pub checkpoint_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub length: u64,
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn file_info(&self, file_id: FileId) -> Result<FileInfo, CoordinatorError>;

    async fn block_info(&self, block_id: BlockId) -> Result<BlockInfo, CoordinatorError>;

    /// Reports that `block_id` is now committed on `worker_id`.
    async fn cache_block(
        &self,
        worker_id: u64,
        block_id: BlockId,
        length: u64,
    ) -> Result<(), CoordinatorError>;

    /// Commits the durable location of a checkpointed file.
    async fn add_checkpoint(
        &self,
        worker_id: u64,
        file_id: FileId,
        length: u64,
        checkpoint_path: &str,
    ) -> Result<(), CoordinatorError>;

    /// Reports blocks this worker evicted and no longer holds.
    async fn remove_blocks(
        &self,
        worker_id: u64,
        block_ids: &[BlockId],
    ) -> Result<(), CoordinatorError>;

    async fn ping(&self) -> Result<(), CoordinatorError>;
}

#[derive(Default)]
struct Catalog {
    files: HashMap<FileId, FileInfo>,
    blocks: HashMap<BlockId, BlockInfo>,
    cached: Vec<(u64, BlockId, u64)>,
}

/// Metadata held in process. Used when no coordinator address is configured.
pub struct InMemoryCoordinator {
    catalog: RwLock<Catalog>,
    available: AtomicBool,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self {
            catalog: RwLock::new(Catalog::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Registers a file made of `blocks` (id, length) in order. The declared
    /// file length is the sum of the block lengths unless `length` overrides it.
    pub async fn register_file(
        &self,
        file_id: FileId,
        blocks: &[(BlockId, u64)],
        length: Option<u64>,
    ) {
        let mut catalog = self.catalog.write().await;
        let declared = length.unwrap_or_else(|| blocks.iter().map(|(_, len)| len).sum());
        for &(block_id, len) in blocks {
            catalog.blocks.insert(
                block_id,
                BlockInfo {
                    block_id,
                    file_id,
                    length: len,
                },
            );
        }
        catalog.files.insert(
            file_id,
            FileInfo {
                file_id,
                length: declared,
                block_ids: blocks.iter().map(|(id, _)| *id).collect(),
                checkpoint_path: None,
            },
        );
    }

    pub async fn checkpoint_path(&self, file_id: FileId) -> Option<String> {
        let catalog = self.catalog.read().await;
        catalog
            .files
            .get(&file_id)
            .and_then(|f| f.checkpoint_path.clone())
    }

    pub async fn cached_blocks(&self) -> Vec<(u64, BlockId, u64)> {
        self.catalog.read().await.cached.clone()
    }

    /// Simulates losing (or regaining) connectivity to the coordinator.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CoordinatorError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoordinatorError::Unavailable("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn file_info(&self, file_id: FileId) -> Result<FileInfo, CoordinatorError> {
        self.check_available()?;
        let catalog = self.catalog.read().await;
        let info = catalog
            .files
            .get(&file_id)
            .cloned()
            .ok_or(CoordinatorError::FileNotFound(file_id))?;
        if let Some(missing) = info
            .block_ids
            .iter()
            .find(|id| !catalog.blocks.contains_key(id))
        {
            return Err(CoordinatorError::InvalidBlockInfo(format!(
                "file {file_id} references unknown block {missing}"
            )));
        }
        Ok(info)
    }

    async fn block_info(&self, block_id: BlockId) -> Result<BlockInfo, CoordinatorError> {
        self.check_available()?;
        let catalog = self.catalog.read().await;
        let info = catalog
            .blocks
            .get(&block_id)
            .copied()
            .ok_or(CoordinatorError::BlockNotFound(block_id))?;
        match catalog.files.get(&info.file_id) {
            Some(file) if file.block_ids.contains(&block_id) => Ok(info),
            _ => Err(CoordinatorError::InvalidBlockInfo(format!(
                "block {block_id} is not part of file {}",
                info.file_id
            ))),
        }
    }

    async fn cache_block(
        &self,
        worker_id: u64,
        block_id: BlockId,
        length: u64,
    ) -> Result<(), CoordinatorError> {
        self.check_available()?;
        let mut catalog = self.catalog.write().await;
        if !catalog.blocks.contains_key(&block_id) {
            return Err(CoordinatorError::BlockNotFound(block_id));
        }
        if !catalog
            .cached
            .iter()
            .any(|&(w, b, _)| w == worker_id && b == block_id)
        {
            catalog.cached.push((worker_id, block_id, length));
        }
        Ok(())
    }

    async fn add_checkpoint(
        &self,
        _worker_id: u64,
        file_id: FileId,
        length: u64,
        checkpoint_path: &str,
    ) -> Result<(), CoordinatorError> {
        self.check_available()?;
        let mut catalog = self.catalog.write().await;
        let file = catalog
            .files
            .get_mut(&file_id)
            .ok_or(CoordinatorError::FileNotFound(file_id))?;
        if file.length != length {
            return Err(CoordinatorError::InvalidBlockInfo(format!(
                "checkpoint of file {file_id} has {length} bytes, expected {}",
                file.length
            )));
        }
        file.checkpoint_path = Some(checkpoint_path.to_string());
        Ok(())
    }

    async fn remove_blocks(
        &self,
        worker_id: u64,
        block_ids: &[BlockId],
    ) -> Result<(), CoordinatorError> {
        self.check_available()?;
        self.catalog
            .write()
            .await
            .cached
            .retain(|(w, b, _)| *w != worker_id || !block_ids.contains(b));
        Ok(())
    }

    async fn ping(&self) -> Result<(), CoordinatorError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_lookup() {
        let coord = InMemoryCoordinator::new();
        coord.register_file(1, &[(10, 100), (11, 50)], None).await;

        let file = coord.file_info(1).await.unwrap();
        assert_eq!(file.length, 150);
        assert_eq!(file.block_ids, vec![10, 11]);

        let block = coord.block_info(11).await.unwrap();
        assert_eq!(block.file_id, 1);
        assert_eq!(block.length, 50);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let coord = InMemoryCoordinator::new();
        assert!(matches!(
            coord.file_info(5).await,
            Err(CoordinatorError::FileNotFound(5))
        ));
        assert!(matches!(
            coord.block_info(6).await,
            Err(CoordinatorError::BlockNotFound(6))
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_length_is_validated() {
        let coord = InMemoryCoordinator::new();
        coord.register_file(2, &[(20, 10)], None).await;
        assert!(coord.add_checkpoint(1, 2, 9, "/ufs/2").await.is_err());
        assert!(coord.checkpoint_path(2).await.is_none());
        coord.add_checkpoint(1, 2, 10, "/ufs/2").await.unwrap();
        assert_eq!(coord.checkpoint_path(2).await.as_deref(), Some("/ufs/2"));
    }

    #[tokio::test]
    async fn test_cached_blocks_are_tracked_per_worker() {
        let coord = InMemoryCoordinator::new();
        coord.register_file(3, &[(30, 10), (31, 10)], None).await;
        coord.cache_block(1, 30, 10).await.unwrap();
        coord.cache_block(1, 30, 10).await.unwrap();
        coord.cache_block(1, 31, 10).await.unwrap();
        coord.cache_block(2, 30, 10).await.unwrap();
        assert_eq!(coord.cached_blocks().await.len(), 3);

        coord.remove_blocks(1, &[30]).await.unwrap();
        assert_eq!(coord.cached_blocks().await, vec![(1, 31, 10), (2, 30, 10)]);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let coord = InMemoryCoordinator::new();
        coord.set_available(false);
        assert!(matches!(
            coord.ping().await,
            Err(CoordinatorError::Unavailable(_))
        ));
        coord.set_available(true);
        assert!(coord.ping().await.is_ok());
    }
}
