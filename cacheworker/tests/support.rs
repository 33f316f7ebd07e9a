#![allow(dead_code)]

use cacheworker::block::store::WorkerPaths;
use cacheworker::block::{BlockDataManager, ManagerOptions};
use cacheworker::coordinator::InMemoryCoordinator;
use cacheworker::ufs::{LocalUnderFileSystem, UnderFileSystem};
use common::{BlockId, SessionId};
use std::path::Path;
use std::sync::{Arc, Once};
use tempfile::TempDir;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .target(env_logger::Target::Stdout)
            .is_test(true)
            .init();
    });
}

pub struct TestWorker {
    pub local: TempDir,
    pub durable: TempDir,
    pub coordinator: Arc<InMemoryCoordinator>,
    pub manager: Arc<BlockDataManager>,
}

pub async fn open(options: ManagerOptions) -> TestWorker {
    open_with(options, |root| Arc::new(LocalUnderFileSystem::new(root))).await
}

/// Opens a manager whose under file system is built by `ufs` from the
/// durable root directory.
pub async fn open_with<F>(options: ManagerOptions, ufs: F) -> TestWorker
where
    F: FnOnce(&Path) -> Arc<dyn UnderFileSystem>,
{
    init_logging();
    let local = tempfile::tempdir().unwrap();
    let durable = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let manager = BlockDataManager::open(
        WorkerPaths::new(local.path(), 1),
        options,
        coordinator.clone(),
        ufs(durable.path()),
    )
    .await
    .unwrap();
    TestWorker {
        local,
        durable,
        coordinator,
        manager: Arc::new(manager),
    }
}

pub fn with_capacity(capacity_bytes: u64) -> ManagerOptions {
    ManagerOptions {
        capacity_bytes,
        ..Default::default()
    }
}

/// Writes `data` into the session's temp folder as block `block_id`.
pub async fn write_block(m: &BlockDataManager, session_id: SessionId, block_id: BlockId, data: &[u8]) {
    m.create_user_folders(session_id).await.unwrap();
    tokio::fs::write(m.paths().temp_block_path(session_id, block_id), data)
        .await
        .unwrap();
}

/// Registers file `file_id` made of `blocks` and caches every block through
/// `session_id`.
pub async fn cache_file(
    w: &TestWorker,
    session_id: SessionId,
    file_id: u64,
    blocks: &[(BlockId, u64)],
) {
    w.coordinator.register_file(file_id, blocks, None).await;
    for &(block_id, len) in blocks {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        write_block(&w.manager, session_id, block_id, &data).await;
        w.manager.cache_block(session_id, block_id).await.unwrap();
    }
}
