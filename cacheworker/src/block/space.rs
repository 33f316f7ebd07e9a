//! Space accounting of the local storage directory.
//!
//! Capacity is shared by committed blocks and per-session reservations:
//! `committed + Σ reserved <= capacity` holds after every operation. When a
//! reservation does not fit, committed blocks that no session has locked are
//! evicted, least recently accessed first.
//!
//! Lock order: the lock table guard is always taken before the allocator
//! guard, and the block store (a leaf) last. Block files of evicted blocks are
//! deleted only after both guards are released.

use common::{BlockId, SessionId};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::lock::LockTable;
use super::store::{BlockMeta, BlockStore};
use crate::error::{Result, WorkerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpaceUsage {
    pub capacity: u64,
    pub reserved: u64,
    pub committed: u64,
}

impl SpaceUsage {
    pub fn available(&self) -> u64 {
        self.capacity
            .saturating_sub(self.reserved.saturating_add(self.committed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SpaceState {
    capacity: u64,
    committed: u64,
    reserved_total: u64,
    reserved: HashMap<SessionId, u64>,
}

impl SpaceState {
    fn available(&self) -> u64 {
        self.capacity
            .saturating_sub(self.reserved_total.saturating_add(self.committed))
    }

    fn reserve(&mut self, session_id: SessionId, bytes: u64) {
        *self.reserved.entry(session_id).or_insert(0) += bytes;
        self.reserved_total += bytes;
    }

    /// Gives back up to `bytes` of the session's reservation, returns how much.
    fn unreserve(&mut self, session_id: SessionId, bytes: u64) -> u64 {
        let Some(held) = self.reserved.get_mut(&session_id) else {
            return 0;
        };
        let taken = bytes.min(*held);
        *held -= taken;
        if *held == 0 {
            self.reserved.remove(&session_id);
        }
        self.reserved_total -= taken;
        taken
    }
}

pub struct SpaceAllocator {
    state: Mutex<SpaceState>,
    locks: Arc<LockTable>,
    store: Arc<BlockStore>,
    removed: Mutex<Vec<BlockId>>,
}

impl SpaceAllocator {
    /// `committed` is the size of the blocks already held at startup.
    pub fn new(capacity: u64, committed: u64, locks: Arc<LockTable>, store: Arc<BlockStore>) -> Self {
        if committed > capacity {
            warn!("committed blocks ({committed} bytes) exceed capacity ({capacity} bytes)");
        }
        Self {
            state: Mutex::new(SpaceState {
                capacity,
                committed,
                reserved_total: 0,
                reserved: HashMap::new(),
            }),
            locks,
            store,
            removed: Mutex::new(Vec::new()),
        }
    }

    pub async fn usage(&self) -> SpaceUsage {
        let state = self.state.lock().await;
        SpaceUsage {
            capacity: state.capacity,
            reserved: state.reserved_total,
            committed: state.committed,
        }
    }

    pub async fn reserved_by(&self, session_id: SessionId) -> u64 {
        let state = self.state.lock().await;
        state.reserved.get(&session_id).copied().unwrap_or(0)
    }

    /// Reserves `bytes` for `session_id`, evicting unlocked committed blocks
    /// if needed. Fails with `CapacityExceeded` when the request still does
    /// not fit once no evictable block is left.
    pub async fn request_space(&self, session_id: SessionId, bytes: u64) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.available() >= bytes {
                state.reserve(session_id, bytes);
                return Ok(());
            }
        }

        let (outcome, evicted) = {
            let locks = self.locks.read().await;
            let mut state = self.state.lock().await;
            let mut evicted: Vec<BlockMeta> = Vec::new();
            while state.available() < bytes {
                let Some(victim) = self
                    .store
                    .take_least_recent(|id| locks.is_locked(id))
                    .await
                else {
                    break;
                };
                state.committed = state.committed.saturating_sub(victim.size);
                evicted.push(victim);
            }
            let available = state.available();
            let outcome = if available >= bytes {
                state.reserve(session_id, bytes);
                Ok(())
            } else {
                Err(WorkerError::CapacityExceeded {
                    requested: bytes,
                    available,
                })
            };
            (outcome, evicted)
        };

        self.discard(evicted).await;
        outcome
    }

    /// Returns up to `bytes` of the session's reservation.
    pub async fn return_space(&self, session_id: SessionId, bytes: u64) -> u64 {
        let mut state = self.state.lock().await;
        let returned = state.unreserve(session_id, bytes);
        if returned < bytes {
            warn!(
                "session {session_id} returned {bytes} bytes but only held {returned} bytes"
            );
        }
        returned
    }

    /// Accounts a block of `bytes` cached by `session_id`. The session's
    /// reservation is consumed first; any remainder must fit in the free
    /// capacity. Returns the amount taken from the reservation.
    pub async fn commit_block(&self, session_id: SessionId, bytes: u64) -> Result<u64> {
        let mut state = self.state.lock().await;
        let held = state.reserved.get(&session_id).copied().unwrap_or(0);
        let from_reservation = held.min(bytes);
        let extra = bytes - from_reservation;
        let available = state.available();
        if extra > available {
            return Err(WorkerError::CapacityExceeded {
                requested: extra,
                available,
            });
        }
        state.unreserve(session_id, from_reservation);
        state.committed += bytes;
        Ok(from_reservation)
    }

    /// Undoes `commit_block` when the block could not be moved into place.
    pub async fn rollback_commit(&self, session_id: SessionId, bytes: u64, from_reservation: u64) {
        let mut state = self.state.lock().await;
        state.committed = state.committed.saturating_sub(bytes);
        if from_reservation > 0 {
            state.reserve(session_id, from_reservation);
        }
    }

    /// Returns the whole reservation of `session_id`.
    pub async fn release_session(&self, session_id: SessionId) -> u64 {
        let mut state = self.state.lock().await;
        state.unreserve(session_id, u64::MAX)
    }

    /// Ids of evicted blocks not yet reported to the coordinator.
    pub async fn take_removed_blocks(&self) -> Vec<BlockId> {
        std::mem::take(&mut *self.removed.lock().await)
    }

    /// Puts back ids that could not be reported, ahead of newer ones.
    pub async fn restore_removed_blocks(&self, mut block_ids: Vec<BlockId>) {
        let mut removed = self.removed.lock().await;
        block_ids.append(&mut removed);
        *removed = block_ids;
    }

    async fn discard(&self, evicted: Vec<BlockMeta>) {
        if evicted.is_empty() {
            return;
        }
        let mut ids = Vec::with_capacity(evicted.len());
        for block in evicted {
            info!(
                "evicted block {} ({} bytes) from {}",
                block.block_id,
                block.size,
                block.location.display()
            );
            match tokio::fs::remove_file(&block.location).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    warn!("failed to delete evicted block {}: {e}", block.block_id);
                }
                _ => {}
            }
            ids.push(block.block_id);
        }
        self.removed.lock().await.extend(ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::store::WorkerPaths;

    struct Fixture {
        _tmp: tempfile::TempDir,
        locks: Arc<LockTable>,
        store: Arc<BlockStore>,
        space: SpaceAllocator,
    }

    async fn fixture(capacity: u64, blocks: &[(BlockId, u64)]) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(BlockStore::new(WorkerPaths::new(tmp.path(), 1)));
        std::fs::create_dir_all(store.paths().data_folder()).unwrap();
        let mut committed = 0;
        for &(id, size) in blocks {
            let path = store.paths().block_path(id);
            std::fs::write(&path, vec![1u8; size as usize]).unwrap();
            store.stage(1, id, size).await;
            store.promote(id, size, path).await;
            committed += size;
        }
        let locks = Arc::new(LockTable::new());
        let space = SpaceAllocator::new(capacity, committed, locks.clone(), store.clone());
        Fixture {
            _tmp: tmp,
            locks,
            store,
            space,
        }
    }

    #[tokio::test]
    async fn test_request_then_return_restores_state() {
        let f = fixture(1000, &[(1, 200)]).await;
        f.space.request_space(5, 50).await.unwrap();
        let before = f.space.state.lock().await.clone();

        f.space.request_space(6, 300).await.unwrap();
        assert_eq!(f.space.return_space(6, 300).await, 300);

        assert_eq!(*f.space.state.lock().await, before);
    }

    #[tokio::test]
    async fn test_return_is_clamped() {
        let f = fixture(100, &[]).await;
        f.space.request_space(1, 10).await.unwrap();
        assert_eq!(f.space.return_space(1, 40).await, 10);
        assert_eq!(f.space.return_space(2, 40).await, 0);
        assert_eq!(f.space.usage().await.reserved, 0);
    }

    #[tokio::test]
    async fn test_eviction_frees_space_for_request() {
        let f = fixture(1000, &[(1, 300), (2, 300), (3, 300)]).await;
        f.space.request_space(1, 100).await.unwrap();
        assert_eq!(f.space.usage().await.available(), 0);

        f.space.request_space(2, 500).await.unwrap();
        let usage = f.space.usage().await;
        assert_eq!(usage.reserved, 600);
        assert_eq!(usage.committed, 300);
        assert!(usage.reserved + usage.committed <= usage.capacity);

        let mut removed = f.space.take_removed_blocks().await;
        removed.sort_unstable();
        assert_eq!(removed.len(), 2);
        for id in &removed {
            assert!(f.store.get(*id).await.is_none());
            assert!(!f.store.paths().block_path(*id).exists());
        }
        assert!(f.space.take_removed_blocks().await.is_empty());

        // ids that could not be reported come back first
        f.space.request_space(3, 300).await.unwrap();
        let newer = f.space.take_removed_blocks().await;
        assert_eq!(newer.len(), 1);
        f.space.restore_removed_blocks(newer.clone()).await;
        f.space.restore_removed_blocks(removed.clone()).await;
        let mut expected = removed;
        expected.extend(newer);
        assert_eq!(f.space.take_removed_blocks().await, expected);
    }

    #[tokio::test]
    async fn test_locked_blocks_are_never_evicted() {
        let f = fixture(1000, &[(1, 300), (2, 300), (3, 300)]).await;
        f.locks.lock(1, 7).await;
        f.locks.lock(3, 8).await;

        let err = f.space.request_space(9, 600).await.unwrap_err();
        assert!(matches!(err, WorkerError::CapacityExceeded { .. }));
        // the unlocked block went, the locked ones stayed
        assert!(f.store.committed(1).await.is_some());
        assert!(f.store.committed(2).await.is_none());
        assert!(f.store.committed(3).await.is_some());
        assert_eq!(f.space.reserved_by(9).await, 0);
    }

    #[tokio::test]
    async fn test_commit_consumes_reservation() {
        let f = fixture(1000, &[]).await;
        f.space.request_space(4, 100).await.unwrap();
        assert_eq!(f.space.commit_block(4, 80).await.unwrap(), 80);
        assert_eq!(f.space.reserved_by(4).await, 20);

        // 150 bytes: 20 from the reservation, 130 from free space
        assert_eq!(f.space.commit_block(4, 150).await.unwrap(), 20);
        let usage = f.space.usage().await;
        assert_eq!(usage.committed, 230);
        assert_eq!(usage.reserved, 0);

        f.space.rollback_commit(4, 150, 20).await;
        assert_eq!(f.space.reserved_by(4).await, 20);
        assert_eq!(f.space.usage().await.committed, 80);
    }

    #[tokio::test]
    async fn test_commit_beyond_capacity_fails() {
        let f = fixture(100, &[]).await;
        f.space.request_space(1, 90).await.unwrap();
        assert!(f.space.commit_block(2, 20).await.is_err());
        assert_eq!(f.space.usage().await.committed, 0);
    }

    #[tokio::test]
    async fn test_release_session_returns_everything() {
        let f = fixture(1000, &[]).await;
        f.space.request_space(3, 10).await.unwrap();
        f.space.request_space(3, 15).await.unwrap();
        assert_eq!(f.space.release_session(3).await, 25);
        assert_eq!(f.space.release_session(3).await, 0);
        assert_eq!(f.space.usage().await, SpaceUsage {
            capacity: 1000,
            reserved: 0,
            committed: 0,
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_never_overcommit() {
        let f = Arc::new(fixture(1000, &[]).await);
        let mut tasks = Vec::new();
        for session in 0..20u64 {
            let f = f.clone();
            tasks.push(tokio::spawn(async move {
                f.space.request_space(session, 100).await.is_ok()
            }));
        }
        let mut granted = 0;
        for t in tasks {
            if t.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
        assert_eq!(f.space.usage().await.reserved, 1000);
    }
}
