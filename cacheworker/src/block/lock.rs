//! Reference-counted shared locks on committed blocks.
//!
//! A lock only pins a block against eviction. Acquiring never waits: every
//! `lock` increments the `(block, session)` count and returns immediately, so
//! readers never queue behind each other and no session can starve another.
//! Unlocking an unknown pair, or below zero, does nothing; clients retry
//! unlocks after transport errors.

use common::{BlockId, SessionId};
use std::collections::{HashMap, HashSet};
use tokio::sync::{RwLock, RwLockReadGuard};

#[derive(Default)]
pub struct LockState {
    by_block: HashMap<BlockId, HashMap<SessionId, u32>>,
    by_session: HashMap<SessionId, HashSet<BlockId>>,
}

impl LockState {
    pub fn is_locked(&self, block_id: BlockId) -> bool {
        self.by_block
            .get(&block_id)
            .is_some_and(|holders| holders.values().any(|&c| c > 0))
    }

    fn count(&self, block_id: BlockId, session_id: SessionId) -> u32 {
        self.by_block
            .get(&block_id)
            .and_then(|holders| holders.get(&session_id))
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Default)]
pub struct LockTable {
    state: RwLock<LockState>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, block_id: BlockId, session_id: SessionId) -> u32 {
        let mut state = self.state.write().await;
        let count = state
            .by_block
            .entry(block_id)
            .or_default()
            .entry(session_id)
            .or_insert(0);
        *count += 1;
        let count = *count;
        state.by_session.entry(session_id).or_default().insert(block_id);
        count
    }

    /// Returns the remaining count of the pair.
    pub async fn unlock(&self, block_id: BlockId, session_id: SessionId) -> u32 {
        let mut state = self.state.write().await;
        let Some(holders) = state.by_block.get_mut(&block_id) else {
            return 0;
        };
        let Some(count) = holders.get_mut(&session_id) else {
            return 0;
        };
        *count = count.saturating_sub(1);
        if *count > 0 {
            return *count;
        }

        holders.remove(&session_id);
        if holders.is_empty() {
            state.by_block.remove(&block_id);
        }
        if let Some(blocks) = state.by_session.get_mut(&session_id) {
            blocks.remove(&block_id);
            if blocks.is_empty() {
                state.by_session.remove(&session_id);
            }
        }
        0
    }

    pub async fn is_locked(&self, block_id: BlockId) -> bool {
        self.state.read().await.is_locked(block_id)
    }

    pub async fn count(&self, block_id: BlockId, session_id: SessionId) -> u32 {
        self.state.read().await.count(block_id, session_id)
    }

    pub async fn held_by(&self, session_id: SessionId) -> HashMap<BlockId, u32> {
        let state = self.state.read().await;
        state
            .by_session
            .get(&session_id)
            .map(|blocks| {
                blocks
                    .iter()
                    .map(|&b| (b, state.count(b, session_id)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops every lock held by `session_id` and returns what was held.
    pub async fn release_session(&self, session_id: SessionId) -> HashMap<BlockId, u32> {
        let mut state = self.state.write().await;
        let Some(blocks) = state.by_session.remove(&session_id) else {
            return HashMap::new();
        };
        let mut released = HashMap::with_capacity(blocks.len());
        for block_id in blocks {
            if let Some(holders) = state.by_block.get_mut(&block_id) {
                if let Some(count) = holders.remove(&session_id) {
                    released.insert(block_id, count);
                }
                if holders.is_empty() {
                    state.by_block.remove(&block_id);
                }
            }
        }
        released
    }

    /// Shared view of the table held while the allocator picks eviction
    /// victims, so no block gets locked in between.
    pub async fn read(&self) -> RwLockReadGuard<'_, LockState> {
        self.state.read().await
    }
}
