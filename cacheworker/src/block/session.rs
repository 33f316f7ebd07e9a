//! Liveness map of the sessions talking to this worker.
//!
//! Operations that pin resources on behalf of a session run inside
//! [`SessionRegistry::enter`], which hands out a shared guard on the map.
//! Reclamation takes the exclusive guard, so a session is never torn down
//! while one of its calls is half way through, and a call never resurrects
//! resources of a session that has just been reclaimed.

use chrono::{DateTime, Utc};
use common::SessionId;
use log::debug;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct UserSession {
    pub session_id: SessionId,
    pub last_heartbeat: Instant,
    /// Wall clock time of the last heartbeat, for reporting only.
    pub last_heartbeat_at: DateTime<Utc>,
}

impl UserSession {
    fn new(session_id: SessionId, now: Instant) -> Self {
        Self {
            session_id,
            last_heartbeat: now,
            last_heartbeat_at: Utc::now(),
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }
}

#[derive(Debug, Default)]
pub struct Sessions {
    by_id: HashMap<SessionId, UserSession>,
}

impl Sessions {
    pub fn get(&self, session_id: SessionId) -> Option<&UserSession> {
        self.by_id.get(&session_id)
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.by_id.contains_key(&session_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn remove(&mut self, session_id: SessionId) -> Option<UserSession> {
        self.by_id.remove(&session_id)
    }

    /// Removes and returns every session whose last heartbeat is older than
    /// `threshold`.
    pub fn take_expired(&mut self, threshold: Duration, now: Instant) -> Vec<UserSession> {
        let expired: Vec<SessionId> = self
            .by_id
            .values()
            .filter(|s| s.age(now) > threshold)
            .map(|s| s.session_id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.by_id.remove(&id))
            .collect()
    }

    fn touch(&mut self, session_id: SessionId, now: Instant) -> bool {
        match self.by_id.get_mut(&session_id) {
            Some(s) => {
                s.last_heartbeat = now;
                s.last_heartbeat_at = Utc::now();
                false
            }
            None => {
                self.by_id
                    .insert(session_id, UserSession::new(session_id, now));
                true
            }
        }
    }

    fn ensure(&mut self, session_id: SessionId, now: Instant) -> bool {
        if self.by_id.contains_key(&session_id) {
            return false;
        }
        self.by_id
            .insert(session_id, UserSession::new(session_id, now));
        true
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<Sessions>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a heartbeat. Returns true when the session was not known yet.
    pub async fn touch(&self, session_id: SessionId) -> bool {
        let created = self
            .sessions
            .write()
            .await
            .touch(session_id, Instant::now());
        if created {
            debug!("session {session_id} registered by heartbeat");
        }
        created
    }

    /// Registers `session_id` if needed, without refreshing its heartbeat.
    pub async fn ensure(&self, session_id: SessionId) -> bool {
        self.sessions
            .write()
            .await
            .ensure(session_id, Instant::now())
    }

    /// Makes sure `session_id` exists and returns a shared guard that keeps
    /// reclamation out until dropped. Do not call back into the registry
    /// while holding it.
    pub async fn enter(&self, session_id: SessionId) -> RwLockReadGuard<'_, Sessions> {
        {
            let sessions = self.sessions.read().await;
            if sessions.contains(session_id) {
                return sessions;
            }
        }
        let mut sessions = self.sessions.write().await;
        if sessions.ensure(session_id, Instant::now()) {
            debug!("session {session_id} registered");
        }
        sessions.downgrade()
    }

    pub async fn get(&self, session_id: SessionId) -> Option<UserSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.read().await.contains(session_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn remove(&self, session_id: SessionId) -> Option<UserSession> {
        self.sessions.write().await.remove(session_id)
    }

    pub async fn take_expired(&self, threshold: Duration) -> Vec<UserSession> {
        self.sessions
            .write()
            .await
            .take_expired(threshold, Instant::now())
    }

    /// Exclusive guard used by reclamation.
    pub async fn write(&self) -> RwLockWriteGuard<'_, Sessions> {
        self.sessions.write().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_touch_refreshes_and_ensure_does_not() {
        let r = SessionRegistry::new();
        assert!(r.touch(1).await);
        let first = r.get(1).await.unwrap().last_heartbeat;

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!r.ensure(1).await);
        assert_eq!(r.get(1).await.unwrap().last_heartbeat, first);

        assert!(!r.touch(1).await);
        assert_eq!(
            r.get(1).await.unwrap().last_heartbeat,
            first + Duration::from_millis(200)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_expired_is_strict_and_removes() {
        let r = SessionRegistry::new();
        r.touch(1).await;
        tokio::time::advance(Duration::from_millis(100)).await;
        r.touch(2).await;
        tokio::time::advance(Duration::from_millis(200)).await;

        // session 1 is 300ms old, session 2 is 200ms old
        assert!(r.take_expired(Duration::from_millis(300)).await.is_empty());
        tokio::time::advance(Duration::from_millis(1)).await;
        let expired = r.take_expired(Duration::from_millis(300)).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].session_id, 1);
        assert!(!r.contains(1).await);
        assert!(r.contains(2).await);
        // already gone
        assert!(r.take_expired(Duration::from_millis(300)).await.is_empty());
    }

    #[tokio::test]
    async fn test_enter_registers_lazily() {
        let r = SessionRegistry::new();
        {
            let sessions = r.enter(42).await;
            assert!(sessions.contains(42));
        }
        assert_eq!(r.len().await, 1);
        assert!(r.remove(42).await.is_some());
        assert!(r.remove(42).await.is_none());
    }
}
