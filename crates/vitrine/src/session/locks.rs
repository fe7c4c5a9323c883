//! Per-session operation locks.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per session id, created on demand and dropped with the
/// last guard.
#[derive(Debug, Clone, Default)]
pub struct SessionLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to a session.
    pub async fn acquire(&self, session_id: &str) -> SessionGuard {
        let guard = self.slot(session_id).lock_owned().await;
        SessionGuard {
            guard: Some(guard),
            session_id: session_id.to_string(),
            locks: self.inner.clone(),
        }
    }

    /// Exclusive access if nobody else holds it right now.
    pub fn try_acquire(&self, session_id: &str) -> Option<SessionGuard> {
        let guard = self.slot(session_id).try_lock_owned().ok();
        match guard {
            Some(guard) => Some(SessionGuard {
                guard: Some(guard),
                session_id: session_id.to_string(),
                locks: self.inner.clone(),
            }),
            None => {
                self.forget_if_unused(session_id);
                None
            }
        }
    }

    /// Number of sessions with a lock entry.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn forget_if_unused(&self, session_id: &str) {
        self.inner
            .remove_if(session_id, |_, slot| Arc::strong_count(slot) == 1);
    }
}

/// Held for the duration of one orchestration operation.
#[derive(Debug)]
pub struct SessionGuard {
    guard: Option<OwnedMutexGuard<()>>,
    session_id: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // Release first so the map entry is the only remaining reference.
        self.guard.take();
        self.locks
            .remove_if(&self.session_id, |_, slot| Arc::strong_count(slot) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_session_is_serialized() {
        let locks = SessionLocks::new();
        let guard = locks.acquire("s1").await;

        assert!(locks.try_acquire("s1").is_none());
        assert!(locks.try_acquire("s2").is_some());

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("s1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_entries_are_dropped_with_last_guard() {
        let locks = SessionLocks::new();
        {
            let _a = locks.acquire("s1").await;
            let _b = locks.try_acquire("s2");
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }
}
