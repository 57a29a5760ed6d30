//! In-memory state backend.
//!
//! Used by tests and by dry runs that should never touch the disk. The
//! snapshot is swapped whole under a lock, so readers see either the old
//! or the new commit.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::error::{Result, StateError, V6labError};

use super::lock::{LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::StateSnapshot;

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: RwLock<Option<StateSnapshot>>,
    lock: RwLock<Option<LockInfo>>,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with a snapshot.
    #[must_use]
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            state: RwLock::new(Some(snapshot)),
            ..Self::default()
        }
    }

    /// Number of successful saves so far.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        Ok(self.state.read().await.clone())
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        *self.state.write().await = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.state.write().await = None;
        *self.lock.write().await = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state.read().await.is_some())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut lock = self.lock.write().await;
        if let Some(existing) = lock.as_ref().filter(|l| !l.is_expired()) {
            return Err(V6labError::State(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }));
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let info = LockInfo::new(&holder_id);
        *lock = Some(info.clone());
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut lock = self.lock.write().await;
        if lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *lock = None;
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.read().await.clone())
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .lock
            .read()
            .await
            .as_ref()
            .is_some_and(|l| !l.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let store = MemoryStateStore::new();
        assert!(store.load().await.expect("load").is_none());

        let snapshot = StateSnapshot::new("lab", "dev");
        store.save(&snapshot).await.expect("save");

        assert_eq!(store.load().await.expect("load"), Some(snapshot));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_lock_conflict_and_release() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("a").await.expect("acquire");
        assert!(store.acquire_lock("b").await.is_err());

        store.release_lock("not-the-id").await.expect("noop release");
        assert!(store.is_locked().await.expect("locked"));

        store.release_lock(&lock.lock_id).await.expect("release");
        assert!(store.acquire_lock("b").await.is_ok());
    }
}
