//! Local file-based state storage backend.
//!
//! The snapshot lives in a single JSON file. Saves write a temporary file,
//! fsync it and rename it over the previous snapshot, so a crash leaves
//! either the old or the new snapshot on disk and never a mix.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, StateError, V6labError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::{STATE_VERSION, StateSnapshot};

/// Default state directory name.
pub const STATE_DIR: &str = ".v6lab";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a new local state store under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| V6labError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Returns the path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                V6labError::State(StateError::write(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            V6labError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            V6labError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    async fn write_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info).map_err(|e| {
            V6labError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        let lock_failed = |action: &str, e: std::io::Error| {
            V6labError::State(StateError::LockFailed {
                message: format!("Failed to {action} lock file: {e}"),
            })
        };

        let mut file = fs::File::create(&self.lock_path)
            .await
            .map_err(|e| lock_failed("create", e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| lock_failed("write", e))?;
        file.sync_all().await.map_err(|e| lock_failed("sync", e))?;

        Ok(())
    }

    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                V6labError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        info!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            V6labError::State(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })
        })?;

        let raw: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
            V6labError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        // Check the format version before interpreting the rest.
        let found = raw
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| {
                V6labError::State(StateError::Corrupted {
                    message: String::from("State file has no format version"),
                })
            })?;
        if found != STATE_VERSION {
            return Err(V6labError::State(StateError::VersionMismatch {
                expected: STATE_VERSION,
                found,
            }));
        }

        let state: StateSnapshot = serde_json::from_value(raw).map_err(|e| {
            V6labError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        debug!(
            "Loaded state serial {} with {} resources",
            state.serial,
            state.resources.len()
        );
        Ok(Some(state))
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        self.ensure_dir().await?;

        info!(
            "Saving state serial {} to: {}",
            state.serial,
            self.state_path.display()
        );

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            V6labError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        let write_failed =
            |action: &str, e: std::io::Error| V6labError::State(StateError::write(format!("Failed to {action}: {e}")));

        let temp_path = self.state_path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| write_failed("create temp state file", e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| write_failed("write state file", e))?;
        file.sync_all()
            .await
            .map_err(|e| write_failed("sync state file", e))?;
        drop(file);

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| write_failed("rename state file", e))?;

        debug!("State saved successfully");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path).await.map_err(|e| {
                V6labError::State(StateError::write(format!(
                    "Failed to delete state file: {e}"
                )))
            })?;
        }

        self.delete_lock_file().await?;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(V6labError::State(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock held by {} found, taking over", existing.holder);
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id);
        self.write_lock_file(&lock_info).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.read_lock_file().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceKey, ResourceKind};
    use crate::state::SnapshotEntry;
    use chrono::Utc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(STATE_DIR));
        (store, temp_dir)
    }

    fn sample_state() -> StateSnapshot {
        let mut state = StateSnapshot::new("test-project", "dev");
        let now = Utc::now();
        state.upsert(
            ResourceKey::new(ResourceKind::Vpc, "main"),
            SnapshotEntry {
                kind: ResourceKind::Vpc,
                name: String::from("main"),
                id: String::from("vpc-0001"),
                order: 0,
                properties: std::collections::BTreeMap::new(),
                outputs: std::collections::BTreeMap::from([(
                    String::from("id"),
                    serde_json::json!("vpc-0001"),
                )]),
                dependencies: vec![],
                created_at: now,
                updated_at: now,
            },
        );
        state
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let state = sample_state();
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded, state);
        assert!(!store.state_path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_snapshot() {
        let (store, _temp) = create_test_store();

        let mut state = sample_state();
        store.save(&state).await.expect("first save");
        state.serial = 7;
        state.resources.clear();
        store.save(&state).await.expect("second save");

        let loaded = store.load().await.expect("load").expect("exists");
        assert_eq!(loaded.serial, 7);
        assert!(loaded.resources.is_empty());
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let (store, _temp) = create_test_store();
        store.save(&sample_state()).await.expect("save");

        let content = std::fs::read_to_string(store.state_path()).expect("read");
        let mut raw: serde_json::Value = serde_json::from_str(&content).expect("json");
        raw["version"] = serde_json::json!(99);
        std::fs::write(store.state_path(), raw.to_string()).expect("write");

        let err = store.load().await.expect_err("version mismatch");
        assert!(matches!(
            err,
            V6labError::State(StateError::VersionMismatch { expected: 1, found: 99 })
        ));
    }

    #[tokio::test]
    async fn test_corrupted_state() {
        let (store, _temp) = create_test_store();
        store.save(&sample_state()).await.expect("save");
        std::fs::write(store.state_path(), "{ not json").expect("write");

        let err = store.load().await.expect_err("corrupted");
        assert!(matches!(err, V6labError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1")
            .await
            .expect("Failed to acquire first lock");

        let err = store.acquire_lock("holder-2").await.expect_err("conflict");
        assert!(matches!(
            err,
            V6labError::State(StateError::LockedByOther { ref holder, .. }) if holder == "holder-1"
        ));
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, _temp) = create_test_store();
        store
            .write_lock_file(&LockInfo::with_expiry("crashed", -5))
            .await
            .expect("write stale lock");

        let lock = store.acquire_lock("holder-2").await.expect("take over");
        assert_eq!(lock.holder, "holder-2");
    }
}
