//! Namespaced scratch state for sub-agents.
//!
//! Each [`AgentStateKey`] maps to exactly one JSON file under the state root.
//! Writes are serialized across processes by the lock manager and committed
//! with an atomic rename; reads take no lock.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::atomic::{read_if_exists, write_atomic};
use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::lock::{LockManager, LockOptions};

/// Prefix of every id produced by [`build_deterministic_session_id`].
pub const ADK_SESSION_PREFIX: &str = "adk-";
const NAMESPACE_SLUG_MAX: usize = 40;

/// Opaque state owned by one sub-agent conversation.
pub type AgentPersistedState = Map<String, Value>;

/// Identifies one isolated bucket of sub-agent state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStateKey {
    pub namespace: String,
    pub conversation_key: String,
}

impl AgentStateKey {
    pub fn new(namespace: impl Into<String>, conversation_key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            conversation_key: conversation_key.into(),
        }
    }

    /// Reproducible session identity for an external sub-agent runtime.
    pub fn deterministic_session_id(&self) -> String {
        build_deterministic_session_id(&self.namespace, &self.conversation_key)
    }
}

/// Stable, content-derived session id: identical inputs give identical
/// output, and the namespace is length-prefixed so `("a", "bc")` and
/// `("ab", "c")` never collide.
pub fn build_deterministic_session_id(namespace: &str, conversation_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((namespace.len() as u64).to_be_bytes());
    hasher.update(namespace.as_bytes());
    hasher.update(conversation_key.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{ADK_SESSION_PREFIX}{}", &digest[..32])
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn namespace_slug(namespace: &str) -> String {
    let slug: String = namespace
        .chars()
        .take(NAMESPACE_SLUG_MAX)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if slug.is_empty() {
        "ns".to_string()
    } else {
        slug
    }
}

/// File-backed store for [`AgentPersistedState`].
#[derive(Debug, Clone)]
pub struct AgentStateStore {
    root: PathBuf,
    locks: LockManager,
}

impl AgentStateStore {
    pub fn new(root: impl Into<PathBuf>, locks: LockManager) -> Self {
        Self {
            root: root.into(),
            locks,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.state_dir(),
            LockManager::new(LockOptions::from(&config.lock)),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<slug>-<ns digest>/<key digest>.json`. The slug only aids
    /// humans browsing the directory; the digests carry identity.
    pub fn path_for(&self, key: &AgentStateKey) -> PathBuf {
        let namespace_dir = format!(
            "{}-{}",
            namespace_slug(&key.namespace),
            &sha256_hex(&key.namespace)[..12]
        );
        self.root
            .join(namespace_dir)
            .join(format!("{}.json", sha256_hex(&key.conversation_key)))
    }

    /// Load a key's state. A key that was never saved loads as an empty map.
    pub async fn load(&self, key: &AgentStateKey) -> StoreResult<AgentPersistedState> {
        let path = self.path_for(key);
        match read_if_exists(&path).await? {
            None => {
                debug!(namespace = %key.namespace, "no saved agent state");
                Ok(AgentPersistedState::new())
            }
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::invalid_state(&path, e))
            }
        }
    }

    /// Replace a key's state under its lock.
    pub async fn save(&self, key: &AgentStateKey, state: &AgentPersistedState) -> StoreResult<()> {
        let path = self.path_for(key);
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| StoreError::serialize(&path, e))?;
        self.ensure_parent(&path).await?;

        self.locks
            .with_lock(&path, || write_atomic(&path, &bytes))
            .await?;
        info!(namespace = %key.namespace, entries = state.len(), "agent state saved");
        Ok(())
    }

    /// Forget a key's state. Clearing a key with no state succeeds.
    pub async fn clear(&self, key: &AgentStateKey) -> StoreResult<()> {
        let path = self.path_for(key);
        self.ensure_parent(&path).await?;
        self.locks
            .with_lock(&path, || async {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(StoreError::io("removing agent state", &path, e)),
                }
            })
            .await
    }

    async fn ensure_parent(&self, path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io("creating state directory", parent, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::lock_path_for;
    use serde_json::json;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn store(root: &Path) -> AgentStateStore {
        AgentStateStore::new(
            root,
            LockManager::new(LockOptions {
                stale_after: Duration::from_secs(30),
                max_attempts: 3,
                retry_min: Duration::from_millis(1),
                retry_max: Duration::from_millis(2),
            }),
        )
    }

    fn state(value: Value) -> AgentPersistedState {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = AgentStateKey::new("planner", "conv-1");
        let saved = state(json!({"step": 3, "notes": ["a", "b"], "nested": {"ok": true}}));

        store.save(&key, &saved).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap(), saved);
    }

    #[tokio::test]
    async fn test_missing_key_loads_empty() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let loaded = store.load(&AgentStateKey::new("planner", "never")).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let k1 = AgentStateKey::new("planner", "conv-1");
        let k2 = AgentStateKey::new("planner", "conv-2");
        let k3 = AgentStateKey::new("reviewer", "conv-1");

        store.save(&k2, &state(json!({"who": "k2"}))).await.unwrap();
        store.save(&k1, &state(json!({"who": "k1"}))).await.unwrap();

        assert_eq!(store.load(&k2).await.unwrap()["who"], "k2");
        assert_eq!(store.load(&k1).await.unwrap()["who"], "k1");
        assert!(store.load(&k3).await.unwrap().is_empty());
    }

    #[test]
    fn test_paths_are_stable_and_distinct() {
        let store = store(Path::new("/state"));
        let a = AgentStateKey::new("ns/x", "key");
        let b = AgentStateKey::new("ns-x", "key");
        let c = AgentStateKey::new("ns/x", "key2");

        assert_eq!(store.path_for(&a), store.path_for(&a.clone()));
        assert_ne!(store.path_for(&a), store.path_for(&b));
        assert_ne!(store.path_for(&a), store.path_for(&c));
        assert!(store.path_for(&a).starts_with("/state"));
    }

    #[test]
    fn test_deterministic_session_id() {
        let first = build_deterministic_session_id("planner", "conv-1");
        let again = build_deterministic_session_id("planner", "conv-1");
        let other = build_deterministic_session_id("planner", "conv-2");
        let shifted = build_deterministic_session_id("plannerc", "onv-1");

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_ne!(first, shifted);
        assert!(first.starts_with(ADK_SESSION_PREFIX));
        assert_eq!(first.len(), ADK_SESSION_PREFIX.len() + 32);
        assert_eq!(
            AgentStateKey::new("planner", "conv-1").deterministic_session_id(),
            first
        );
    }

    #[tokio::test]
    async fn test_save_recovers_stale_lock() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = AgentStateKey::new("planner", "conv-1");
        let path = store.path_for(&key);
        let lock_dir = lock_path_for(&path);
        std::fs::create_dir_all(&lock_dir).unwrap();
        let old = SystemTime::now() - Duration::from_secs(600);
        filetime::set_file_mtime(&lock_dir, filetime::FileTime::from_system_time(old)).unwrap();

        store.save(&key, &state(json!({"x": 1}))).await.unwrap();
        assert!(!lock_dir.exists());
        assert_eq!(store.load(&key).await.unwrap()["x"], 1);
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_artifacts() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = AgentStateKey::new("planner", "conv-1");

        store.save(&key, &state(json!({"x": 1}))).await.unwrap();
        store.save(&key, &state(json!({"x": 2}))).await.unwrap();

        let path = store.path_for(&key);
        let names: Vec<String> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![path.file_name().unwrap().to_string_lossy().into_owned()]
        );
    }

    #[tokio::test]
    async fn test_lock_timeout_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = AgentStateKey::new("planner", "conv-1");
        store.save(&key, &state(json!({"v": "before"}))).await.unwrap();

        let path = store.path_for(&key);
        std::fs::create_dir(lock_path_for(&path)).unwrap();

        let err = store.save(&key, &state(json!({"v": "after"}))).await.unwrap_err();
        assert!(err.is_lock_timeout());
        assert_eq!(store.load(&key).await.unwrap()["v"], "before");
    }

    #[tokio::test]
    async fn test_concurrent_saves_on_one_key_both_land() {
        let dir = tempdir().unwrap();
        let store = AgentStateStore::new(
            dir.path(),
            LockManager::new(LockOptions {
                stale_after: Duration::from_secs(30),
                max_attempts: 1000,
                retry_min: Duration::from_millis(1),
                retry_max: Duration::from_millis(3),
            }),
        );
        let key = AgentStateKey::new("planner", "conv-1");
        let a = state(json!({"writer": "a", "items": [1, 2, 3]}));
        let b = state(json!({"writer": "b", "items": [4, 5]}));

        let (first, second) = tokio::join!(store.save(&key, &a), store.save(&key, &b));
        first.unwrap();
        second.unwrap();

        let loaded = store.load(&key).await.unwrap();
        assert!(loaded == a || loaded == b);
        assert!(!lock_path_for(&store.path_for(&key)).exists());
    }

    #[tokio::test]
    async fn test_clear_removes_state() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = AgentStateKey::new("planner", "conv-1");

        store.clear(&key).await.unwrap();
        store.save(&key, &state(json!({"x": 1}))).await.unwrap();
        store.clear(&key).await.unwrap();
        assert!(store.load(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_object_file_is_invalid_state() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = AgentStateKey::new("planner", "conv-1");
        let path = store.path_for(&key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[1,2,3]").unwrap();

        assert!(matches!(
            store.load(&key).await,
            Err(StoreError::InvalidState { .. })
        ));
    }
}
