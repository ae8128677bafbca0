//! Crash-safe write-replace primitive.
//!
//! Content goes to a uniquely named sibling temp file, is synced, then
//! renamed over the target. The temp file lives in the same directory so the
//! rename stays on one filesystem.

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Suffix shared by every in-flight temp file.
pub const TEMP_SUFFIX: &str = ".tmp";

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let token: u64 = rand::random();
    path.with_file_name(format!(".{name}.{token:016x}{TEMP_SUFFIX}"))
}

/// Atomically replace `path` with `bytes`. Readers observe either the old
/// content or the new content, and the temp file never outlives the call.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let tmp = temp_path_for(path);
    match write_and_commit(&tmp, path, bytes).await {
        Ok(()) => {
            debug!(path = %path.display(), bytes = bytes.len(), "atomic write committed");
            Ok(())
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

async fn write_and_commit(tmp: &Path, path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let mut file = tokio::fs::File::create(tmp)
        .await
        .map_err(|e| StoreError::io("creating temp file", tmp, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io("writing temp file", tmp, e))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::io("syncing temp file", tmp, e))?;
    drop(file);

    tokio::fs::rename(tmp, path)
        .await
        .map_err(|e| StoreError::io("renaming temp file into place", path, e))
}

/// Read `path`, returning `None` when it does not exist.
pub async fn read_if_exists(path: &Path) -> StoreResult<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io("reading file", path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(TEMP_SUFFIX))
            .collect()
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");

        write_atomic(&path, b"{\"a\":1}").await.unwrap();
        write_atomic(&path, b"{\"a\":2}").await.unwrap();

        let bytes = read_if_exists(&path).await.unwrap().unwrap();
        assert_eq!(bytes, b"{\"a\":2}");
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_read_missing_is_absent() {
        let dir = tempdir().unwrap();
        assert!(read_if_exists(&dir.path().join("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_directory_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            read_if_exists(dir.path()).await,
            Err(StoreError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_rename_cleans_temp_file() {
        let dir = tempdir().unwrap();
        // A non-empty directory at the target makes the rename fail.
        let target = dir.path().join("occupied");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("child"), b"x").unwrap();

        let err = write_atomic(&target, b"data").await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_missing_parent_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("data.json");
        assert!(write_atomic(&path, b"x").await.is_err());
        assert!(!dir.path().join("missing").exists());
    }

    #[test]
    fn test_temp_names_are_unique_siblings() {
        let path = Path::new("/state/ns/key.json");
        let a = temp_path_for(path);
        let b = temp_path_for(path);
        assert_ne!(a, b);
        assert_eq!(a.parent(), path.parent());
        assert!(a.file_name().unwrap().to_string_lossy().starts_with(".key.json."));
    }
}
