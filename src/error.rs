use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the session engine.
///
/// Absent files are never errors (they load as empty state), and corrupt
/// journal lines are skipped during replay rather than reported here.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("timed out acquiring lock {path} after {attempts} attempts")]
    LockTimeout { path: PathBuf, attempts: u32 },

    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize JSON for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state file {path} does not hold a JSON object: {source}")]
    InvalidState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("progress entry for tool use '{tool_use_id}' is not persisted")]
    TransientProgress { tool_use_id: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no config directory: set AMAWTA_CONFIG_DIR or HOME")]
    NoConfigDir,
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn serialize(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Serialize {
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn invalid_state(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::InvalidState {
            path: path.into(),
            source,
        }
    }

    /// True when the error is a lock acquisition timeout, which callers may retry.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_message_names_operation_and_path() {
        let err = StoreError::io(
            "renaming temp file",
            "/tmp/state.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("renaming temp file"));
        assert!(msg.contains("/tmp/state.json"));
        assert!(!err.is_lock_timeout());
    }

    #[test]
    fn test_lock_timeout_is_retryable() {
        let err = StoreError::LockTimeout {
            path: PathBuf::from("/tmp/x.json.lock"),
            attempts: 3,
        };
        assert!(err.is_lock_timeout());
        assert!(err.to_string().contains("3 attempts"));
    }
}
