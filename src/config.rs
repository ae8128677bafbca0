use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{StoreError, StoreResult};

/// Environment variable that overrides the root config directory.
pub const CONFIG_DIR_ENV: &str = "AMAWTA_CONFIG_DIR";

const CONFIG_FILE_NAME: &str = "config.toml";
const DEFAULT_DIR_NAME: &str = ".amawta";
const STATE_DIR_NAME: &str = "adk-state";
const PROJECTS_DIR_NAME: &str = "projects";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory holding agent state and session journals. Defaults to
    /// the directory containing the config file.
    #[serde(default)]
    pub config_dir: PathBuf,

    /// Lock manager tuning
    #[serde(default)]
    pub lock: LockConfig,

    /// Session journal behavior
    #[serde(default)]
    pub session_log: SessionLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_min_ms")]
    pub retry_min_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionLogConfig {
    /// Serialize appends through the lock manager. Off by default: one CLI
    /// process owns one active session.
    #[serde(default)]
    pub lock_appends: bool,
}

fn default_stale_after_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    200
}

fn default_retry_min_ms() -> u64 {
    5
}

fn default_retry_max_ms() -> u64 {
    50
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            max_attempts: default_max_attempts(),
            retry_min_ms: default_retry_min_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl LockConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| StoreError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            toml::from_str(&content).map_err(|source| StoreError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        if config.config_dir.as_os_str().is_empty() {
            config.config_dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."))
                .to_path_buf();
        }
        info!(config_dir = %config.config_dir.display(), "configuration loaded");
        Ok(config)
    }

    /// Create default configuration rooted at `dir`
    pub fn default_for_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: dir.into(),
            lock: LockConfig::default(),
            session_log: SessionLogConfig::default(),
        }
    }

    /// Resolve configuration: an explicit file wins, then `config.toml` in the
    /// default directory, then built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> StoreResult<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let dir = default_config_dir()?;
        let file = dir.join(CONFIG_FILE_NAME);
        if file.is_file() {
            return Self::from_file(file);
        }
        Ok(Self::default_for_dir(dir))
    }

    /// Directory holding per-key agent state files
    pub fn state_dir(&self) -> PathBuf {
        self.config_dir.join(STATE_DIR_NAME)
    }

    /// Directory holding per-project session journals
    pub fn projects_dir(&self) -> PathBuf {
        self.config_dir.join(PROJECTS_DIR_NAME)
    }
}

/// `$AMAWTA_CONFIG_DIR`, else `~/.amawta`.
pub fn default_config_dir() -> StoreResult<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_DIR_NAME))
        .ok_or(StoreError::NoConfigDir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: Config = toml::from_str(r#"config_dir = "/srv/amawta""#).unwrap();
        assert_eq!(config.config_dir, PathBuf::from("/srv/amawta"));
        assert_eq!(config.lock.stale_after_secs, 30);
        assert_eq!(config.lock.max_attempts, 200);
        assert!(!config.session_log.lock_appends);
        assert_eq!(config.state_dir(), PathBuf::from("/srv/amawta/adk-state"));
        assert_eq!(config.projects_dir(), PathBuf::from("/srv/amawta/projects"));
    }

    #[test]
    fn test_from_file_reads_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
config_dir = "/data"

[lock]
stale_after_secs = 5
retry_max_ms = 20

[session_log]
lock_appends = true
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.lock.stale_after(), Duration::from_secs(5));
        assert_eq!(config.lock.retry_max_ms, 20);
        assert_eq!(config.lock.retry_min_ms, 5);
        assert!(config.session_log.lock_appends);
    }

    #[test]
    fn test_config_dir_defaults_to_file_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[lock]\nmax_attempts = 9\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.config_dir, dir.path());
        assert_eq!(config.lock.max_attempts, 9);
        assert_eq!(config.projects_dir(), dir.path().join("projects"));
    }

    #[test]
    fn test_from_file_reports_parse_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "config_dir = [").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(StoreError::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_resolve_prefers_explicit_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, r#"config_dir = "/explicit""#).unwrap();
        let config = Config::resolve(Some(&path)).unwrap();
        assert_eq!(config.config_dir, PathBuf::from("/explicit"));
    }
}
