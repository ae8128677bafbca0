//! Append-only JSONL journal, one file per (project, session).
//!
//! ```jsonl
//! {"type":"message","sessionId":"s1","message":{"uuid":"m1","role":"user","content":[{"type":"text","text":"hi"}]}}
//! {"type":"custom-title","sessionId":"s1","customTitle":"My Session"}
//! {"type":"tag","sessionId":"s1","tag":"pr"}
//! ```
//!
//! File position is the only ordering key. Nothing is rewritten or deleted.
//! The log assumes one writer per session (one CLI process owns one active
//! session); unlocked concurrent appenders may interleave lines, and replay
//! skips whatever does not parse. Enable [`SessionLog::with_append_lock`] when
//! that precondition cannot hold.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::lock::{LockManager, LockOptions};
use crate::message::{ConversationMessage, ProgressEntry};
use crate::session::{SessionContext, SessionId};

pub const SESSION_LOG_EXTENSION: &str = "jsonl";

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum SessionLogRecord {
    Message {
        session_id: SessionId,
        message: ConversationMessage,
    },
    CustomTitle {
        session_id: SessionId,
        custom_title: String,
    },
    Tag {
        session_id: SessionId,
        tag: String,
    },
    Progress {
        session_id: SessionId,
        progress: ProgressEntry,
    },
}

impl SessionLogRecord {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Message { session_id, .. }
            | Self::CustomTitle { session_id, .. }
            | Self::Tag { session_id, .. }
            | Self::Progress { session_id, .. } => session_id,
        }
    }

    fn with_session_id(self, id: SessionId) -> Self {
        match self {
            Self::Message { message, .. } => Self::Message {
                session_id: id,
                message,
            },
            Self::CustomTitle { custom_title, .. } => Self::CustomTitle {
                session_id: id,
                custom_title,
            },
            Self::Tag { tag, .. } => Self::Tag { session_id: id, tag },
            Self::Progress { progress, .. } => Self::Progress {
                session_id: id,
                progress,
            },
        }
    }
}

/// Records read back from one journal, in file order.
#[derive(Debug, Default)]
pub struct ReplayedRecords {
    pub records: Vec<SessionLogRecord>,
    /// Lines that failed to parse (truncated tail, interleaved writes).
    pub skipped_lines: usize,
}

/// Replace every character outside `[A-Za-z0-9]` with `-`.
pub fn sanitize_cwd(cwd: &Path) -> String {
    cwd.to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Session ids become file names, so they must not be able to name a
/// different directory.
pub fn validate_session_id(id: &SessionId) -> StoreResult<()> {
    let raw = id.as_str();
    if raw.is_empty() || raw == "." || raw == ".." || raw.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidArgument(format!(
            "session id {raw:?} cannot name a journal file"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SessionLog {
    projects_root: PathBuf,
    append_lock: Option<LockManager>,
}

impl SessionLog {
    pub fn new(projects_root: impl Into<PathBuf>) -> Self {
        Self {
            projects_root: projects_root.into(),
            append_lock: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let log = Self::new(config.projects_dir());
        if config.session_log.lock_appends {
            log.with_append_lock(LockManager::new(LockOptions::from(&config.lock)))
        } else {
            log
        }
    }

    /// Serialize appends through `locks`, like state-store saves.
    pub fn with_append_lock(mut self, locks: LockManager) -> Self {
        self.append_lock = Some(locks);
        self
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    /// Directory holding every journal of one project.
    pub fn project_dir(&self, cwd: &Path) -> PathBuf {
        self.projects_root.join(sanitize_cwd(cwd))
    }

    /// `<projects_root>/<sanitized cwd>/<session id>.jsonl`
    pub fn session_log_file_path(&self, cwd: &Path, session_id: &SessionId) -> PathBuf {
        self.project_dir(cwd)
            .join(format!("{}.{SESSION_LOG_EXTENSION}", session_id.as_str()))
    }

    /// Append one record to the journal named by `record`'s session id.
    pub async fn append(&self, cwd: &Path, record: &SessionLogRecord) -> StoreResult<()> {
        validate_session_id(record.session_id())?;
        let path = self.session_log_file_path(cwd, record.session_id());
        let mut line =
            serde_json::to_string(record).map_err(|e| StoreError::serialize(&path, e))?;
        line.push('\n');
        self.append_raw(&path, line.as_bytes()).await?;
        debug!(
            session_id = %record.session_id(),
            path = %path.display(),
            "journal record appended"
        );
        Ok(())
    }

    pub async fn append_message(
        &self,
        ctx: &SessionContext,
        message: ConversationMessage,
    ) -> StoreResult<()> {
        let record = SessionLogRecord::Message {
            session_id: ctx.session_id().clone(),
            message,
        };
        self.append(ctx.cwd(), &record).await
    }

    pub async fn append_custom_title(
        &self,
        ctx: &SessionContext,
        custom_title: impl Into<String>,
    ) -> StoreResult<()> {
        let record = SessionLogRecord::CustomTitle {
            session_id: ctx.session_id().clone(),
            custom_title: custom_title.into(),
        };
        self.append(ctx.cwd(), &record).await
    }

    pub async fn append_tag(
        &self,
        ctx: &SessionContext,
        tag: impl Into<String>,
    ) -> StoreResult<()> {
        let record = SessionLogRecord::Tag {
            session_id: ctx.session_id().clone(),
            tag: tag.into(),
        };
        self.append(ctx.cwd(), &record).await
    }

    /// Journal a persisted progress entry. Live status never reaches disk.
    pub async fn append_progress_milestone(
        &self,
        ctx: &SessionContext,
        progress: ProgressEntry,
    ) -> StoreResult<()> {
        if !progress.persisted {
            return Err(StoreError::TransientProgress {
                tool_use_id: progress.tool_use_id,
            });
        }
        let record = SessionLogRecord::Progress {
            session_id: ctx.session_id().clone(),
            progress,
        };
        self.append(ctx.cwd(), &record).await
    }

    /// Read every parseable record of one journal. A missing journal is empty.
    pub async fn read_records(
        &self,
        cwd: &Path,
        session_id: &SessionId,
    ) -> StoreResult<ReplayedRecords> {
        validate_session_id(session_id)?;
        read_records_at(&self.session_log_file_path(cwd, session_id)).await
    }

    /// Copy the conversation of `source` (messages and milestones) into the
    /// journal of `target`. Returns the number of records copied.
    pub async fn fork(
        &self,
        cwd: &Path,
        source: &SessionId,
        target: &SessionId,
    ) -> StoreResult<usize> {
        validate_session_id(target)?;
        let replayed = self.read_records(cwd, source).await?;
        let target_path = self.session_log_file_path(cwd, target);

        let mut body = String::new();
        let mut copied = 0;
        for record in replayed.records {
            if !matches!(
                record,
                SessionLogRecord::Message { .. } | SessionLogRecord::Progress { .. }
            ) {
                continue;
            }
            let record = record.with_session_id(target.clone());
            let line = serde_json::to_string(&record)
                .map_err(|e| StoreError::serialize(&target_path, e))?;
            body.push_str(&line);
            body.push('\n');
            copied += 1;
        }

        if copied > 0 {
            self.append_raw(&target_path, body.as_bytes()).await?;
        }
        info!(source = %source, target = %target, copied, "session forked");
        Ok(copied)
    }

    async fn append_raw(&self, path: &Path, bytes: &[u8]) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io("creating journal directory", parent, e))?;
        }
        match &self.append_lock {
            Some(locks) => locks.with_lock(path, || append_bytes(path, bytes)).await,
            None => append_bytes(path, bytes).await,
        }
    }
}

async fn append_bytes(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| StoreError::io("opening journal for append", path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io("appending to journal", path, e))?;
    file.flush()
        .await
        .map_err(|e| StoreError::io("flushing journal", path, e))
}

/// Parse a journal file line by line, skipping lines that are not records.
pub async fn read_records_at(path: &Path) -> StoreResult<ReplayedRecords> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ReplayedRecords::default());
        }
        Err(e) => return Err(StoreError::io("reading journal", path, e)),
    };

    let mut replayed = ReplayedRecords::default();
    for (index, raw) in bytes.split(|b| *b == b'\n').enumerate() {
        if raw.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<SessionLogRecord>(raw) {
            Ok(record) => replayed.records.push(record),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "skipping corrupt journal line"
                );
                replayed.skipped_lines += 1;
            }
        }
    }
    Ok(replayed)
}
