//! Replays journals into queryable views: one session's state, or the list of
//! sessions a project can resume.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::message::{ConversationMessage, MessageRole, ProgressEntry, StreamEvent};
use crate::reconcile::reorder_messages;
use crate::session::SessionId;
use crate::session_log::{read_records_at, SessionLog, SessionLogRecord, SESSION_LOG_EXTENSION};

const FIRST_PROMPT_MAX_CHARS: usize = 80;

/// Everything one journal says, folded in file order.
#[derive(Debug, Default, Clone)]
pub struct LoadedSessionState {
    pub messages: Vec<ConversationMessage>,
    /// Persisted progress milestones in append order.
    pub progress: Vec<ProgressEntry>,
    /// Last custom title per session id.
    pub custom_titles: HashMap<SessionId, String>,
    /// Last tag per session id.
    pub tags: HashMap<SessionId, String>,
    pub skipped_lines: usize,
}

impl LoadedSessionState {
    fn fold(records: Vec<SessionLogRecord>, skipped_lines: usize) -> Self {
        let mut state = Self {
            skipped_lines,
            ..Self::default()
        };
        for record in records {
            match record {
                SessionLogRecord::Message { message, .. } => state.messages.push(message),
                SessionLogRecord::CustomTitle {
                    session_id,
                    custom_title,
                } => {
                    state.custom_titles.insert(session_id, custom_title);
                }
                SessionLogRecord::Tag { session_id, tag } => {
                    state.tags.insert(session_id, tag);
                }
                SessionLogRecord::Progress { progress, .. } => state.progress.push(progress),
            }
        }
        state
    }

    /// Messages and milestones in display order, ready for a transcript.
    pub fn display_events(&self) -> Vec<StreamEvent> {
        let events = self
            .messages
            .iter()
            .cloned()
            .map(StreamEvent::Message)
            .chain(self.progress.iter().cloned().map(StreamEvent::Progress));
        reorder_messages(events)
    }
}

/// Summary row for a resume or fork picker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSessionListItem {
    pub session_id: SessionId,
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub message_count: usize,
    pub custom_title: Option<String>,
    pub tag: Option<String>,
    pub first_prompt: Option<String>,
}

impl AgentSessionListItem {
    /// Custom title, else the opening prompt, else the raw id.
    pub fn display_title(&self) -> &str {
        self.custom_title
            .as_deref()
            .or(self.first_prompt.as_deref())
            .unwrap_or(self.session_id.as_str())
    }
}

fn first_prompt(messages: &[ConversationMessage]) -> Option<String> {
    let text = messages
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .find_map(ConversationMessage::first_text)?;
    let line = text.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= FIRST_PROMPT_MAX_CHARS {
        Some(line.to_string())
    } else {
        let mut cut: String = line.chars().take(FIRST_PROMPT_MAX_CHARS - 1).collect();
        cut.push('…');
        Some(cut)
    }
}

impl SessionLog {
    /// Full replay of one session. A missing journal yields empty state.
    pub async fn load_session_log_data(
        &self,
        cwd: &Path,
        session_id: &SessionId,
    ) -> StoreResult<LoadedSessionState> {
        let replayed = self.read_records(cwd, session_id).await?;
        let state = LoadedSessionState::fold(replayed.records, replayed.skipped_lines);
        debug!(
            session_id = %session_id,
            messages = state.messages.len(),
            skipped = state.skipped_lines,
            "session loaded"
        );
        Ok(state)
    }

    /// Only the message sequence, for resuming a conversation.
    pub async fn load_session_messages(
        &self,
        cwd: &Path,
        session_id: &SessionId,
    ) -> StoreResult<Vec<ConversationMessage>> {
        let replayed = self.read_records(cwd, session_id).await?;
        Ok(replayed
            .records
            .into_iter()
            .filter_map(|record| match record {
                SessionLogRecord::Message { message, .. } => Some(message),
                _ => None,
            })
            .collect())
    }

    /// Sessions of this project that hold at least one message, newest first.
    pub async fn list_resumable_sessions(
        &self,
        cwd: &Path,
    ) -> StoreResult<Vec<AgentSessionListItem>> {
        let dir = self.project_dir(cwd);
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io("listing project journals", &dir, e)),
        };

        let mut items = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| StoreError::io("listing project journals", &dir, e))?
        {
            let path = entry.path();
            if path.extension().map(|e| e != SESSION_LOG_EXTENSION).unwrap_or(true) {
                continue;
            }
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable journal");
                    continue;
                }
            };

            let replayed = match read_records_at(&path).await {
                Ok(replayed) => replayed,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable journal");
                    continue;
                }
            };
            let session_id = SessionId::from(stem);
            let mut state = LoadedSessionState::fold(replayed.records, replayed.skipped_lines);
            if state.messages.is_empty() {
                continue;
            }

            items.push(AgentSessionListItem {
                custom_title: state.custom_titles.remove(&session_id),
                tag: state.tags.remove(&session_id),
                first_prompt: first_prompt(&state.messages),
                message_count: state.messages.len(),
                session_id,
                path,
                modified,
            });
        }

        items.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(items)
    }
}
