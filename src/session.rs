//! Session identity and the explicit context every journal call is bound to.
//!
//! There is no process-wide "current session": resume and fork flows rebind a
//! [`SessionContext`] they own and pass it to the log and loader.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Opaque identifier of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Project directory plus the session subsequent appends target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    cwd: PathBuf,
    session_id: SessionId,
}

impl SessionContext {
    pub fn new(cwd: impl Into<PathBuf>, session_id: SessionId) -> Self {
        Self {
            cwd: cwd.into(),
            session_id,
        }
    }

    /// Context for a brand new conversation in `cwd`.
    pub fn fresh(cwd: impl Into<PathBuf>) -> Self {
        Self::new(cwd, SessionId::generate())
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Point subsequent appends at `session_id` (resume).
    pub fn rebind(&mut self, session_id: SessionId) {
        self.session_id = session_id;
    }

    /// Same project, new identity (fork target).
    pub fn forked(&self) -> Self {
        Self::new(self.cwd.clone(), SessionId::generate())
    }
}
