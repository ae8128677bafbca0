pub mod agent_state;
pub mod atomic;
pub mod commands;
pub mod config;
pub mod error;
pub mod lock;
pub mod message;
pub mod reconcile;
pub mod request_status;
pub mod session;
/// JSONL journal, one append-only file per (project, session).
pub mod session_log;
pub mod session_index;

pub use agent_state::{
    build_deterministic_session_id, AgentPersistedState, AgentStateKey, AgentStateStore,
};
pub use config::Config;
pub use error::{StoreError, StoreResult};
pub use lock::{LockHandle, LockManager, LockOptions};
pub use message::{ContentBlock, ConversationMessage, MessageRole, ProgressEntry, StreamEvent};
pub use reconcile::reorder_messages;
pub use request_status::{RequestKind, RequestStatus, RequestStatusChannel};
pub use session::{SessionContext, SessionId};
pub use session_index::{AgentSessionListItem, LoadedSessionState};
pub use session_log::{SessionLog, SessionLogRecord};
