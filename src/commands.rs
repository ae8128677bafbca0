//! Handlers behind the `/rename`, `/tag`, `/fork` and `/resume` commands.
//!
//! Each returns the text to show the user, and only once the journal write
//! (or read) has succeeded. Errors go back to the command layer untouched.

use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::session::{SessionContext, SessionId};
use crate::session_index::LoadedSessionState;
use crate::session_log::SessionLog;

/// Command handler result: user-facing success text.
pub type CommandResult = StoreResult<String>;

fn non_empty<'a>(what: &str, value: &'a str) -> StoreResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidArgument(format!("{what} must not be empty")));
    }
    Ok(trimmed)
}

pub async fn rename_session(log: &SessionLog, ctx: &SessionContext, title: &str) -> CommandResult {
    let title = non_empty("title", title)?;
    log.append_custom_title(ctx, title).await?;
    info!(session_id = %ctx.session_id(), "session renamed");
    Ok(format!("Session renamed to \"{title}\""))
}

pub async fn tag_session(log: &SessionLog, ctx: &SessionContext, tag: &str) -> CommandResult {
    let tag = non_empty("tag", tag)?;
    log.append_tag(ctx, tag).await?;
    info!(session_id = %ctx.session_id(), tag, "session tagged");
    Ok(format!("Session tagged \"{tag}\""))
}

/// Copy the current conversation into a fresh session and rebind `ctx` to it.
pub async fn fork_session(log: &SessionLog, ctx: &mut SessionContext) -> CommandResult {
    let fork = ctx.forked();
    let copied = log
        .fork(ctx.cwd(), ctx.session_id(), fork.session_id())
        .await?;
    let source = ctx.session_id().clone();
    ctx.rebind(fork.session_id().clone());
    Ok(format!(
        "Forked session {source} into {} ({copied} records)",
        ctx.session_id()
    ))
}

/// Outcome of a resume: the replayed session and the text to show.
#[derive(Debug)]
pub struct Resumed {
    pub state: LoadedSessionState,
    pub summary: String,
}

/// Load `session_id` and rebind `ctx` so later appends continue it.
pub async fn resume_session(
    log: &SessionLog,
    ctx: &mut SessionContext,
    session_id: SessionId,
) -> StoreResult<Resumed> {
    let state = log.load_session_log_data(ctx.cwd(), &session_id).await?;
    if state.messages.is_empty() {
        return Err(StoreError::InvalidArgument(format!(
            "no conversation to resume for session {session_id}"
        )));
    }
    let summary = match state.custom_titles.get(&session_id) {
        Some(title) => format!("Resumed \"{title}\" ({} messages)", state.messages.len()),
        None => format!("Resumed session {session_id} ({} messages)", state.messages.len()),
    };
    ctx.rebind(session_id);
    Ok(Resumed { state, summary })
}
