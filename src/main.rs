use amawta_session::commands::{fork_session, rename_session, tag_session};
use amawta_session::{
    build_deterministic_session_id, AgentPersistedState, AgentStateKey, AgentStateStore, Config,
    SessionContext, SessionId, SessionLog,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Amawta session engine - inspect and edit session journals and sub-agent state
#[derive(Parser, Debug)]
#[command(name = "amawta-session", version, about)]
struct Args {
    /// Project working directory (defaults to the current directory)
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Config file (defaults to $AMAWTA_CONFIG_DIR/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List resumable sessions, newest first
    List,
    /// Print a session's replayed state
    Show { session: String },
    /// Set a session's custom title
    Rename { session: String, title: String },
    /// Set a session's tag
    Tag { session: String, tag: String },
    /// Copy a session's conversation into a new session
    Fork { session: String },
    /// Read or write sub-agent scratch state
    State {
        #[command(subcommand)]
        action: StateAction,
    },
    /// Print the deterministic sub-agent session id for a key
    AdkId { namespace: String, key: String },
}

#[derive(Subcommand, Debug)]
enum StateAction {
    Get { namespace: String, key: String },
    Set { namespace: String, key: String, json: String },
    Clear { namespace: String, key: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("AMAWTA_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::resolve(args.config.as_deref())?;
    let cwd = match args.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir()?,
    };
    info!(
        cwd = %cwd.display(),
        config_dir = %config.config_dir.display(),
        "amawta-session starting"
    );

    let log = SessionLog::from_config(&config);
    let ctx_for = |session: String| SessionContext::new(cwd.clone(), SessionId::from(session));

    match args.command {
        Command::List => {
            let items = log.list_resumable_sessions(&cwd).await?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        Command::Show { session } => {
            let id = SessionId::from(session);
            let state = log.load_session_log_data(&cwd, &id).await?;
            let out = serde_json::json!({
                "sessionId": id,
                "customTitle": state.custom_titles.get(&id),
                "tag": state.tags.get(&id),
                "skippedLines": state.skipped_lines,
                "events": state.display_events(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Rename { session, title } => {
            println!("{}", rename_session(&log, &ctx_for(session), &title).await?);
        }
        Command::Tag { session, tag } => {
            println!("{}", tag_session(&log, &ctx_for(session), &tag).await?);
        }
        Command::Fork { session } => {
            let mut ctx = ctx_for(session);
            println!("{}", fork_session(&log, &mut ctx).await?);
        }
        Command::State { action } => {
            let store = AgentStateStore::from_config(&config);
            match action {
                StateAction::Get { namespace, key } => {
                    let state = store.load(&AgentStateKey::new(namespace, key)).await?;
                    println!("{}", serde_json::to_string_pretty(&state)?);
                }
                StateAction::Set {
                    namespace,
                    key,
                    json,
                } => {
                    let state: AgentPersistedState = serde_json::from_str(&json)?;
                    store.save(&AgentStateKey::new(namespace, key), &state).await?;
                }
                StateAction::Clear { namespace, key } => {
                    store.clear(&AgentStateKey::new(namespace, key)).await?;
                }
            }
        }
        Command::AdkId { namespace, key } => {
            println!("{}", build_deterministic_session_id(&namespace, &key));
        }
    }

    Ok(())
}
