use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use pacer_alert::redact;
use pacer_core::{SessionId, WorkItem, WorkKind};
use pacer_runner::{doctor_root, Session};
use pacer_storage::RetryStore;

#[derive(Parser)]
#[command(name = "pacer", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create .pacer/ with a default pacer.toml and an empty retry store
    Init,

    /// Validate the config and check the retry store opens
    Doctor,

    /// Pending retry counts for a session, by kind and attempt count
    Stats {
        #[arg(long)]
        session: String,
    },

    /// Show the next ready retry record without removing it
    Peek {
        #[arg(long)]
        session: String,
    },

    /// Record a failed item for retry (attempt 0)
    Enqueue {
        #[arg(long)]
        session: String,
        /// navigation | lookup | extraction
        #[arg(long)]
        kind: WorkKind,
        /// JSON payload
        #[arg(long)]
        payload: String,
    },

    /// Drop every retry record for a session
    Clear {
        #[arg(long)]
        session: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let root = std::env::current_dir()?;
    debug!(root = %root.display(), command = ?cli.cmd, "dispatching");

    match cli.cmd {
        Command::Init => {
            let db = Session::init_root(&root)?;
            println!("Initialized pacer in {} (store: {})", root.display(), db.display());
        }
        Command::Doctor => {
            doctor_root(&root)?;
            println!("OK");
        }
        Command::Stats { session } => {
            let s = Session::open(&root, SessionId::from_str(session))?;
            let stats = s.retries.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Peek { session } => {
            let s = Session::open(&root, SessionId::from_str(session))?;
            match s.store().peek_next_ready()? {
                Some(mut record) => {
                    record.payload = redact(&record.payload);
                    println!("{}", serde_json::to_string_pretty(&record)?);
                }
                None => println!("Nothing ready for session {}", s.id),
            }
        }
        Command::Enqueue { session, kind, payload } => {
            let payload: serde_json::Value = serde_json::from_str(&payload).with_context(|| "parse --payload as JSON")?;
            let s = Session::open(&root, SessionId::from_str(session))?;
            let record = s.retries.schedule(&WorkItem::new(kind, payload))?;
            info!(session = %s.id, record_id = %record.id, kind = %record.kind, "enqueued from cli");
            println!("Enqueued {} record {} due at {}", record.kind, record.id, record.due_at_ms);
        }
        Command::Clear { session } => {
            let s = Session::open(&root, SessionId::from_str(session))?;
            let id = s.id.clone();
            let removed = s.teardown()?;
            info!(session = %id, removed, "cleared from cli");
            println!("Removed {} retry record(s) for session {}", removed, id);
        }
    }

    Ok(())
}
