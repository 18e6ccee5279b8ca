//! fieldsync: command-line access to the offline attachment store.
//!
//! Every command opens the store under `FIELDSYNC_DATA_DIR` and prints JSON
//! on stdout. Logs go to stderr (or `LOG_FILE`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_stream::StreamExt as _;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use fieldsync_app::{AppConfig, CaptureInput, FieldSync, OwnerRef, PhotoKind};
use fieldsync_jobs::{RunOutcome, SchedulerEvent};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(author, version, about = "Offline photo capture and upload queue")]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory (overrides FIELDSYNC_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and run migrations
    Init,

    /// Create an owner record
    OwnerAdd {
        /// Owner as kind/id, e.g. schedule/sched-1
        #[arg(value_parser = parse_owner)]
        owner: OwnerRef,

        /// Display title
        #[arg(short, long, default_value = "")]
        title: String,
    },

    /// Stage photos for upload
    Stage {
        /// Owner as kind/id
        #[arg(value_parser = parse_owner)]
        owner: OwnerRef,

        /// before or after
        #[arg(short = 'k', long, default_value = "before")]
        photo_kind: PhotoKind,

        /// Source files
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
    },

    /// Delete a photo and queue its remote deletion
    Delete {
        /// Owner as kind/id
        #[arg(value_parser = parse_owner)]
        owner: OwnerRef,

        /// Attachment id
        attachment_id: Uuid,

        /// URL/filename last seen for the photo
        #[arg(long)]
        remote_ref: Option<String>,
    },

    /// Upload everything pending, then exit
    Sync,

    /// Run the background scheduler until Ctrl-C, printing events
    Watch,

    /// Show pending and failed upload counts
    Status,

    /// Show an owner's photo list
    Photos {
        /// Owner as kind/id
        #[arg(value_parser = parse_owner)]
        owner: OwnerRef,
    },
}

fn parse_owner(value: &str) -> Result<OwnerRef, String> {
    let (kind, id) = value
        .split_once('/')
        .ok_or_else(|| format!("expected kind/id, got {:?}", value))?;
    if id.trim().is_empty() {
        return Err("owner id is empty".to_string());
    }
    Ok(OwnerRef::new(kind.parse()?, id))
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Initialize tracing.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   RUST_LOG    - standard env filter (default: "fieldsync=info")
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "fieldsync=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("fieldsync.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(non_blocking),
                )
                .init();
        }
        Some(guard)
    } else {
        // stdout carries command output
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
        None
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    // Only `watch` keeps the background scheduler alive; other commands
    // exit as soon as they are done.
    if !matches!(cli.command, Commands::Watch) {
        config.scheduler.enabled = false;
    }

    let app = FieldSync::open(config).await?;
    let result = run(&app, cli.command).await;
    app.shutdown().await?;
    result
}

async fn run(app: &FieldSync, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            let config = app.config();
            print_json(&serde_json::json!({
                "data_dir": config.data_dir,
                "database": config.database_path(),
                "attachments_dir": config.attachments_dir(),
            }))
        }
        Commands::OwnerAdd { owner, title } => {
            let created = app.create_owner(&owner, &title).await?;
            print_json(&serde_json::json!({
                "owner": owner,
                "created": created,
            }))
        }
        Commands::Stage {
            owner,
            photo_kind,
            files,
        } => {
            let inputs: Vec<CaptureInput> = files
                .into_iter()
                .map(|f| CaptureInput::new(f, photo_kind))
                .collect();
            let outcome = app.stage_batch(&owner, &inputs).await?;
            let rejected: Vec<_> = outcome
                .rejected
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "source": r.source,
                        "reason": r.reason.to_string(),
                    })
                })
                .collect();
            print_json(&serde_json::json!({
                "staged": outcome.staged,
                "rejected": rejected,
            }))
        }
        Commands::Delete {
            owner,
            attachment_id,
            remote_ref,
        } => {
            let outcome = app
                .request_delete(&owner, attachment_id, remote_ref.as_deref())
                .await?;
            print_json(&serde_json::json!({
                "entry_removed": outcome.entry_removed,
                "tombstone_written": outcome.tombstone_written,
                "row_marked": outcome.row_marked,
                "binary_released": outcome.binary_released,
            }))
        }
        Commands::Sync => {
            let outcome = app.sync_now().await;
            let status = app.status().await?;
            print_json(&serde_json::json!({
                "outcome": outcome_json(&outcome),
                "status": status,
            }))?;
            if let RunOutcome::Failed { error } = outcome {
                anyhow::bail!("sync failed: {error}");
            }
            Ok(())
        }
        Commands::Watch => {
            let events = app.events();
            tokio::pin!(events);
            app.check_pending_uploads();
            info!("Watching uploads, press Ctrl-C to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.next() => match event {
                        Some(event) => print_event(&event)?,
                        None => break,
                    },
                }
            }
            Ok(())
        }
        Commands::Status => {
            let status = app.status().await?;
            print_json(&serde_json::to_value(status)?)
        }
        Commands::Photos { owner } => {
            let photos = app.photos(&owner).await?;
            print_json(&serde_json::to_value(photos)?)
        }
    }
}

fn outcome_json(outcome: &RunOutcome) -> serde_json::Value {
    match outcome {
        RunOutcome::AlreadyRunning => serde_json::json!({ "result": "already_running" }),
        RunOutcome::Quiescent { iterations } => {
            serde_json::json!({ "result": "quiescent", "iterations": iterations })
        }
        RunOutcome::Failed { error } => serde_json::json!({ "result": "failed", "error": error }),
        RunOutcome::Cancelled => serde_json::json!({ "result": "cancelled" }),
    }
}

fn print_event(event: &SchedulerEvent) -> anyhow::Result<()> {
    let value = match event {
        SchedulerEvent::Progress(progress) => {
            serde_json::json!({ "event": "progress", "progress": progress })
        }
        SchedulerEvent::Status(status) => serde_json::json!({ "event": "status", "status": status }),
        SchedulerEvent::UploadError { error } => {
            serde_json::json!({ "event": "upload_error", "error": error })
        }
        SchedulerEvent::Quiescent { iterations } => {
            serde_json::json!({ "event": "quiescent", "iterations": iterations })
        }
        SchedulerEvent::RetryScheduled { attempt, delay_ms } => {
            serde_json::json!({ "event": "retry_scheduled", "attempt": attempt, "delay_ms": delay_ms })
        }
        SchedulerEvent::RetriesExhausted { attempts } => {
            serde_json::json!({ "event": "retries_exhausted", "attempts": attempts })
        }
        other => serde_json::json!({ "event": format!("{other:?}") }),
    };
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_app::OwnerKind;

    #[test]
    fn test_parse_owner() {
        let owner = parse_owner("invoice/inv-42").unwrap();
        assert_eq!(owner.kind, OwnerKind::Invoice);
        assert_eq!(owner.id, "inv-42");
    }

    #[test]
    fn test_parse_owner_rejects_bad_input() {
        assert!(parse_owner("sched-1").is_err());
        assert!(parse_owner("schedule/").is_err());
        assert!(parse_owner("truck/t-1").is_err());
    }

    #[test]
    fn test_cli_parses_stage() {
        let cli = Cli::try_parse_from([
            "fieldsync",
            "stage",
            "schedule/sched-1",
            "-k",
            "after",
            "a.jpg",
            "b.jpg",
        ])
        .unwrap();
        match cli.command {
            Commands::Stage {
                owner,
                photo_kind,
                files,
            } => {
                assert_eq!(owner, OwnerRef::schedule("sched-1"));
                assert_eq!(photo_kind, PhotoKind::After);
                assert_eq!(files.len(), 2);
            }
            _ => panic!("expected stage"),
        }
    }
}
