//! `tasksync`: headless host for the sync engine.
//!
//! Edits the local task lists from the command line and, when an account
//! is configured, keeps them in sync with every other device. Configuration
//! via CLI flags, environment variables, or config file
//! (`~/.config/tasksync/config.toml`).
//!
//! ```bash
//! # Local-only edits
//! cargo run --bin tasksync -- add-list Groceries
//! cargo run --bin tasksync -- show
//!
//! # Follow a relay until Ctrl-C
//! cargo run --bin tasksync -- sync --remote-url http://127.0.0.1:8080 \
//!     --account alice --token secret --transport push
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use chrono::{Local, TimeZone};
use clap::Parser;
use tasksync_proto::model::{Document, ItemId, ListId, Millis};
use tasksync_proto::remote::DeviceId;
use tracing_appender::non_blocking::WorkerGuard;

use tasksync::auth::{Identity, StaticTokenProvider};
use tasksync::clock::SystemClock;
use tasksync::config::{CliArgs, ClientConfig, Command, ConfigError};
use tasksync::store::StoreError;
use tasksync::store::file::{FileStore, load_or_create_device_id};
use tasksync::sync::{SyncEngine, SyncError, SyncHandle, SyncStatus};
use tasksync::transport::RemoteTransportFactory;

/// How long to wait for the first contact with the remote.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Extra time for a replayed snapshot to arrive after the link came up.
const SETTLE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("{0}")]
    Lookup(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(data_dir = %config.data_dir.display(), "tasksync starting");

    let command = cli.command.clone().unwrap_or(Command::Show);
    match run(command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging.
///
/// Logs go to `file_path` when given, otherwise to stderr so that stdout
/// stays clean for command output. Returns a [`WorkerGuard`] that must be
/// held until shutdown to ensure all buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let (non_blocking, guard, ansi) = match file_path {
        Some(path) => {
            let log_dir = path.parent()?;
            let file_name = path.file_name()?.to_str()?;
            let appender = tracing_appender::rolling::never(log_dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (writer, guard, false)
        }
        None => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            (writer, guard, true)
        }
    };

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(ansi)
        .init();

    Some(guard)
}

async fn run(command: Command, config: &ClientConfig) -> Result<(), AppError> {
    let handle = start_engine(config).await?;
    let signed_in = match config.remote_account() {
        Some((account, _, _)) => {
            handle.sign_in(Identity::new(account)).await?;
            settle(&handle).await;
            true
        }
        None => {
            if command == Command::Sync {
                return Err(AppError::Lookup(
                    "sync needs --account, --token and --remote-url".to_string(),
                ));
            }
            false
        }
    };

    let result = execute(&handle, command, signed_in).await;
    handle.shutdown().await?;
    result
}

async fn start_engine(config: &ClientConfig) -> Result<SyncHandle, AppError> {
    let device_id = match &config.device_id {
        Some(id) => DeviceId::new(id.clone()),
        None => load_or_create_device_id(&config.data_dir)?,
    };
    let factory = RemoteTransportFactory {
        base_url: config.remote_url.clone().unwrap_or_default(),
        kind: config.transport,
        request_timeout: config.request_timeout,
        device_id,
        policy: config.poll,
        tokens: StaticTokenProvider::new(config.token.clone().unwrap_or_default()),
    };
    let store = FileStore::in_dir(&config.data_dir);
    Ok(SyncEngine::spawn(factory, store, SystemClock, config.sync.clone()).await?)
}

/// Waits for the first poll or subscription to finish so that one-shot edits
/// are made on top of the latest remote state.
async fn settle(handle: &SyncHandle) {
    let mut status = handle.watch_status();
    let reached = tokio::time::timeout(
        SETTLE_TIMEOUT,
        status.wait_for(|s| *s != SyncStatus::Disconnected),
    )
    .await
    .map(|r| r.map(|current| current.clone()));
    match reached {
        Ok(Ok(current)) => tracing::info!(status = %current, "remote reached"),
        Ok(Err(_)) => return,
        Err(_) => {
            tracing::warn!(timeout = ?SETTLE_TIMEOUT, "remote not reached, continuing offline");
            return;
        }
    }
    tokio::time::sleep(SETTLE_GRACE).await;
}

async fn execute(handle: &SyncHandle, command: Command, signed_in: bool) -> Result<(), AppError> {
    match command {
        Command::Sync => return follow(handle).await,
        Command::Show => {
            print!("{}", render(&handle.document()));
            return Ok(());
        }
        Command::AddList { title } => {
            let id = handle.create_list(title).await?;
            println!("{id}");
        }
        Command::AddItem { list, content } => {
            let list_id = resolve_list(&handle.document(), &list)?;
            let id = handle.create_item(list_id, content).await?;
            println!("{id}");
        }
        Command::Toggle { item } => {
            let item_id = resolve_item(&handle.document(), &item)?;
            handle.toggle_completion(item_id).await?;
        }
        Command::DeleteList { list } => {
            let list_id = resolve_list(&handle.document(), &list)?;
            handle.delete_list(list_id).await?;
        }
        Command::DeleteItem { item } => {
            let item_id = resolve_item(&handle.document(), &item)?;
            handle.delete_item(item_id).await?;
        }
    }

    match handle.flush().await {
        Ok(()) => Ok(()),
        Err(SyncError::Transport(e)) if signed_in => {
            // Saved locally; the next `sync` run uploads it.
            tracing::warn!(error = %e, "edit saved locally but not uploaded");
            eprintln!("warning: saved locally, upload failed: {e}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Runs until Ctrl-C, logging every status change.
async fn follow(handle: &SyncHandle) -> Result<(), AppError> {
    handle.manual_refresh().await?;
    let mut status = handle.watch_status();
    println!("status: {}", *status.borrow_and_update());

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("status: {}", *status.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }
    Ok(())
}

fn resolve_list(doc: &Document, prefix: &str) -> Result<ListId, AppError> {
    let ids: Vec<ListId> = doc.lists.iter().map(|l| l.id).collect();
    resolve_prefix(&ids, prefix, "list")
}

fn resolve_item(doc: &Document, prefix: &str) -> Result<ItemId, AppError> {
    let ids: Vec<ItemId> = doc.item_ids().collect();
    resolve_prefix(&ids, prefix, "item")
}

fn resolve_prefix<T: Copy + std::fmt::Display>(
    ids: &[T],
    prefix: &str,
    what: &str,
) -> Result<T, AppError> {
    let prefix = prefix.to_ascii_lowercase();
    let mut matches = ids.iter().filter(|id| id.to_string().starts_with(&prefix));
    match (matches.next(), matches.next()) {
        (Some(id), None) if !prefix.is_empty() => Ok(*id),
        (Some(_), _) => Err(AppError::Lookup(format!("{what} id {prefix:?} is ambiguous"))),
        (None, _) => Err(AppError::Lookup(format!("no {what} matches {prefix:?}"))),
    }
}

fn render(doc: &Document) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    if doc.is_empty() {
        out.push_str("(no lists)\n");
        return out;
    }
    for list in doc.lists.iter().filter(|l| l.is_visible) {
        let _ = writeln!(
            out,
            "{}  {}  [{} items, updated {}]",
            short(&list.id),
            list.title,
            list.items.len(),
            format_time(list.last_modified)
        );
        for item in &list.items {
            let mark = if item.is_completed { "x" } else { " " };
            let _ = writeln!(out, "  [{mark}] {}  {}", short(&item.id), item.content);
        }
    }
    out
}

fn short(id: &impl std::fmt::Display) -> String {
    id.to_string().chars().take(8).collect()
}

fn format_time(ms: Millis) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(|ms| Local.timestamp_millis_opt(ms).single())
        .map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasksync_proto::model::{TaskItem, TaskList};

    #[test]
    fn prefix_lookup() {
        let a = ListId::new();
        let b = ListId::new();
        let ids = [a, b];

        assert_eq!(resolve_prefix(&ids, &a.to_string(), "list").unwrap(), a);
        assert!(resolve_prefix(&ids, "", "list").is_err());
        assert!(resolve_prefix(&ids, "zzzz", "list").is_err());
        // v7 ids created back to back share their timestamp prefix.
        assert!(resolve_prefix(&ids, &a.to_string()[..4], "list").is_err());
    }

    #[test]
    fn render_lists_items() {
        let mut list = TaskList::new("Groceries", 0);
        let mut item = TaskItem::new("milk", 0);
        item.is_completed = true;
        list.items.push(item);
        let doc = Document {
            lists: vec![list],
            ..Document::default()
        };

        let out = render(&doc);

        assert!(out.contains("Groceries"));
        assert!(out.contains("[x]"));
        assert!(out.contains("milk"));
        assert_eq!(render(&Document::default()), "(no lists)\n");
    }
}
