//! photosync-rs: resumable one-way mirror of a Google Photos library.
//!
//! Remote metadata is indexed into a SQLite ledger first; content is then
//! downloaded for every pending item. Both phases are idempotent and resume
//! from the ledger after interruption or failure.

#![warn(clippy::all)]

mod auth;
mod catalog;
mod cli;
mod config;
mod download;
mod driver;
mod indexer;
mod ledger;
mod lock;
pub mod retry;
mod shutdown;
mod types;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use ledger::{Ledger, SqliteLedger};

/// Connect timeout for API and content requests. No overall timeout is set
/// because video downloads can legitimately take a long time.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let paths = config::LibraryPaths::from_cli(&args.library);

    if !paths.db_path.exists() {
        println!("No ledger found at {}", paths.db_path.display());
        println!("Run a sync first to create it.");
        return Ok(());
    }

    let db = SqliteLedger::open(&paths.db_path).await?;
    let summary = db.get_summary().await?;

    println!("Ledger: {}", db.path().display());
    println!();
    println!("Items:");
    println!("  Total:       {}", summary.total_items);
    println!("  Downloaded:  {}", summary.downloaded);
    println!("  Pending:     {}", summary.pending);
    println!("  Quarantined: {}", summary.quarantined);
    println!();

    if let Some(watermark) = &summary.watermark {
        println!(
            "Indexed capture dates: {} .. {}",
            watermark.min_seen.format("%Y-%m-%d"),
            watermark.max_seen.format("%Y-%m-%d")
        );
    }
    let scanned = db.scanned_ranges().await?;
    if !scanned.is_empty() {
        let ranges: Vec<String> = scanned.iter().map(ToString::to_string).collect();
        println!("Rescanned windows: {}", ranges.join(", "));
    }
    if let Some(started) = &summary.last_sync_started {
        println!(
            "Last sync started:   {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_sync_completed {
        println!(
            "Last sync completed: {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(error) = &summary.last_sync_error {
        println!("Last sync failed:    {error}");
    }

    if args.failed && summary.quarantined > 0 {
        println!();
        println!("Quarantined items:");
        for item in db.get_quarantined().await? {
            println!(
                "  {} ({}) - {}",
                item.filename.as_deref().unwrap_or("-"),
                item.id,
                item.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}

/// Run the clean command.
async fn run_clean(args: cli::LibraryArgs) -> anyhow::Result<()> {
    let paths = config::LibraryPaths::from_cli(&args);
    let _lock = lock::acquire(&paths.directory).await?;

    let removed = download::file::remove_orphaned_parts(&paths.directory).await?;
    println!(
        "Removed {} partial download(s) under {}",
        removed,
        paths.directory.display()
    );
    Ok(())
}

/// Run a sync, optionally moving quarantined items back to pending first.
async fn run_sync(args: cli::SyncArgs, retry_quarantined: bool) -> anyhow::Result<()> {
    let config = config::Config::from_cli(args)?;
    tracing::info!(
        directory = %config.library.directory.display(),
        concurrency = config.threads_num,
        "Starting photosync-rs"
    );

    let lock = lock::acquire(&config.library.directory).await?;
    tracing::debug!(lock = %lock.path().display(), "Library locked");
    let orphaned = download::file::remove_orphaned_parts(&config.library.directory).await?;
    if orphaned > 0 {
        tracing::info!(count = orphaned, "Removed partial downloads from an earlier run");
    }

    let ledger = Arc::new(SqliteLedger::open(&config.library.db_path).await?);
    let checked = ledger.check_consistency().await?;
    tracing::debug!(items = checked, "Ledger consistency verified");

    if retry_quarantined {
        let reset = ledger.reset_quarantined().await?;
        if reset > 0 {
            tracing::info!(count = reset, "Moved quarantined items back to pending");
        } else {
            tracing::info!("No quarantined items to retry");
        }
    }

    let http = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?;
    let tokens = auth::StoredCredentials::load(&config.credentials, http.clone()).await?;
    let catalog: Arc<dyn catalog::RemoteCatalog> =
        Arc::new(catalog::GooglePhotosCatalog::new(http, Arc::new(tokens)));

    let indexer = indexer::Indexer::new(ledger.clone(), catalog.clone(), config.indexer_config());
    let engine = download::DownloadEngine::new(
        ledger.clone(),
        catalog,
        Arc::new(download::paths::DateFolderMapper::new(&config.folder_structure)),
        config.download_config(),
    );
    let driver = driver::Driver::new(ledger, indexer, engine);

    let shutdown_token = shutdown::install_signal_handler()?;
    let report = match driver
        .sync(&config.scopes, config.skip_download, shutdown_token)
        .await
    {
        Ok(report) => report,
        Err(driver::SyncError::Ledger(e)) if e.is_fatal() => anyhow::bail!(
            "{e}. The ledger at {} needs manual inspection before the next sync",
            config.library.db_path.display()
        ),
        Err(e) => return Err(e.into()),
    };
    report.log_summary();

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.effective_command() {
        Command::Sync(args) => run_sync(args, false).await,
        Command::RetryQuarantined(args) => run_sync(args, true).await,
        Command::Status(args) => run_status(args).await,
        Command::Clean(args) => run_clean(args).await,
    }
}
