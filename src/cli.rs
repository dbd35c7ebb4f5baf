use clap::{Args, Parser, Subcommand};

use crate::types::{DateRange, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "photosync-rs",
    version,
    about = "Mirror a Google Photos library into a local directory",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Options for the default `sync` command
    #[command(flatten)]
    pub sync: SyncArgs,

    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,
}

impl Cli {
    /// The command to run; `sync` when none was given.
    pub fn effective_command(self) -> Command {
        self.command.unwrap_or(Command::Sync(self.sync))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Index new items and download everything pending (default)
    Sync(SyncArgs),

    /// Show ledger statistics
    Status(StatusArgs),

    /// Move quarantined items back to pending, then sync
    RetryQuarantined(SyncArgs),

    /// Remove partial downloads left by interrupted runs
    Clean(LibraryArgs),
}

/// Where the library and its ledger live.
#[derive(Args, Debug, Clone)]
pub struct LibraryArgs {
    /// Root directory of the local library
    #[arg(short = 'd', long, default_value = ".")]
    pub directory: String,

    /// Ledger database path (default: <directory>/sync.db)
    #[arg(long)]
    pub db: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    #[command(flatten)]
    pub library: LibraryArgs,

    /// OAuth2 credentials JSON file (default: <directory>/credentials.json)
    #[arg(long)]
    pub creds: Option<String>,

    /// Index the whole library instead of only items newer than the last sync
    #[arg(long, conflicts_with = "dates")]
    pub all: bool,

    /// Index only this window of capture dates, END exclusive
    /// (e.g. 2012-12-12..2012-12-14). Repeatable.
    #[arg(long = "dates", value_name = "START..END")]
    pub dates: Vec<DateRange>,

    /// Number of concurrent downloads
    #[arg(
        long = "threads",
        default_value_t = 4,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub threads_num: u16,

    /// Max retries per request (0 = no retries)
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Initial retry delay in seconds
    #[arg(long, default_value_t = 2)]
    pub retry_delay: u64,

    /// Date folder layout, or "none" for a flat directory
    #[arg(long, default_value = "%Y/%m/%d")]
    pub folder_structure: String,

    /// Only update the ledger; do not download content
    #[arg(long)]
    pub skip_download: bool,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub library: LibraryArgs,

    /// List quarantined items with their reasons
    #[arg(long)]
    pub failed: bool,
}
