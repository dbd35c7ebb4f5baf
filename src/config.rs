use std::path::PathBuf;
use std::time::Duration;

use crate::cli::{LibraryArgs, SyncArgs};
use crate::download::DownloadConfig;
use crate::indexer::{IndexerConfig, Scope};
use crate::retry::RetryConfig;

const DEFAULT_DB_NAME: &str = "sync.db";
const DEFAULT_CREDENTIALS_NAME: &str = "credentials.json";

/// Upper bound for a single backoff delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Pending items loaded from the ledger per query during downloads.
const PENDING_PAGE_SIZE: usize = 256;

/// Explicit date windows listed at the same time.
const CONCURRENT_SCOPES: usize = 2;

/// Resolved library location shared by every command.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryPaths {
    pub directory: PathBuf,
    pub db_path: PathBuf,
}

impl LibraryPaths {
    pub fn from_cli(args: &LibraryArgs) -> Self {
        let directory = expand_tilde(&args.directory);
        let db_path = args
            .db
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| directory.join(DEFAULT_DB_NAME));
        Self { directory, db_path }
    }
}

/// Application configuration for a sync run.
#[derive(Debug, Clone)]
pub struct Config {
    pub library: LibraryPaths,
    pub credentials: PathBuf,
    pub folder_structure: String,
    pub scopes: Vec<Scope>,
    pub retry: RetryConfig,
    pub threads_num: u16,
    pub skip_download: bool,
    pub no_progress_bar: bool,
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(cli: SyncArgs) -> anyhow::Result<Self> {
        let library = LibraryPaths::from_cli(&cli.library);
        let credentials = cli
            .creds
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| library.directory.join(DEFAULT_CREDENTIALS_NAME));

        if cli.folder_structure.trim().is_empty() {
            anyhow::bail!("--folder-structure must not be empty (use \"none\" for a flat layout)");
        }

        let scopes = if cli.all {
            vec![Scope::Full]
        } else if cli.dates.is_empty() {
            vec![Scope::Incremental]
        } else {
            cli.dates.into_iter().map(Scope::Explicit).collect()
        };

        Ok(Self {
            library,
            credentials,
            folder_structure: cli.folder_structure,
            scopes,
            retry: RetryConfig {
                max_retries: cli.max_retries,
                base_delay: Duration::from_secs(cli.retry_delay),
                max_delay: MAX_RETRY_DELAY,
            },
            threads_num: cli.threads_num,
            skip_download: cli.skip_download,
            no_progress_bar: cli.no_progress_bar,
        })
    }

    pub fn indexer_config(&self) -> IndexerConfig {
        IndexerConfig {
            retry: self.retry.clone(),
            concurrent_scopes: CONCURRENT_SCOPES,
        }
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            directory: self.library.directory.clone(),
            concurrent_downloads: self.threads_num as usize,
            retry: self.retry.clone(),
            no_progress_bar: self.no_progress_bar,
            page_size: PENDING_PAGE_SIZE,
        }
    }
}
