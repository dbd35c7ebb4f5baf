//! Exclusive per-library lock so two processes never sync the same directory.

use std::path::{Path, PathBuf};

use anyhow::Context;
use fs4::fs_std::FileExt;

const LOCK_FILE_NAME: &str = ".photosync.lock";

/// Held for the lifetime of a command; the OS releases the lock when the
/// file is dropped, including on crash.
#[derive(Debug)]
pub struct LibraryLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl LibraryLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Take the lock for `directory`, creating the directory if needed. Fails
/// immediately if another process holds it.
pub async fn acquire(directory: &Path) -> anyhow::Result<LibraryLock> {
    tokio::fs::create_dir_all(directory)
        .await
        .with_context(|| format!("Failed to create directory: {}", directory.display()))?;

    let lock_path = directory.join(LOCK_FILE_NAME);
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::create(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "Another photosync-rs instance is using this library (lock: {})",
                lock_path.display()
            )
        })?;
        Ok::<_, anyhow::Error>(LibraryLock {
            _file: file,
            path: lock_path,
        })
    })
    .await?
}
