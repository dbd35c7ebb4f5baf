use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::error::DownloadError;
use crate::catalog::ByteStream;

const PART_SUFFIX: &str = ".part";

/// Deterministic hidden temp file next to the destination, derived from the
/// item id so concurrent downloads never share one.
pub(crate) fn temp_download_path(download_path: &Path, id: &str) -> PathBuf {
    let digest = Sha256::digest(id.as_bytes());
    let mut name = String::with_capacity(1 + 32 + PART_SUFFIX.len());
    name.push('.');
    for byte in &digest[..16] {
        name.push_str(&format!("{byte:02x}"));
    }
    name.push_str(PART_SUFFIX);
    download_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(name)
}

fn is_part_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(PART_SUFFIX)
}

/// Materialize `stream` at `download_path`.
///
/// Bytes go to a `.part` file that is flushed, fsynced and stamped with
/// `captured_at` before being renamed into place, so `download_path` either
/// does not exist or holds the complete content. The parent directory is
/// fsynced after the rename. The `.part` file is removed on failure.
pub async fn write_atomically(
    stream: ByteStream,
    download_path: &Path,
    id: &str,
    captured_at: DateTime<Utc>,
) -> Result<u64, DownloadError> {
    if let Some(parent) = download_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let part_path = temp_download_path(download_path, id);

    let result = write_part(stream, &part_path).await;
    let bytes_written = match result {
        Ok(n) => n,
        Err(e) => {
            let _ = fs::remove_file(&part_path).await;
            return Err(e);
        }
    };

    let mtime_path = part_path.clone();
    let ts = captured_at.timestamp();
    match tokio::task::spawn_blocking(move || set_file_mtime(&mtime_path, ts)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(path = %part_path.display(), error = %e, "Could not set mtime");
        }
        Err(e) => tracing::warn!(error = %e, "mtime task failed"),
    }

    if let Err(e) = fs::rename(&part_path, download_path).await {
        let _ = fs::remove_file(&part_path).await;
        return Err(e.into());
    }
    if let Some(parent) = download_path.parent() {
        sync_dir(parent).await?;
    }

    tracing::debug!(
        path = %download_path.display(),
        bytes = bytes_written,
        "Wrote file"
    );
    Ok(bytes_written)
}

async fn write_part(mut stream: ByteStream, part_path: &Path) -> Result<u64, DownloadError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(part_path)
        .await?;

    let mut bytes_written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        bytes_written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(bytes_written)
}

/// Fsync a directory so a rename inside it survives a power loss.
#[cfg(unix)]
pub(crate) async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
pub(crate) async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Set the modification and access times of a file to the given Unix
/// timestamp.
///
/// Dates before 1970 are handled by subtracting from the epoch.
pub(crate) fn set_file_mtime(path: &Path, timestamp: i64) -> std::io::Result<()> {
    let time = if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(timestamp.unsigned_abs()))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    };
    let times = FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)?;
    Ok(())
}

/// Delete `.part` files left behind by interrupted runs anywhere under
/// `root`. Returns the number removed.
pub async fn remove_orphaned_parts(root: &Path) -> std::io::Result<u64> {
    let mut removed = 0;
    let mut dirs = vec![root.to_path_buf()];

    while let Some(dir) = dirs.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                dirs.push(entry.path());
            } else if file_type.is_file() && is_part_file(&entry.file_name().to_string_lossy()) {
                fs::remove_file(entry.path()).await?;
                tracing::debug!(path = %entry.path().display(), "Removed orphaned part file");
                removed += 1;
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogError;
    use bytes::Bytes;
    use chrono::TimeZone;
    use futures_util::stream;

    fn byte_stream(chunks: Vec<Result<&'static str, CatalogError>>) -> ByteStream {
        Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|c| c.map(|s| Bytes::from_static(s.as_bytes())))
                .collect::<Vec<_>>(),
        ))
    }

    fn captured() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 2, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_temp_path_is_deterministic_and_hidden() {
        let dest = Path::new("/lib/2020/01/02/A.jpg");
        let a = temp_download_path(dest, "A");
        assert_eq!(a, temp_download_path(dest, "A"));
        assert_ne!(a, temp_download_path(dest, "B"));
        assert_eq!(a.parent(), dest.parent());
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(is_part_file(&name));
        assert_eq!(name.len(), 1 + 32 + PART_SUFFIX.len());
    }

    #[tokio::test]
    async fn test_write_atomically_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("2020/01/02/A.jpg");

        let n = write_atomically(
            byte_stream(vec![Ok("hello "), Ok("world")]),
            &dest,
            "A",
            captured(),
        )
        .await
        .unwrap();

        assert_eq!(n, 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert!(!temp_download_path(&dest, "A").exists());

        let mtime = std::fs::metadata(&dest).unwrap().modified().unwrap();
        assert_eq!(
            mtime,
            UNIX_EPOCH + Duration::from_secs(captured().timestamp() as u64)
        );
    }

    #[tokio::test]
    async fn test_interrupted_stream_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("A.jpg");

        let err = write_atomically(
            byte_stream(vec![
                Ok("partial"),
                Err(CatalogError::Transient("connection reset".into())),
            ]),
            &dest,
            "A",
            captured(),
        )
        .await
        .unwrap_err();

        assert!(err.is_retryable());
        assert!(!dest.exists());
        assert!(!temp_download_path(&dest, "A").exists());
    }

    #[tokio::test]
    async fn test_overwrites_existing_destination_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("A.jpg");
        std::fs::write(&dest, b"stale half-written").unwrap();

        write_atomically(byte_stream(vec![Ok("fresh")]), &dest, "A", captured())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_sync_dir() {
        let dir = tempfile::tempdir().unwrap();
        sync_dir(dir.path()).await.unwrap();
        sync_dir(Path::new("")).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sync_dir_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sync_dir(&dir.path().join("gone")).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_orphaned_parts() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("2020/01/02");
        std::fs::create_dir_all(&nested).unwrap();
        let part = temp_download_path(&nested.join("A.jpg"), "A");
        std::fs::write(&part, b"junk").unwrap();
        std::fs::write(nested.join("A.jpg"), b"keep").unwrap();
        std::fs::write(nested.join("notes.part"), b"not ours").unwrap();

        assert_eq!(remove_orphaned_parts(dir.path()).await.unwrap(), 1);
        assert!(!part.exists());
        assert!(nested.join("A.jpg").exists());
        assert!(nested.join("notes.part").exists());
    }

    #[tokio::test]
    async fn test_remove_orphaned_parts_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(remove_orphaned_parts(&missing).await.unwrap(), 0);
    }

    #[test]
    fn test_set_file_mtime_negative_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("old.jpg");
        std::fs::write(&p, b"x").unwrap();
        set_file_mtime(&p, -86400).unwrap();
    }

    #[test]
    fn test_set_file_mtime_nonexistent_file() {
        assert!(set_file_mtime(Path::new("/nonexistent/file.jpg"), 0).is_err());
    }
}
