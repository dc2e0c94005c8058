//! One-shot reconciliation of a local tree onto a remote SFTP tree, plus
//! the single-file operations the streaming path reuses.

use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use log::{debug, warn};
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;

use crate::appconfig::SyncPair;
use crate::error::{Error, Result};
use crate::events::EventBus;

/// Hard deadline for one remote file operation.
pub const FILE_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Backoff schedule for transient SFTP failures.
pub const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_secs(1),
    Duration::from_secs(4),
];

/// Totals reported in the reconcile summary event.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileStats {
    pub uploaded: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Maps a local path under the pair's local root onto the remote tree,
/// always using `/` separators.
pub fn remote_path_for(pair: &SyncPair, local: &Path) -> Result<String> {
    let root = Path::new(&pair.local_path);
    let relative = local.strip_prefix(root).map_err(|_| {
        Error::Validation(format!(
            "{} is outside the watched tree {}",
            local.display(),
            pair.local_path
        ))
    })?;
    Ok(join_remote(&pair.remote_path, relative))
}

fn join_remote(base: &str, relative: &Path) -> String {
    let mut out = base.trim_end_matches('/').to_string();
    for component in relative.components() {
        out.push('/');
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    if out.is_empty() { "/".to_string() } else { out }
}

/// Runs `op` with the bounded retry schedule; only transient failures are
/// retried, everything else returns immediately.
pub async fn with_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last = None;
    for (attempt, delay) in std::iter::once(Duration::ZERO)
        .chain(RETRY_DELAYS)
        .enumerate()
    {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                debug!("{what}: attempt {} failed: {err}", attempt + 1);
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| Error::Sftp(format!("{what}: retries exhausted"))))
}

async fn bounded<T, Fut>(what: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::time::timeout(FILE_OP_TIMEOUT, fut)
        .await
        .map_err(|_| Error::Sftp(format!("{what} timed out after {}s", FILE_OP_TIMEOUT.as_secs())))?
}

/// Creates every missing directory on the remote path (`mkdir -p`).
pub async fn ensure_remote_dir(sftp: &SftpSession, remote_dir: &str) -> Result<()> {
    let mut prefix = String::new();
    for part in remote_dir.split('/').filter(|p| !p.is_empty()) {
        prefix.push('/');
        prefix.push_str(part);
        if sftp.try_exists(&prefix).await? {
            continue;
        }
        if let Err(err) = sftp.create_dir(&prefix).await {
            // A concurrent mkdir of the same prefix is not a failure.
            if !sftp.try_exists(&prefix).await.unwrap_or(false) {
                return Err(err.into());
            }
        }
    }
    Ok(())
}

/// Uploads one local file, creating remote parent directories as needed.
pub async fn upload_file(sftp: &SftpSession, local: &Path, remote: &str) -> Result<()> {
    if let Some(parent) = remote.rsplit_once('/').map(|(parent, _)| parent) {
        if !parent.is_empty() {
            ensure_remote_dir(sftp, parent).await?;
        }
    }
    let contents = tokio::fs::read(local).await?;
    bounded(remote, async {
        let mut file = sftp.create(remote).await?;
        file.write_all(&contents).await.map_err(|err| Error::Sftp(err.to_string()))?;
        file.shutdown().await.map_err(|err| Error::Sftp(err.to_string()))?;
        Ok(())
    })
    .await
}

/// Removes a remote file or directory tree rooted at `remote`. Missing
/// targets are fine; delete is idempotent.
pub async fn delete_remote(sftp: &SftpSession, remote: &str) -> Result<()> {
    let metadata = match sftp.metadata(remote).await {
        Ok(metadata) => metadata,
        Err(_) => return Ok(()),
    };
    if metadata.is_dir() {
        delete_remote_dir(sftp, remote).await
    } else {
        bounded(remote, async {
            sftp.remove_file(remote).await.map_err(Error::from)
        })
        .await
    }
}

async fn delete_remote_dir(sftp: &SftpSession, remote: &str) -> Result<()> {
    // Depth-first: children before their directory.
    let entries: Vec<(String, bool)> = sftp
        .read_dir(remote)
        .await?
        .map(|entry| {
            let name = entry.file_name();
            (format!("{remote}/{name}"), entry.file_type().is_dir())
        })
        .collect();
    for (child, is_dir) in entries {
        if is_dir {
            Box::pin(delete_remote_dir(sftp, &child)).await?;
        } else {
            sftp.remove_file(&child).await?;
        }
    }
    sftp.remove_dir(remote).await.map_err(Error::from)
}

fn local_mtime_secs(metadata: &std::fs::Metadata) -> u32 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Decides whether a local file must be pushed: remote missing, smaller,
/// or older.
async fn needs_upload(sftp: &SftpSession, local: &Path, remote: &str) -> Result<bool> {
    let local_meta = std::fs::metadata(local)?;
    let remote_meta = match sftp.metadata(remote).await {
        Ok(metadata) => metadata,
        Err(_) => return Ok(true),
    };
    let remote_size = remote_meta.size.unwrap_or(0);
    if remote_size < local_meta.len() {
        return Ok(true);
    }
    let remote_mtime = remote_meta.mtime.unwrap_or(0);
    Ok(remote_mtime < local_mtime_secs(&local_meta))
}

fn walk_local(root: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                dirs.push(path.clone());
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    dirs.sort();
    Ok((dirs, files))
}

async fn walk_remote(sftp: &SftpSession, root: &str) -> Result<(Vec<String>, Vec<String>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut stack = vec![root.to_string()];
    while let Some(dir) = stack.pop() {
        let entries: Vec<(String, bool)> = sftp
            .read_dir(&dir)
            .await?
            .map(|entry| {
                let name = entry.file_name();
                (format!("{dir}/{name}"), entry.file_type().is_dir())
            })
            .collect();
        for (path, is_dir) in entries {
            if is_dir {
                dirs.push(path.clone());
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok((dirs, files))
}

/// Initial one-shot sync: pushes the local tree to the remote and, when
/// the pair says so, removes remote entries with no local counterpart.
/// Individual failures are reported and skipped; the walk never aborts.
pub async fn reconcile_directory(
    sftp: &SftpSession,
    pair: &SyncPair,
    events: &EventBus,
) -> Result<ReconcileStats> {
    let root = Path::new(&pair.local_path);
    let mut stats = ReconcileStats::default();

    ensure_remote_dir(sftp, pair.remote_path.trim_end_matches('/')).await?;
    let (local_dirs, local_files) = walk_local(root)?;

    for dir in &local_dirs {
        let remote_dir = remote_path_for(pair, dir)?;
        if let Err(err) = ensure_remote_dir(sftp, &remote_dir).await {
            warn!("mkdir {remote_dir} failed: {err}");
            events.error(format!("could not create {remote_dir}: {}", err.to_ui_string()));
            stats.failed += 1;
        }
    }

    for file in &local_files {
        let remote_file = remote_path_for(pair, file)?;
        let wanted = match needs_upload(sftp, file, &remote_file).await {
            Ok(wanted) => wanted,
            Err(err) => {
                events.error(format!("stat {remote_file}: {}", err.to_ui_string()));
                stats.failed += 1;
                continue;
            }
        };
        if !wanted {
            continue;
        }
        match with_retry(&remote_file, || upload_file(sftp, file, &remote_file)).await {
            Ok(()) => {
                stats.uploaded += 1;
                events.success(format!("synced {}", remote_file));
            }
            Err(err) => {
                stats.failed += 1;
                events.error(format!("upload {remote_file}: {}", err.to_ui_string()));
            }
        }
    }

    if pair.sync_deletes {
        let remote_root = pair.remote_path.trim_end_matches('/').to_string();
        let (remote_dirs, remote_files) = walk_remote(sftp, &remote_root).await?;
        let local_for = |remote: &str| -> PathBuf {
            let relative = remote
                .strip_prefix(&remote_root)
                .unwrap_or(remote)
                .trim_start_matches('/');
            root.join(relative)
        };
        for file in &remote_files {
            if !local_for(file).exists() {
                match delete_remote(sftp, file).await {
                    Ok(()) => {
                        stats.deleted += 1;
                        events.success(format!("removed {}", file));
                    }
                    Err(err) => {
                        stats.failed += 1;
                        events.error(format!("delete {file}: {}", err.to_ui_string()));
                    }
                }
            }
        }
        // Deepest directories first so they are empty by the time we get
        // to them.
        let mut dirs = remote_dirs;
        dirs.sort_by_key(|d| std::cmp::Reverse(d.len()));
        for dir in &dirs {
            if !local_for(dir).exists() {
                match delete_remote(sftp, dir).await {
                    Ok(()) => stats.deleted += 1,
                    Err(err) => {
                        stats.failed += 1;
                        events.error(format!("delete {dir}: {}", err.to_ui_string()));
                    }
                }
            }
        }
    }

    events.info(format!(
        "sync complete for {}: {} uploaded, {} deleted, {} failed",
        pair.local_path, stats.uploaded, stats.deleted, stats.failed
    ));
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(local: &str, remote: &str) -> SyncPair {
        SyncPair {
            id: "p1".into(),
            config_id: "c1".into(),
            local_path: local.into(),
            remote_path: remote.into(),
            sync_deletes: false,
            extra: Default::default(),
        }
    }

    #[test]
    fn remote_paths_use_forward_slashes() {
        let pair = pair("/home/u/project", "/srv/app");
        let mapped = remote_path_for(&pair, Path::new("/home/u/project/src/main.rs")).unwrap();
        assert_eq!(mapped, "/srv/app/src/main.rs");
    }

    #[test]
    fn path_outside_tree_is_rejected() {
        let pair = pair("/home/u/project", "/srv/app");
        assert!(remote_path_for(&pair, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn trailing_slash_on_remote_root_is_tolerated() {
        let pair = pair("/home/u/project", "/srv/app/");
        let mapped = remote_path_for(&pair, Path::new("/home/u/project/a.txt")).unwrap();
        assert_eq!(mapped, "/srv/app/a.txt");
    }

    #[test]
    fn walk_local_finds_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"aaa").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"bb").unwrap();

        let (dirs, files) = walk_local(dir.path()).unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(files.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_schedule() {
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let counter = attempts.clone();
        let result = with_retry("op", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err::<(), _>(Error::Sftp("still down".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(Error::Sftp(_))));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_stops_on_permanent_error() {
        let mut calls = 0;
        let result = with_retry("op", || {
            calls += 1;
            async move { Err::<(), _>(Error::PortInUse(1)) }
        })
        .await;
        assert!(matches!(result, Err(Error::PortInUse(1))));
        assert_eq!(calls, 1);
    }
}
