//! Lease file watcher.
//!
//! Turns OS file notifications for the dnsmasq lease file into a sequence of
//! confirmed content changes. Notifications whose content checksum matches the
//! last delivered content are dropped, and a short settle delay lets a writer
//! finish flushing before the file is read.

use crate::lease::read_lease_file;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pending wakes beyond this are redundant and dropped
const WAKE_QUEUE_DEPTH: usize = 16;

/// Errors ending a lease file watch
#[derive(Debug, Error)]
pub enum WatchError {
    /// The lease file no longer exists; it must be restored and the watch reattached
    #[error("lease file {0} is missing")]
    FileMissing(PathBuf),

    /// The notification source went away
    #[error("file notification channel closed")]
    Closed,

    /// The OS notification backend failed
    #[error("file notification error: {0}")]
    Notify(#[from] notify::Error),

    /// The lease file could not be read
    #[error("cannot read lease file: {0}")]
    Io(#[from] std::io::Error),
}

type Checksum = [u8; 32];

fn checksum(bytes: &[u8]) -> Checksum {
    Sha256::digest(bytes).into()
}

/// Watches one lease file for content changes.
pub struct LeaseFileWatcher {
    path: PathBuf,
    wakes: mpsc::Receiver<()>,
    settle_delay: Duration,
    last_checksum: Option<Checksum>,
    baseline_pending: bool,
    // Dropping the OS watcher stops notifications
    _watcher: Option<RecommendedWatcher>,
}

impl std::fmt::Debug for LeaseFileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseFileWatcher")
            .field("path", &self.path)
            .field("settle_delay", &self.settle_delay)
            .field("baseline_pending", &self.baseline_pending)
            .finish_non_exhaustive()
    }
}

impl LeaseFileWatcher {
    /// Attach an OS watcher to `path`.
    ///
    /// The parent directory is watched so that replacing the file (rename over
    /// it) and deleting it are both seen.
    pub fn watch(path: &Path, settle_delay: Duration) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::channel(WAKE_QUEUE_DEPTH);
        let file_name = path.file_name().map(ToOwned::to_owned);

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| match result {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                let touches_lease_file = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(ToOwned::to_owned) == file_name);
                if touches_lease_file {
                    // A full queue already holds a wake, which is all we need
                    let _ = tx.try_send(());
                }
            }
            Err(e) => warn!("Lease file notification error: {}", e),
        })?;

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        debug!("Watching {} for lease file changes", path.display());

        let mut lease_watcher = Self::from_wakes(path, rx, settle_delay);
        lease_watcher._watcher = Some(watcher);
        Ok(lease_watcher)
    }

    /// Build a watcher driven by an arbitrary wake channel.
    pub fn from_wakes(path: &Path, wakes: mpsc::Receiver<()>, settle_delay: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            wakes,
            settle_delay,
            last_checksum: None,
            baseline_pending: true,
            _watcher: None,
        }
    }

    /// Wait for the next confirmed change and return the new file contents.
    ///
    /// The first call returns the current contents immediately as the baseline.
    pub async fn next_change(&mut self) -> Result<Vec<u8>, WatchError> {
        loop {
            if self.baseline_pending {
                self.baseline_pending = false;
            } else if self.wakes.recv().await.is_none() {
                return Err(WatchError::Closed);
            }

            let Some(contents) = read_lease_file(&self.path).await? else {
                return Err(WatchError::FileMissing(self.path.clone()));
            };
            if Some(checksum(&contents)) == self.last_checksum {
                debug!("Lease file notification without content change, ignoring");
                continue;
            }

            tokio::time::sleep(self.settle_delay).await;

            let Some(contents) = read_lease_file(&self.path).await? else {
                return Err(WatchError::FileMissing(self.path.clone()));
            };
            self.last_checksum = Some(checksum(&contents));
            return Ok(contents);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SETTLE: Duration = Duration::from_millis(10);
    const QUIET: Duration = Duration::from_millis(200);

    fn setup(initial: &str) -> (TempDir, PathBuf, mpsc::Sender<()>, LeaseFileWatcher) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dnsmasq.leases");
        std::fs::write(&path, initial).unwrap();
        let (tx, rx) = mpsc::channel(WAKE_QUEUE_DEPTH);
        let watcher = LeaseFileWatcher::from_wakes(&path, rx, SETTLE);
        (dir, path, tx, watcher)
    }

    #[tokio::test]
    async fn test_first_change_is_baseline() {
        let (_dir, _path, _tx, mut watcher) = setup("1 aa 10.0.0.1 h *\n");
        let contents = watcher.next_change().await.unwrap();
        assert_eq!(contents, b"1 aa 10.0.0.1 h *\n");
    }

    #[tokio::test]
    async fn test_unchanged_checksum_is_debounced() {
        let (_dir, path, tx, mut watcher) = setup("1 aa 10.0.0.1 h *\n");
        watcher.next_change().await.unwrap();

        std::fs::write(&path, "2 aa 10.0.0.1 h *\n").unwrap();
        tx.send(()).await.unwrap();
        tx.send(()).await.unwrap();

        // Two notifications for one write yield exactly one change
        assert_eq!(watcher.next_change().await.unwrap(), b"2 aa 10.0.0.1 h *\n");
        assert!(tokio::time::timeout(QUIET, watcher.next_change()).await.is_err());
    }

    #[tokio::test]
    async fn test_rewrite_with_same_content_is_ignored() {
        let (_dir, path, tx, mut watcher) = setup("1 aa 10.0.0.1 h *\n");
        watcher.next_change().await.unwrap();

        std::fs::write(&path, "1 aa 10.0.0.1 h *\n").unwrap();
        tx.send(()).await.unwrap();
        assert!(tokio::time::timeout(QUIET, watcher.next_change()).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file_ends_watch() {
        let (_dir, path, tx, mut watcher) = setup("");
        watcher.next_change().await.unwrap();

        std::fs::remove_file(&path).unwrap();
        tx.send(()).await.unwrap();
        assert!(matches!(watcher.next_change().await, Err(WatchError::FileMissing(_))));
    }

    #[tokio::test]
    async fn test_closed_wake_channel_ends_watch() {
        let (_dir, _path, tx, mut watcher) = setup("");
        watcher.next_change().await.unwrap();

        drop(tx);
        assert!(matches!(watcher.next_change().await, Err(WatchError::Closed)));
    }

    #[tokio::test]
    async fn test_os_watcher_reports_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dnsmasq.leases");
        std::fs::write(&path, "").unwrap();

        let mut watcher = LeaseFileWatcher::watch(&path, SETTLE).unwrap();
        assert!(watcher.next_change().await.unwrap().is_empty());

        std::fs::write(&path, "1 aa 10.0.0.1 h *\n").unwrap();
        let contents = tokio::time::timeout(Duration::from_secs(5), watcher.next_change())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(contents, b"1 aa 10.0.0.1 h *\n");
    }
}
