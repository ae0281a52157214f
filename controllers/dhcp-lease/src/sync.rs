//! Lease sync pipeline.
//!
//! Watch the lease file, parse each confirmed change and reconcile it into
//! the store. This task owns the lease mirror. A missing lease file is
//! rebuilt from the store and the watch reattached.

use crate::backoff::FibonacciBackoff;
use crate::config::AddressRange;
use crate::error::ControllerError;
use crate::lease::{LeaseMirror, parse_leases};
use crate::reconciler::{LeaseReconciler, ReconcileReport};
use crate::restore::restore_with_retry;
use crate::watcher::{LeaseFileWatcher, WatchError};
use lease_store::LeaseStoreTrait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lease file to store synchronization.
pub struct LeaseSync {
    lease_file: PathBuf,
    settle_delay: Duration,
    ranges: Vec<AddressRange>,
    store: Arc<dyn LeaseStoreTrait>,
    store_timeout: Duration,
    reconciler: LeaseReconciler,
    mirror: LeaseMirror,
}

impl std::fmt::Debug for LeaseSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseSync")
            .field("lease_file", &self.lease_file)
            .field("settle_delay", &self.settle_delay)
            .field("mirror", &self.mirror.len())
            .finish_non_exhaustive()
    }
}

impl LeaseSync {
    /// Creates a sync task with an empty mirror.
    pub fn new(
        lease_file: PathBuf,
        settle_delay: Duration,
        ranges: Vec<AddressRange>,
        store: Arc<dyn LeaseStoreTrait>,
        store_timeout: Duration,
    ) -> Self {
        let reconciler = LeaseReconciler::new(Arc::clone(&store), ranges.clone(), store_timeout);
        Self {
            lease_file,
            settle_delay,
            ranges,
            store,
            store_timeout,
            reconciler,
            mirror: LeaseMirror::new(),
        }
    }

    /// Known leases
    #[cfg(test)]
    pub fn mirror(&self) -> &LeaseMirror {
        &self.mirror
    }

    /// Run until the watch fails for a reason other than a missing file.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        let mut backoff = FibonacciBackoff::default();

        loop {
            if !tokio::fs::try_exists(&self.lease_file).await? {
                warn!("Lease file {} is missing, restoring from store", self.lease_file.display());
                restore_with_retry(&self.lease_file, &self.ranges, self.store.as_ref(), self.store_timeout, &mut backoff)
                    .await?;
            }

            let mut watcher = LeaseFileWatcher::watch(&self.lease_file, self.settle_delay)?;
            info!("Syncing leases from {}", self.lease_file.display());

            loop {
                match watcher.next_change().await {
                    Ok(contents) => {
                        if self.sync_contents(&contents).await.is_noop() {
                            debug!("Lease file change needed no store updates");
                        }
                    }
                    Err(WatchError::FileMissing(path)) => {
                        warn!("Lease file {} disappeared, reattaching after restore", path.display());
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    /// Parse one lease file snapshot and reconcile it.
    ///
    /// Rejected lines are logged and left out; the rest of the file still syncs.
    pub async fn sync_contents(&mut self, contents: &[u8]) -> ReconcileReport {
        let parsed = parse_leases(contents);

        for rejected in &parsed.rejected {
            warn!(
                "Ignoring lease file line {} ({}): {}",
                rejected.line_number, rejected.reason, rejected.content
            );
        }

        self.reconciler.reconcile(&parsed.records, &mut self.mirror).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::prune_lines;
    use crate::test_utils::*;
    use lease_store::StoreCall;
    use std::net::IpAddr;
    use tempfile::TempDir;

    const HOST1: &str = "1700000000 aa:bb:cc:dd:ee:ff 10.0.0.5 host1 *\n";
    const HOST2: &str = "1700000000 aa:bb:cc:dd:ee:00 10.0.0.6 host2 *\n";

    fn lease_sync(path: PathBuf, store: Arc<dyn LeaseStoreTrait>) -> LeaseSync {
        LeaseSync::new(
            path,
            Duration::from_millis(10),
            vec![create_test_range("10.0.0.1", "10.0.0.50", Some("10"))],
            store,
            Duration::from_secs(1),
        )
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_pruned_entity_is_deleted_from_store() {
        let (mock, store) = create_test_store();
        let mut sync = lease_sync(PathBuf::from("unused"), store);

        let contents = format!("{}{}", HOST1, HOST2);
        let report = sync.sync_contents(contents.as_bytes()).await;
        assert_eq!(report.applied.len(), 2);

        let (pruned, removed) = prune_lines(contents.as_bytes(), &["host1"]);
        assert_eq!(removed, 1);
        mock.take_calls();

        let report = sync.sync_contents(&pruned).await;
        assert!(report.failed.is_empty());
        let deleted: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(mock.take_calls(), vec![StoreCall::Delete(deleted)]);
        assert!(sync.mirror().get(&deleted).is_none());
        assert_eq!(sync.mirror().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_lines_do_not_block_sync() {
        let (mock, store) = create_test_store();
        let mut sync = lease_sync(PathBuf::from("unused"), store);

        let contents = format!("not a lease\n{}", HOST1);
        let report = sync.sync_contents(contents.as_bytes()).await;
        assert_eq!(report.applied.len(), 1);
        assert_eq!(mock.allocations().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_line_does_not_block_neighbours() {
        let (mock, store) = create_test_store();
        let mut sync = lease_sync(PathBuf::from("unused"), store);

        let contents = b"1700000000 aa:bb:cc:dd:ee:ff 10.0.0.5 host1 *\n1700000000 aa:bb:cc:dd:ee:01 10.0.0.6 h\xe9st *\n1700000000 aa:bb:cc:dd:ee:02 10.0.0.7 host3 *\n";
        let report = sync.sync_contents(contents).await;

        assert_eq!(report.applied.len(), 2);
        assert!(report.failed.is_empty());
        let stored: Vec<String> = mock.allocations().iter().map(|a| a.ip.to_string()).collect();
        assert!(stored.contains(&"10.0.0.5".to_string()));
        assert!(stored.contains(&"10.0.0.7".to_string()));
        assert!(!stored.contains(&"10.0.0.6".to_string()));
    }

    #[tokio::test]
    async fn test_run_syncs_changes_and_restores_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dnsmasq.leases");
        std::fs::write(&path, HOST1).unwrap();

        let (mock, store) = create_test_store();
        let task = tokio::spawn(lease_sync(path.clone(), store).run());

        wait_for(|| mock.allocations().len() == 1).await;
        assert_eq!(mock.allocations()[0].vlan, "10");

        std::fs::remove_file(&path).unwrap();
        wait_for(|| std::fs::read_to_string(&path).is_ok_and(|c| c.contains("10.0.0.5"))).await;
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "1700000000 aa:bb:cc:dd:ee:ff 10.0.0.5 host1 *\n"
        );

        task.abort();
    }
}
