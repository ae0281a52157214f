//! Lease file backup/restore.
//!
//! The store is the durable record of every lease. When the dnsmasq lease file
//! is absent (first start, restart on a fresh volume, or deletion while running)
//! it is rebuilt from the store so dnsmasq does not hand out addresses that are
//! still in use.

use crate::backoff::FibonacciBackoff;
use crate::config::AddressRange;
use crate::error::ControllerError;
use crate::lease::{or_wildcard, write_lease_file};
use crate::reconciler::with_timeout;
use lease_store::{AllocationRecord, LeaseStoreTrait};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Lease file line for a stored allocation.
///
/// The entity reference takes the hostname column and the client id is a
/// wildcard, since the store does not keep it. An expiry that is not an epoch
/// timestamp is written as `0`, which dnsmasq reads as a lease that never expires.
pub fn render_lease_line(record: &AllocationRecord) -> String {
    format!(
        "{} {} {} {} *",
        expiry_epoch(record).unwrap_or(0),
        record.mac,
        record.ip,
        or_wildcard(&record.entity_ref),
    )
}

fn expiry_epoch(record: &AllocationRecord) -> Option<u64> {
    record.lease_expiry.trim().parse().ok()
}

/// Whether `record` belongs to one of `ranges`: its IP is inside a range
/// carrying the same VLAN tag.
pub fn is_restorable(record: &AllocationRecord, ranges: &[AddressRange]) -> bool {
    ranges
        .iter()
        .any(|range| range.contains(&record.ip) && range.vlan_tag() == record.vlan)
}

/// Rebuild the lease file at `lease_path` from the store.
///
/// Returns the number of leases written. Store failures come back as
/// [`ControllerError::Store`] or [`ControllerError::StoreTimeout`]; a failure
/// to write the file is [`ControllerError::Restore`].
pub async fn restore(
    lease_path: &Path,
    ranges: &[AddressRange],
    store: &dyn LeaseStoreTrait,
    store_timeout: Duration,
) -> Result<usize, ControllerError> {
    let records = with_timeout(store_timeout, store.list_allocations()).await?;

    let lines: Vec<String> = records
        .iter()
        .filter(|record| is_restorable(record, ranges))
        .inspect(|record| {
            if expiry_epoch(record).is_none() {
                warn!("Allocation for {} has no usable expiry ('{}'), restoring it without one", record.ip, record.lease_expiry);
            }
        })
        .map(render_lease_line)
        .collect();
    let skipped = records.len() - lines.len();

    let mut contents = lines.join("\n");
    if !contents.is_empty() {
        contents.push('\n');
    }
    write_lease_file(lease_path, contents.as_bytes()).await.map_err(|e| {
        ControllerError::Restore(format!("cannot write {}: {}", lease_path.display(), e))
    })?;

    info!(
        "Restored {} lease(s) into {} ({} stored allocation(s) outside configured ranges)",
        lines.len(),
        lease_path.display(),
        skipped
    );
    Ok(lines.len())
}

/// [`restore`], retrying store failures with `backoff` until it succeeds.
///
/// File system failures are returned immediately.
pub async fn restore_with_retry(
    lease_path: &Path,
    ranges: &[AddressRange],
    store: &dyn LeaseStoreTrait,
    store_timeout: Duration,
    backoff: &mut FibonacciBackoff,
) -> Result<usize, ControllerError> {
    loop {
        match restore(lease_path, ranges, store, store_timeout).await {
            Ok(count) => {
                backoff.reset();
                return Ok(count);
            }
            Err(e @ (ControllerError::Store(_) | ControllerError::StoreTimeout(_))) => {
                let delay = backoff.next_backoff();
                warn!("Cannot list allocations for restore, retrying in {:?}: {}", delay, e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
