//! Lease reconciliation.
//!
//! Diffs the leases observed in the dnsmasq lease file against the lease
//! mirror and pushes the difference to the allocation store. The mirror only
//! moves forward for IPs whose store call succeeded, so a failed IP is retried
//! on the next lease file change.

use crate::config::{AddressRange, vlan_for};
use crate::error::ControllerError;
use crate::lease::{LeaseMirror, LeaseRecord};
use lease_store::{AllocationRequest, LeaseStoreTrait, StoreError};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Store action needed to bring one IP in line with the lease file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAction {
    /// Lease appeared
    Create(LeaseRecord),
    /// Lease changed in any field
    Update(LeaseRecord),
    /// Lease disappeared (expired or pruned)
    Delete(IpAddr),
}

impl LeaseAction {
    /// IP the action applies to
    pub fn ip(&self) -> IpAddr {
        match self {
            LeaseAction::Create(record) | LeaseAction::Update(record) => record.ip,
            LeaseAction::Delete(ip) => *ip,
        }
    }
}

/// Compute the actions turning `mirror` into `observed`.
///
/// Deletes come first, then creates and updates in IP order. Identical
/// records produce nothing. When `observed` lists an IP twice the later
/// record wins.
pub fn plan(mirror: &LeaseMirror, observed: &[LeaseRecord]) -> Vec<LeaseAction> {
    let observed: BTreeMap<IpAddr, &LeaseRecord> = observed.iter().map(|r| (r.ip, r)).collect();

    let mut actions: Vec<LeaseAction> = mirror
        .ips()
        .filter(|ip| !observed.contains_key(*ip))
        .map(|ip| LeaseAction::Delete(*ip))
        .collect();

    for (ip, record) in observed {
        match mirror.get(&ip) {
            None => actions.push(LeaseAction::Create(record.clone())),
            Some(known) if known != record => actions.push(LeaseAction::Update(record.clone())),
            Some(_) => {}
        }
    }

    actions
}

/// A store action that failed during a pass
#[derive(Debug)]
pub struct FailedAction {
    pub action: LeaseAction,
    pub error: ControllerError,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub applied: Vec<LeaseAction>,
    pub failed: Vec<FailedAction>,
}

impl ReconcileReport {
    /// Whether the pass touched the store at all
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.failed.is_empty()
    }
}

/// Pushes lease file changes to the allocation store.
pub struct LeaseReconciler {
    store: Arc<dyn LeaseStoreTrait>,
    ranges: Vec<AddressRange>,
    store_timeout: Duration,
}

impl std::fmt::Debug for LeaseReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseReconciler")
            .field("ranges", &self.ranges)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

impl LeaseReconciler {
    /// Creates a new reconciler.
    ///
    /// `ranges` only supply the VLAN tag sent with each allocation; leases
    /// outside every range are still synced.
    pub fn new(store: Arc<dyn LeaseStoreTrait>, ranges: Vec<AddressRange>, store_timeout: Duration) -> Self {
        Self {
            store,
            ranges,
            store_timeout,
        }
    }

    /// Reconcile `observed` against `mirror`, updating the store and the mirror.
    ///
    /// Every action is attempted even when earlier ones fail. The mirror entry
    /// of a failed IP is left as it was.
    pub async fn reconcile(&self, observed: &[LeaseRecord], mirror: &mut LeaseMirror) -> ReconcileReport {
        let actions = plan(mirror, observed);
        let mut report = ReconcileReport::default();

        if actions.is_empty() {
            debug!("Lease file matches mirror ({} leases), nothing to sync", mirror.len());
            return report;
        }

        debug!("Reconciling {} lease change(s)", actions.len());
        for action in actions {
            match self.apply(&action).await {
                Ok(()) => {
                    match &action {
                        LeaseAction::Create(record) | LeaseAction::Update(record) => mirror.insert(record.clone()),
                        LeaseAction::Delete(ip) => {
                            mirror.remove(ip);
                        }
                    }
                    report.applied.push(action);
                }
                Err(error) => {
                    warn!("Failed to sync lease for {}, will retry on next lease file change: {}", action.ip(), error);
                    report.failed.push(FailedAction { action, error });
                }
            }
        }

        info!(
            "Lease sync pass complete: {} applied, {} failed, {} leases known",
            report.applied.len(),
            report.failed.len(),
            mirror.len()
        );
        report
    }

    /// One store call per action, except that a create answered with
    /// AlreadyExists is retried as an update and an update answered with
    /// NotFound as a create. That fallback is the only place a single IP
    /// costs two calls.
    async fn apply(&self, action: &LeaseAction) -> Result<(), ControllerError> {
        match action {
            LeaseAction::Create(record) => {
                let request = self.request_for(record);
                info!("Creating allocation for {} ({}), {}", record.ip, record.mac, describe_expiry(record));
                match self.call(self.store.create_allocation(&request)).await {
                    Ok(_) => Ok(()),
                    Err(ControllerError::Store(StoreError::AlreadyExists(_))) => {
                        debug!("Allocation for {} already stored, updating instead", record.ip);
                        self.call(self.store.update_allocation(&request)).await.map(|_| ())
                    }
                    Err(e) => Err(e),
                }
            }
            LeaseAction::Update(record) => {
                let request = self.request_for(record);
                info!("Updating allocation for {} ({}), {}", record.ip, record.mac, describe_expiry(record));
                match self.call(self.store.update_allocation(&request)).await {
                    Ok(_) => Ok(()),
                    Err(ControllerError::Store(StoreError::NotFound(_))) => {
                        debug!("Allocation for {} missing from store, creating instead", record.ip);
                        self.call(self.store.create_allocation(&request)).await.map(|_| ())
                    }
                    Err(e) => Err(e),
                }
            }
            LeaseAction::Delete(ip) => {
                info!("Deleting allocation for {}", ip);
                if !self.call(self.store.delete_allocation(ip)).await? {
                    debug!("Allocation for {} was already absent", ip);
                }
                Ok(())
            }
        }
    }

    fn request_for(&self, record: &LeaseRecord) -> AllocationRequest {
        AllocationRequest {
            ip: record.ip,
            mac: record.mac.clone(),
            entity_ref: record.hostname.clone(),
            lease_expiry: record.timestamp.to_string(),
            vlan: vlan_for(&self.ranges, &record.ip).to_string(),
        }
    }

    async fn call<T>(&self, fut: impl Future<Output = Result<T, StoreError>>) -> Result<T, ControllerError> {
        with_timeout(self.store_timeout, fut).await
    }
}

fn describe_expiry(record: &LeaseRecord) -> String {
    record
        .expires_at()
        .map_or_else(|| "no expiry".to_string(), |at| format!("expires {}", at.to_rfc3339()))
}

/// Bound a store call; a timeout is reported as [`ControllerError::StoreTimeout`].
pub async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, ControllerError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(ControllerError::from),
        Err(_) => Err(ControllerError::StoreTimeout(format!("no answer within {:?}", limit))),
    }
}
