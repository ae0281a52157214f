//! Mock allocation store for unit testing
//!
//! Stores allocations in memory, records every call in order, and can be told
//! to fail calls for specific IPs to exercise partial-failure handling.

use crate::error::StoreError;
use crate::models::{AllocationRecord, AllocationRequest};
use crate::store_trait::LeaseStoreTrait;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A store call as observed by [`MockLeaseStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Create(AllocationRequest),
    Update(AllocationRequest),
    Get(IpAddr),
    List,
    Delete(IpAddr),
}

/// Mock allocation store for testing
///
/// Clones share state, so a test can keep one handle while the code under
/// test owns another.
#[derive(Debug, Clone, Default)]
pub struct MockLeaseStore {
    allocations: Arc<Mutex<BTreeMap<IpAddr, AllocationRecord>>>,
    calls: Arc<Mutex<Vec<StoreCall>>>,
    failing_ips: Arc<Mutex<HashSet<IpAddr>>>,
    fail_list: Arc<Mutex<bool>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockLeaseStore {
    /// Create an empty mock store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an allocation (for test setup, not recorded as a call)
    pub fn add_allocation(&self, record: AllocationRecord) {
        lock(&self.allocations).insert(record.ip, record);
    }

    /// Current contents, ordered by IP
    pub fn allocations(&self) -> Vec<AllocationRecord> {
        lock(&self.allocations).values().cloned().collect()
    }

    /// Make every call touching `ip` fail with [`StoreError::Api`]
    pub fn fail_for(&self, ip: IpAddr) {
        lock(&self.failing_ips).insert(ip);
    }

    /// Make `list_allocations` fail until [`MockLeaseStore::clear_failures`]
    pub fn fail_list(&self) {
        *lock(&self.fail_list) = true;
    }

    /// Stop injecting failures
    pub fn clear_failures(&self) {
        lock(&self.failing_ips).clear();
        *lock(&self.fail_list) = false;
    }

    /// Calls recorded so far
    pub fn calls(&self) -> Vec<StoreCall> {
        lock(&self.calls).clone()
    }

    /// Calls recorded so far, clearing the log
    pub fn take_calls(&self) -> Vec<StoreCall> {
        std::mem::take(&mut *lock(&self.calls))
    }

    fn record(&self, call: StoreCall) {
        lock(&self.calls).push(call);
    }

    fn check_failure(&self, ip: &IpAddr) -> Result<(), StoreError> {
        if lock(&self.failing_ips).contains(ip) {
            return Err(StoreError::Api(format!("injected failure for {}", ip)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl LeaseStoreTrait for MockLeaseStore {
    async fn create_allocation(&self, request: &AllocationRequest) -> Result<AllocationRecord, StoreError> {
        self.record(StoreCall::Create(request.clone()));
        self.check_failure(&request.ip)?;

        let mut allocations = lock(&self.allocations);
        if allocations.contains_key(&request.ip) {
            return Err(StoreError::AlreadyExists(format!("Allocation for {} already exists", request.ip)));
        }
        let record = AllocationRecord::from(request);
        allocations.insert(request.ip, record.clone());
        Ok(record)
    }

    async fn update_allocation(&self, request: &AllocationRequest) -> Result<AllocationRecord, StoreError> {
        self.record(StoreCall::Update(request.clone()));
        self.check_failure(&request.ip)?;

        let mut allocations = lock(&self.allocations);
        match allocations.get_mut(&request.ip) {
            Some(existing) => {
                *existing = AllocationRecord::from(request);
                Ok(existing.clone())
            }
            None => Err(StoreError::NotFound(format!("Allocation for {} not found", request.ip))),
        }
    }

    async fn get_allocation(&self, ip: &IpAddr) -> Result<AllocationRecord, StoreError> {
        self.record(StoreCall::Get(*ip));
        self.check_failure(ip)?;

        lock(&self.allocations)
            .get(ip)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Allocation for {} not found", ip)))
    }

    async fn list_allocations(&self) -> Result<Vec<AllocationRecord>, StoreError> {
        self.record(StoreCall::List);
        if *lock(&self.fail_list) {
            return Err(StoreError::Api("injected list failure".to_string()));
        }
        Ok(self.allocations())
    }

    async fn delete_allocation(&self, ip: &IpAddr) -> Result<bool, StoreError> {
        self.record(StoreCall::Delete(*ip));
        self.check_failure(ip)?;

        Ok(lock(&self.allocations).remove(ip).is_some())
    }
}
