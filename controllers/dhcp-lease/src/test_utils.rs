//! Test utilities for unit testing the lease pipeline
//!
//! This module provides helpers for creating leases, ranges and stores.

#[cfg(test)]
use crate::config::AddressRange;
#[cfg(test)]
use crate::lease::LeaseRecord;
#[cfg(test)]
use lease_store::{AllocationRecord, LeaseStoreTrait, MockLeaseStore};
#[cfg(test)]
use std::sync::Arc;

/// Helper to create a lease record
#[cfg(test)]
pub fn create_test_lease(ip: &str, mac: &str, hostname: &str, timestamp: u64) -> LeaseRecord {
    LeaseRecord {
        timestamp,
        mac: mac.to_string(),
        ip: ip.parse().unwrap(),
        hostname: hostname.to_string(),
        client_id: "*".to_string(),
    }
}

/// Helper to create an address range
#[cfg(test)]
pub fn create_test_range(start: &str, end: &str, vlan: Option<&str>) -> AddressRange {
    AddressRange {
        start: start.parse().unwrap(),
        end: end.parse().unwrap(),
        vlan: vlan.map(str::to_string),
    }
}

/// Helper to create a stored allocation
#[cfg(test)]
pub fn create_test_allocation(ip: &str, mac: &str, entity_ref: &str, vlan: &str) -> AllocationRecord {
    AllocationRecord {
        ip: ip.parse().unwrap(),
        mac: mac.to_string(),
        entity_ref: entity_ref.to_string(),
        lease_expiry: "1700000000".to_string(),
        vlan: vlan.to_string(),
    }
}

/// Mock store plus a trait-object handle sharing its state
#[cfg(test)]
pub fn create_test_store() -> (MockLeaseStore, Arc<dyn LeaseStoreTrait>) {
    let mock = MockLeaseStore::new();
    let handle: Arc<dyn LeaseStoreTrait> = Arc::new(mock.clone());
    (mock, handle)
}
