//! Behavioural tests for the mock store
//!
//! The controller's unit tests rely on the mock honouring the same outcomes as
//! the Kubernetes-backed store, so those outcomes are pinned down here.

use lease_store::{AllocationRecord, AllocationRequest, LeaseStoreTrait, MockLeaseStore, StoreCall, StoreError};
use std::net::IpAddr;

fn request(ip: &str, mac: &str) -> AllocationRequest {
    AllocationRequest {
        ip: ip.parse().unwrap(),
        mac: mac.to_string(),
        entity_ref: "host1".to_string(),
        lease_expiry: "1700000000".to_string(),
        vlan: "10".to_string(),
    }
}

#[tokio::test]
async fn test_create_then_duplicate_create_conflicts() {
    let store = MockLeaseStore::new();
    let req = request("10.0.0.5", "aa:bb:cc:dd:ee:ff");

    let created = store.create_allocation(&req).await.unwrap();
    assert_eq!(created, AllocationRecord::from(&req));

    let err = store.create_allocation(&req).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_get_missing_is_not_found() {
    let store = MockLeaseStore::new();
    let ip: IpAddr = "10.0.0.9".parse().unwrap();

    let err = store.get_allocation(&ip).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_update_requires_existing_allocation() {
    let store = MockLeaseStore::new();
    let err = store.update_allocation(&request("10.0.0.5", "aa:bb:cc:dd:ee:ff")).await.unwrap_err();
    assert!(err.is_not_found());

    store.create_allocation(&request("10.0.0.5", "aa:bb:cc:dd:ee:ff")).await.unwrap();
    let updated = store.update_allocation(&request("10.0.0.5", "11:22:33:44:55:66")).await.unwrap();
    assert_eq!(updated.mac, "11:22:33:44:55:66");
    assert_eq!(store.allocations().len(), 1);
}

#[tokio::test]
async fn test_delete_reports_whether_anything_was_removed() {
    let store = MockLeaseStore::new();
    let ip: IpAddr = "10.0.0.5".parse().unwrap();
    store.create_allocation(&request("10.0.0.5", "aa:bb:cc:dd:ee:ff")).await.unwrap();

    assert!(store.delete_allocation(&ip).await.unwrap());
    assert!(!store.delete_allocation(&ip).await.unwrap());
}

#[tokio::test]
async fn test_injected_failures_and_call_log() {
    let store = MockLeaseStore::new();
    let ip: IpAddr = "10.0.0.5".parse().unwrap();
    store.fail_for(ip);

    assert!(store.create_allocation(&request("10.0.0.5", "aa:bb:cc:dd:ee:ff")).await.is_err());
    assert!(store.allocations().is_empty());

    store.clear_failures();
    store.create_allocation(&request("10.0.0.5", "aa:bb:cc:dd:ee:ff")).await.unwrap();

    let calls = store.take_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| matches!(c, StoreCall::Create(_))));
    assert!(store.calls().is_empty());
}
