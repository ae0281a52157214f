//! Store trait for mocking
//!
//! The controller only talks to the store through this trait so reconciliation
//! can be unit tested against [`crate::mock::MockLeaseStore`].

use crate::error::StoreError;
use crate::models::{AllocationRecord, AllocationRequest};
use std::net::IpAddr;

/// Allocation store operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
/// Each method is a single round trip to the store.
#[async_trait::async_trait]
pub trait LeaseStoreTrait: Send + Sync {
    /// Create the allocation for `request.ip`.
    ///
    /// Fails with [`StoreError::AlreadyExists`] when one is already stored.
    async fn create_allocation(&self, request: &AllocationRequest) -> Result<AllocationRecord, StoreError>;

    /// Overwrite the allocation for `request.ip`.
    ///
    /// Fails with [`StoreError::NotFound`] when none is stored.
    async fn update_allocation(&self, request: &AllocationRequest) -> Result<AllocationRecord, StoreError>;

    /// Fetch the allocation for `ip`; absence is [`StoreError::NotFound`].
    async fn get_allocation(&self, ip: &IpAddr) -> Result<AllocationRecord, StoreError>;

    /// Every stored allocation.
    async fn list_allocations(&self) -> Result<Vec<AllocationRecord>, StoreError>;

    /// Delete the allocation for `ip`. Returns `false` when nothing was stored.
    async fn delete_allocation(&self, ip: &IpAddr) -> Result<bool, StoreError>;
}
