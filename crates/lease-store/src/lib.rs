//! DHCP Allocation Store
//!
//! Durable record store for DHCP leases. Every leased IP address is persisted
//! as an [`AllocationRecord`] so the dnsmasq lease file can be rebuilt after a
//! restart, crash or volume loss.
//!
//! # Example
//!
//! ```no_run
//! use lease_store::{AllocationRequest, KubeLeaseStore, LeaseStoreTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let store = KubeLeaseStore::new(client, "default");
//!
//! let request = AllocationRequest {
//!     ip: "10.0.0.5".parse()?,
//!     mac: "aa:bb:cc:dd:ee:ff".to_string(),
//!     entity_ref: "host1".to_string(),
//!     lease_expiry: "1700000000".to_string(),
//!     vlan: "10".to_string(),
//! };
//! store.create_allocation(&request).await?;
//!
//! for record in store.list_allocations().await? {
//!     println!("{} -> {}", record.ip, record.mac);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod store_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubeLeaseStore;
pub use error::StoreError;
pub use models::*;
pub use store_trait::LeaseStoreTrait;
#[cfg(feature = "test-util")]
pub use mock::{MockLeaseStore, StoreCall};
