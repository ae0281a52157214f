//! Kubernetes-backed allocation store
//!
//! Persists allocations as namespaced `DhcpLease` objects, one per IP address.
//! Object names are derived from the IP so every lookup is a direct GET.

use crate::error::StoreError;
use crate::models::{AllocationRecord, AllocationRequest};
use crate::store_trait::LeaseStoreTrait;
use crds::{DhcpLease, lease_name_for_ip};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use std::net::IpAddr;
use tracing::{debug, warn};

/// Field manager recorded on every write
const FIELD_MANAGER: &str = "dhcp-lease-controller";

/// Allocation store backed by `DhcpLease` custom resources
pub struct KubeLeaseStore {
    api: Api<DhcpLease>,
    namespace: String,
}

impl std::fmt::Debug for KubeLeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeLeaseStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeLeaseStore {
    /// Create a store writing `DhcpLease` objects into `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    /// Namespace the allocations live in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// Map API status codes onto the distinguished store outcomes
fn classify(error: kube::Error, ip: &IpAddr) -> StoreError {
    match &error {
        kube::Error::Api(response) if response.code == 404 => {
            StoreError::NotFound(format!("Allocation for {} not found", ip))
        }
        kube::Error::Api(response) if response.code == 409 => {
            StoreError::AlreadyExists(format!("Allocation for {} already exists", ip))
        }
        _ => StoreError::Kube(error),
    }
}

#[async_trait::async_trait]
impl LeaseStoreTrait for KubeLeaseStore {
    async fn create_allocation(&self, request: &AllocationRequest) -> Result<AllocationRecord, StoreError> {
        let name = lease_name_for_ip(&request.ip);
        debug!("Creating DhcpLease {}/{} for {}", self.namespace, name, request.ip);

        let lease = DhcpLease::new(&name, request.to_spec());
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let created = self.api
            .create(&pp, &lease)
            .await
            .map_err(|e| classify(e, &request.ip))?;

        AllocationRecord::try_from(&created)
    }

    async fn update_allocation(&self, request: &AllocationRequest) -> Result<AllocationRecord, StoreError> {
        let name = lease_name_for_ip(&request.ip);
        debug!("Updating DhcpLease {}/{} for {}", self.namespace, name, request.ip);

        let patch = serde_json::json!({ "spec": request.to_spec() });
        let pp = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let updated = self.api
            .patch(&name, &pp, &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, &request.ip))?;

        AllocationRecord::try_from(&updated)
    }

    async fn get_allocation(&self, ip: &IpAddr) -> Result<AllocationRecord, StoreError> {
        let name = lease_name_for_ip(ip);
        debug!("Fetching DhcpLease {}/{}", self.namespace, name);

        let lease = self.api.get(&name).await.map_err(|e| classify(e, ip))?;
        AllocationRecord::try_from(&lease)
    }

    async fn list_allocations(&self) -> Result<Vec<AllocationRecord>, StoreError> {
        debug!("Listing DhcpLeases in {}", self.namespace);

        let leases = self.api.list(&ListParams::default()).await?;
        let mut records = Vec::with_capacity(leases.items.len());
        for lease in &leases.items {
            match AllocationRecord::try_from(lease) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping DhcpLease: {}", e),
            }
        }

        Ok(records)
    }

    async fn delete_allocation(&self, ip: &IpAddr) -> Result<bool, StoreError> {
        let name = lease_name_for_ip(ip);
        debug!("Deleting DhcpLease {}/{}", self.namespace, name);

        match self.api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) => match classify(e, ip) {
                StoreError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}
