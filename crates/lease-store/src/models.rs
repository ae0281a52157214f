//! Allocation store models

use crds::{DhcpLease, DhcpLeaseSpec};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::StoreError;

/// Durable counterpart of a dnsmasq lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRecord {
    pub ip: IpAddr,
    pub mac: String,
    pub entity_ref: String,
    pub lease_expiry: String,
    pub vlan: String,
}

/// Request body for creating or updating an allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequest {
    pub ip: IpAddr,
    pub mac: String,
    pub entity_ref: String,
    pub lease_expiry: String,
    pub vlan: String,
}

impl AllocationRequest {
    /// Spec of the DhcpLease object persisting this request
    pub fn to_spec(&self) -> DhcpLeaseSpec {
        DhcpLeaseSpec {
            ip: self.ip.to_string(),
            mac: self.mac.clone(),
            entity_ref: self.entity_ref.clone(),
            lease_expiry: self.lease_expiry.clone(),
            vlan: self.vlan.clone(),
        }
    }
}

impl From<&AllocationRequest> for AllocationRecord {
    fn from(request: &AllocationRequest) -> Self {
        Self {
            ip: request.ip,
            mac: request.mac.clone(),
            entity_ref: request.entity_ref.clone(),
            lease_expiry: request.lease_expiry.clone(),
            vlan: request.vlan.clone(),
        }
    }
}

impl TryFrom<&DhcpLease> for AllocationRecord {
    type Error = StoreError;

    fn try_from(lease: &DhcpLease) -> Result<Self, Self::Error> {
        let ip = lease.spec.ip.parse::<IpAddr>().map_err(|e| {
            StoreError::InvalidRecord(format!(
                "DhcpLease {} has invalid ip '{}': {}",
                lease.metadata.name.as_deref().unwrap_or("<unknown>"),
                lease.spec.ip,
                e
            ))
        })?;

        Ok(Self {
            ip,
            mac: lease.spec.mac.clone(),
            entity_ref: lease.spec.entity_ref.clone(),
            lease_expiry: lease.spec.lease_expiry.clone(),
            vlan: lease.spec.vlan.clone(),
        })
    }
}
