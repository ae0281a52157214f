//! DhcpLease CRD
//!
//! Durable record of a DHCP lease handed out by dnsmasq. One object exists per
//! leased IP address; its presence proves the address is in use even when the
//! dnsmasq lease file has been lost.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "dhcp.microscaler.io",
    version = "v1alpha1",
    kind = "DhcpLease",
    namespaced,
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".spec.ip"}"#,
    printcolumn = r#"{"name":"MAC","type":"string","jsonPath":".spec.mac"}"#,
    printcolumn = r#"{"name":"Entity","type":"string","jsonPath":".spec.entityRef"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DhcpLeaseSpec {
    /// Leased IP address
    pub ip: String,

    /// Client hardware address
    pub mac: String,

    /// Owning entity (VM or pod hostname as reported to dnsmasq)
    #[serde(default)]
    pub entity_ref: String,

    /// Lease expiry as a Unix epoch timestamp, verbatim from the lease file
    #[serde(default)]
    pub lease_expiry: String,

    /// VLAN tag of the dhcp-range the IP belongs to (empty when untagged)
    #[serde(default)]
    pub vlan: String,
}

/// Object name used for the DhcpLease of `ip`.
///
/// Kubernetes names must be DNS labels, so `10.0.0.5` becomes `10-0-0-5`.
/// IPv6 addresses are written as all eight hex segments joined by dashes
/// (`::1` becomes `0-0-0-0-0-0-0-1`), so a name never starts or ends with `-`.
pub fn lease_name_for_ip(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string().replace('.', "-"),
        IpAddr::V6(v6) => v6
            .segments()
            .iter()
            .map(|segment| format!("{:x}", segment))
            .collect::<Vec<_>>()
            .join("-"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_name_for_ipv4() {
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(lease_name_for_ip(&ip), "10-0-0-5");
    }

    #[test]
    fn test_lease_name_for_ipv6() {
        let ip: IpAddr = "fd00::5".parse().unwrap();
        assert_eq!(lease_name_for_ip(&ip), "fd00-0-0-0-0-0-0-5");
    }

    #[test]
    fn test_lease_name_for_ipv6_edges_is_valid_object_name() {
        for (ip, expected) in [("::1", "0-0-0-0-0-0-0-1"), ("fd00::", "fd00-0-0-0-0-0-0-0"), ("::", "0-0-0-0-0-0-0-0")] {
            let name = lease_name_for_ip(&ip.parse().unwrap());
            assert_eq!(name, expected);
            assert!(!name.starts_with('-') && !name.ends_with('-'));
        }
    }
}
