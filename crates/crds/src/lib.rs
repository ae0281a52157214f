//! DHCP Lease CRD Definitions
//!
//! Kubernetes Custom Resource Definitions used by the DHCP lease controller.

pub mod dhcp_lease;

pub use dhcp_lease::*;
