//! Prints the CRD manifests for this crate as YAML.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/dhcplease.yaml`

use anyhow::Result;
use crds::DhcpLease;
use kube::CustomResourceExt;

fn main() -> Result<()> {
    print!("{}", serde_yaml::to_string(&DhcpLease::crd())?);
    Ok(())
}
