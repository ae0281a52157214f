//! DHCP Lease Controller
//!
//! Runs dnsmasq and keeps its leases in sync with DhcpLease records:
//! - lease file changes are pushed to the store as they happen
//! - a missing lease file is rebuilt from the store
//! - leases of deleted Pods are pruned and dnsmasq restarted
//!
//! This lets dnsmasq survive restarts and volume loss without handing out
//! addresses that are still in use.

mod backoff;
mod config;
mod controller;
mod entity_watcher;
mod error;
mod lease;
mod reconciler;
mod restore;
mod supervisor;
mod sync;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Settings;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting DHCP Lease Controller");

    let settings = Settings::from_env()?;

    info!("Configuration:");
    info!("  dnsmasq binary: {}", settings.dnsmasq_binary.display());
    info!("  Config file: {}", settings.config_file.display());
    info!("  Lease file: {}", settings.lease_file.display());
    info!("  Namespace: {}", settings.namespace);
    info!(
        "  Entity selector: {}",
        settings.entity_label_selector.as_deref().unwrap_or("all pods")
    );

    let controller = Controller::new(settings).await?;
    controller.run().await?;

    Ok(())
}
