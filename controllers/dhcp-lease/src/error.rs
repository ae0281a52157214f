//! Controller-specific error types.
//!
//! Components return these to their caller; only the controller's top level
//! decides whether an error ends the process.

use lease_store::StoreError;
use thiserror::Error;
use kube::Error as KubeError;

use crate::supervisor::SupervisorState;
use crate::watcher::WatchError;

/// Errors that can occur in the DHCP lease controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Allocation store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Store call did not answer within the configured timeout
    #[error("Store call timed out: {0}")]
    StoreTimeout(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// dnsmasq configuration file missing or unreadable
    #[error("Cannot read dnsmasq configuration {path}: {source}")]
    ConfigUnreadable {
        /// Path that was read
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// dnsmasq binary missing
    #[error("dnsmasq binary not found: {0}")]
    BinaryNotFound(String),

    /// dnsmasq could not be started or stopped
    #[error("Process error: {0}")]
    Process(String),

    /// dnsmasq exited while it was supposed to be running
    #[error("dnsmasq exited unexpectedly: {0}")]
    ProcessExited(String),

    /// Supervisor asked to move between states that are not adjacent
    #[error("Invalid supervisor transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state
        from: SupervisorState,
        /// Requested state
        to: SupervisorState,
    },

    /// Lease file could not be watched
    #[error("Lease file watch failed: {0}")]
    Watch(#[from] WatchError),

    /// Lease file could not be rebuilt from the store
    #[error("Lease file restore failed: {0}")]
    Restore(String),

    /// Kubernetes resource watch failed
    #[error("Resource watch failed: {0}")]
    ResourceWatch(String),

    /// Lease file I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
