//! Allocation store errors

use thiserror::Error;

/// Errors that can occur when talking to the allocation store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// No allocation exists for the IP
    #[error("Not found: {0}")]
    NotFound(String),

    /// An allocation already exists for the IP
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Stored object could not be turned into an allocation record
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Store rejected or failed the request
    #[error("Store error: {0}")]
    Api(String),
}

impl StoreError {
    /// Whether this error is the distinguished not-found outcome
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
