//! Entity deletion watcher.
//!
//! Watches Pods and forwards the names of deleted ones to the process
//! supervisor, which prunes their leases from the dnsmasq lease file.

use crate::error::ControllerError;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube_runtime::watcher;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Watches Pods for deletions.
pub struct EntityDeletionWatcher {
    pod_api: Api<Pod>,
    label_selector: Option<String>,
    deletions: mpsc::Sender<Vec<String>>,
}

impl EntityDeletionWatcher {
    /// Creates a new watcher sending deletion batches to `deletions`.
    pub fn new(pod_api: Api<Pod>, label_selector: Option<String>, deletions: mpsc::Sender<Vec<String>>) -> Self {
        Self {
            pod_api,
            label_selector,
            deletions,
        }
    }

    /// Starts watching Pods. Only returns on stream failure or a closed queue.
    pub async fn watch_entities(&self) -> Result<(), ControllerError> {
        info!(
            "Starting entity deletion watcher (selector: {})",
            self.label_selector.as_deref().unwrap_or("<all pods>")
        );

        let mut config = watcher::Config::default();
        if let Some(selector) = &self.label_selector {
            config = config.labels(selector);
        }

        let mut stream = Box::pin(watcher(self.pod_api.clone(), config));

        while let Some(event) = stream.try_next().await
            .map_err(|e| ControllerError::ResourceWatch(format!("Pod watcher stream error: {}", e)))?
        {
            match event {
                watcher::Event::Init => debug!("Pod watcher initialized"),
                watcher::Event::InitDone => info!("Pod watcher initialization complete"),
                other => {
                    if let Some(batch) = deletion_batch(&other) {
                        info!("Entity deleted: {}", batch.join(", "));
                        self.deletions.send(batch).await.map_err(|_| {
                            ControllerError::ResourceWatch("deletion queue closed".to_string())
                        })?;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Names to prune for one watch event; only deletions of named pods produce a batch.
pub fn deletion_batch(event: &watcher::Event<Pod>) -> Option<Vec<String>> {
    match event {
        watcher::Event::Delete(pod) => pod
            .metadata
            .name
            .as_ref()
            .filter(|name| !name.is_empty())
            .map(|name| vec![name.clone()]),
        _ => None,
    }
}
