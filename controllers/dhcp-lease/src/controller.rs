//! Main controller implementation.
//!
//! Startup order matters: the lease file is restored from the store before
//! dnsmasq is launched, since dnsmasq only reads it at startup. After that
//! three tasks run side by side:
//! - lease sync: lease file changes into the store
//! - supervisor: dnsmasq process, restarts on entity deletion
//! - entity watcher: Pod deletions into the supervisor's queue

use crate::backoff::FibonacciBackoff;
use crate::config::{Settings, load_ranges};
use crate::entity_watcher::EntityDeletionWatcher;
use crate::error::ControllerError;
use crate::restore::restore_with_retry;
use crate::supervisor::{DnsmasqCommand, ProcessSupervisor};
use crate::sync::LeaseSync;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use lease_store::{KubeLeaseStore, LeaseStoreTrait};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Deletion batches waiting for the supervisor
const DELETION_QUEUE_DEPTH: usize = 64;

type TaskHandle = JoinHandle<Result<(), ControllerError>>;

/// Main controller for dnsmasq lease management.
#[derive(Debug)]
pub struct Controller {
    lease_sync: TaskHandle,
    supervisor: TaskHandle,
    entity_watcher: TaskHandle,
    shutdown_tx: broadcast::Sender<()>,
    stop_grace: Duration,
}

impl Controller {
    /// Restores the lease file, starts dnsmasq and spawns the controller tasks.
    pub async fn new(settings: Settings) -> Result<Self, ControllerError> {
        info!("Initializing DHCP lease controller");

        let ranges = load_ranges(&settings.config_file)?;
        info!("Loaded {} dhcp-range(s) from {}", ranges.len(), settings.config_file.display());

        let kube_client = Client::try_default().await?;
        let store: Arc<dyn LeaseStoreTrait> = Arc::new(KubeLeaseStore::new(kube_client.clone(), &settings.namespace));

        info!("Restoring lease file from store...");
        let mut backoff = FibonacciBackoff::default();
        let restored = restore_with_retry(
            &settings.lease_file,
            &ranges,
            store.as_ref(),
            settings.store_timeout,
            &mut backoff,
        )
        .await?;
        info!("Lease file restored with {} lease(s)", restored);

        let mut supervisor = ProcessSupervisor::new(
            DnsmasqCommand::from_settings(&settings),
            settings.lease_file.clone(),
            settings.stop_grace,
        );
        supervisor.start().await?;

        let (deletion_tx, deletion_rx) = mpsc::channel(DELETION_QUEUE_DEPTH);
        let (shutdown_tx, _) = broadcast::channel(1);

        let supervisor = tokio::spawn(supervisor.run(deletion_rx, shutdown_tx.subscribe()));

        let lease_sync = tokio::spawn(
            LeaseSync::new(
                settings.lease_file.clone(),
                settings.settle_delay,
                ranges,
                Arc::clone(&store),
                settings.store_timeout,
            )
            .run(),
        );

        let pod_api: Api<Pod> = Api::namespaced(kube_client, &settings.namespace);
        let entity_watcher = {
            let watcher = EntityDeletionWatcher::new(pod_api, settings.entity_label_selector.clone(), deletion_tx);
            tokio::spawn(async move { watcher.watch_entities().await })
        };

        Ok(Self {
            lease_sync,
            supervisor,
            entity_watcher,
            shutdown_tx,
            stop_grace: settings.stop_grace,
        })
    }

    /// Runs until a task ends or a shutdown signal arrives.
    ///
    /// Every task is expected to run forever, so any of them ending is an error.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("DHCP lease controller running");

        let (outcome, supervisor_done) = tokio::select! {
            result = &mut self.lease_sync => (task_result("Lease sync", result), false),
            result = &mut self.supervisor => (task_result("Supervisor", result), true),
            result = &mut self.entity_watcher => (task_result("Entity watcher", result), false),
            () = shutdown_signal() => {
                info!("Shutdown requested");
                (Ok(()), false)
            }
        };

        self.lease_sync.abort();
        self.entity_watcher.abort();
        if supervisor_done {
            return outcome;
        }

        // The supervisor stops dnsmasq before returning
        if self.shutdown_tx.send(()).is_err() {
            warn!("Supervisor already gone at shutdown");
        }
        match tokio::time::timeout(shutdown_deadline(self.stop_grace), &mut self.supervisor).await {
            Ok(Ok(Ok(()))) => info!("dnsmasq stopped"),
            Ok(Ok(Err(e))) => error!("dnsmasq did not stop cleanly: {}", e),
            Ok(Err(e)) => error!("Supervisor task panicked during shutdown: {}", e),
            Err(_) => {
                warn!("Supervisor did not finish in time, aborting");
                self.supervisor.abort();
            }
        }

        outcome
    }
}

/// How long shutdown waits for the supervisor to stop dnsmasq.
fn shutdown_deadline(stop_grace: Duration) -> Duration {
    stop_grace.saturating_mul(5)
}

fn task_result(
    task: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    match result {
        Ok(Ok(())) => Err(ControllerError::Process(format!("{} task ended unexpectedly", task))),
        Ok(Err(e)) => {
            error!("{} task failed: {}", task, e);
            Err(e)
        }
        Err(e) => Err(ControllerError::Process(format!("{} task panicked: {}", task, e))),
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Cannot listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_deadline_saturates() {
        assert_eq!(shutdown_deadline(Duration::from_secs(1)), Duration::from_secs(5));
        assert_eq!(shutdown_deadline(Duration::from_millis(u64::MAX)), Duration::MAX);
    }

    #[test]
    fn test_clean_task_exit_is_an_error() {
        let result = task_result("Lease sync", Ok(Ok(())));
        assert!(matches!(result, Err(ControllerError::Process(_))));
    }
}
