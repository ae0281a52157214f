//! dnsmasq process supervision.
//!
//! The supervisor owns the dnsmasq child process. It relays the child's
//! diagnostic output into the controller log and, when entities are deleted,
//! runs the restart sequence:
//!
//! ```text
//! Running -> Stopping -> Stopped -> (prune lease file) -> Starting -> Running
//! ```
//!
//! dnsmasq only reads its lease file at startup, so removing the lease of a
//! deleted entity requires stopping it first.

use crate::config::Settings;
use crate::error::ControllerError;
use crate::lease::{read_lease_file, write_lease_file};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Transitions kept for inspection
const HISTORY_LIMIT: usize = 32;

/// Lifecycle state of the supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl SupervisorState {
    fn can_move_to(self, next: SupervisorState) -> bool {
        use SupervisorState::{Running, Starting, Stopped, Stopping};
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
        )
    }
}

/// Command line used to launch dnsmasq
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsmasqCommand {
    pub binary: PathBuf,
    pub args: Vec<String>,
}

impl DnsmasqCommand {
    /// dnsmasq in the foreground, logging to a file, reading the config directory
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            binary: settings.dnsmasq_binary.clone(),
            args: vec![
                "--keep-in-foreground".to_string(),
                format!("--log-facility={}", settings.log_file.display()),
                format!("--conf-dir={}", settings.conf_dir.display()),
            ],
        }
    }
}

/// Owns the dnsmasq child process and its restart sequence.
#[derive(Debug)]
pub struct ProcessSupervisor {
    command: DnsmasqCommand,
    lease_file: PathBuf,
    stop_grace: Duration,
    state: SupervisorState,
    child: Option<Child>,
    relay: Option<JoinHandle<()>>,
    history: VecDeque<SupervisorState>,
}

enum SupervisorEvent {
    Deleted(Option<Vec<String>>),
    Exited(std::io::Result<std::process::ExitStatus>),
    Shutdown,
}

impl ProcessSupervisor {
    /// Creates a stopped supervisor.
    pub fn new(command: DnsmasqCommand, lease_file: PathBuf, stop_grace: Duration) -> Self {
        let mut history = VecDeque::with_capacity(HISTORY_LIMIT);
        history.push_back(SupervisorState::Stopped);
        Self {
            command,
            lease_file,
            stop_grace,
            state: SupervisorState::Stopped,
            child: None,
            relay: None,
            history,
        }
    }

    /// Current state
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Most recent states, oldest first
    pub fn history(&self) -> Vec<SupervisorState> {
        self.history.iter().copied().collect()
    }

    /// PID of the running child, if any
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    fn transition(&mut self, next: SupervisorState) -> Result<(), ControllerError> {
        if !self.state.can_move_to(next) {
            return Err(ControllerError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("dnsmasq supervisor: {:?} -> {:?}", self.state, next);
        self.state = next;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(next);
        Ok(())
    }

    /// Launch dnsmasq.
    ///
    /// A missing binary is reported as [`ControllerError::BinaryNotFound`].
    pub async fn start(&mut self) -> Result<(), ControllerError> {
        self.transition(SupervisorState::Starting)?;

        let spawned = Command::new(&self.command.binary)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.transition(SupervisorState::Stopped)?;
                let binary = self.command.binary.display().to_string();
                return Err(if e.kind() == std::io::ErrorKind::NotFound {
                    ControllerError::BinaryNotFound(binary)
                } else {
                    ControllerError::Process(format!("failed to start {}: {}", binary, e))
                });
            }
        };

        let pid = child.id();
        if let Some(stderr) = child.stderr.take() {
            self.relay = Some(tokio::spawn(relay_output(stderr, pid)));
        }
        self.child = Some(child);
        self.transition(SupervisorState::Running)?;

        info!("Started {} (pid {:?})", self.command.binary.display(), pid);
        Ok(())
    }

    /// Stop dnsmasq: SIGTERM, then SIGKILL once the grace period runs out.
    pub async fn stop(&mut self) -> Result<(), ControllerError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        self.transition(SupervisorState::Stopping)?;

        if let Some(pid) = child.id() {
            match i32::try_from(pid) {
                Ok(raw) => {
                    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                        warn!("Failed to send SIGTERM to dnsmasq (pid {}): {}", pid, e);
                    }
                }
                Err(e) => warn!("Cannot signal pid {}: {}", pid, e),
            }
        }

        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => info!("dnsmasq exited with {}", status),
            Ok(Err(e)) => warn!("Failed to wait for dnsmasq: {}", e),
            Err(_) => {
                warn!("dnsmasq did not exit within {:?}, killing", self.stop_grace);
                child
                    .kill()
                    .await
                    .map_err(|e| ControllerError::Process(format!("failed to kill dnsmasq: {}", e)))?;
            }
        }

        if let Some(relay) = self.relay.take() {
            let abort = relay.abort_handle();
            if tokio::time::timeout(self.stop_grace, relay).await.is_err() {
                debug!("Output relay still open after stop, aborting");
                abort.abort();
            }
        }

        self.transition(SupervisorState::Stopped)
    }

    /// Stop dnsmasq, drop every lease line naming one of `entities`, start it again.
    ///
    /// Returns the number of lease lines removed. Blank identifiers are ignored;
    /// a batch with none left does not restart anything. dnsmasq is started
    /// again even when pruning fails.
    pub async fn handle_deletion(&mut self, entities: &[String]) -> Result<usize, ControllerError> {
        let entities: Vec<&str> = entities
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .collect();
        if entities.is_empty() {
            return Ok(0);
        }

        info!("Entities deleted ({}), restarting dnsmasq without their leases", entities.join(", "));
        self.stop().await?;
        let pruned = prune_lease_file(&self.lease_file, &entities).await;
        self.start().await?;

        let removed = pruned?;
        info!("Removed {} lease line(s) for deleted entities, dnsmasq now pid {:?}", removed, self.pid());
        Ok(removed)
    }

    /// Supervise until shutdown.
    ///
    /// Deletion batches trigger the restart sequence. dnsmasq exiting on its
    /// own is fatal. On shutdown dnsmasq is stopped and `Ok` returned.
    pub async fn run(
        mut self,
        mut deletions: mpsc::Receiver<Vec<String>>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ControllerError> {
        let mut deletions_open = true;

        loop {
            let event = {
                let Some(child) = self.child.as_mut() else {
                    return Err(ControllerError::Process("dnsmasq is not running".to_string()));
                };
                tokio::select! {
                    batch = deletions.recv(), if deletions_open => SupervisorEvent::Deleted(batch),
                    status = child.wait() => SupervisorEvent::Exited(status),
                    _ = shutdown.recv() => SupervisorEvent::Shutdown,
                }
            };

            match event {
                SupervisorEvent::Deleted(Some(batch)) => {
                    if let Err(e) = self.handle_deletion(&batch).await {
                        if self.state != SupervisorState::Running {
                            return Err(e);
                        }
                        error!("Failed to prune leases for deleted entities: {}", e);
                    }
                }
                SupervisorEvent::Deleted(None) => {
                    warn!("Entity deletion queue closed, no further lease pruning");
                    deletions_open = false;
                }
                SupervisorEvent::Exited(status) => {
                    self.child = None;
                    self.transition(SupervisorState::Stopped)?;
                    let reason = match status {
                        Ok(status) => status.to_string(),
                        Err(e) => e.to_string(),
                    };
                    error!("dnsmasq exited ({}), recent states: {:?}", reason, self.history());
                    return Err(ControllerError::ProcessExited(reason));
                }
                SupervisorEvent::Shutdown => {
                    info!("Stopping dnsmasq for shutdown");
                    return self.stop().await;
                }
            }
        }
    }
}

/// Forward each stderr line of the child to the log until the stream closes.
async fn relay_output(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "dnsmasq", pid = ?pid, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(target: "dnsmasq", pid = ?pid, "Output relay failed: {}", e);
                break;
            }
        }
    }
    debug!("dnsmasq output relay for pid {:?} finished", pid);
}

/// Remove every line containing any of `entities`, returning how many went.
///
/// Works on raw bytes; kept lines are copied through unchanged, whatever
/// their encoding.
pub fn prune_lines(contents: &[u8], entities: &[&str]) -> (Vec<u8>, usize) {
    let mut kept = Vec::with_capacity(contents.len());
    let mut removed = 0;
    for line in contents.split_inclusive(|b| *b == b'\n') {
        if entities.iter().any(|entity| contains_bytes(line, entity.as_bytes())) {
            removed += 1;
        } else {
            kept.extend_from_slice(line);
        }
    }
    (kept, removed)
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

/// Prune the lease file in place; a missing file has nothing to prune.
pub async fn prune_lease_file(path: &Path, entities: &[&str]) -> Result<usize, ControllerError> {
    let Some(bytes) = read_lease_file(path).await? else {
        debug!("No lease file at {}, nothing to prune", path.display());
        return Ok(0);
    };
    let (kept, removed) = prune_lines(&bytes, entities);
    if removed > 0 {
        write_lease_file(path, &kept).await?;
    }
    Ok(removed)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use SupervisorState::{Running, Starting, Stopped, Stopping};

    fn shell(script: &str) -> DnsmasqCommand {
        DnsmasqCommand {
            binary: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn lease_file(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("dnsmasq.leases");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_prune_lines_matches_substrings() {
        let contents = "\
1 aa:01 10.0.0.5 host1 *
1 aa:02 10.0.0.6 host2 *
1 aa:03 10.0.0.7 host10 *
";
        let (kept, removed) = prune_lines(contents.as_bytes(), &["host1"]);
        assert_eq!(removed, 2);
        assert_eq!(kept, b"1 aa:02 10.0.0.6 host2 *\n");
    }

    #[tokio::test]
    async fn test_prune_keeps_undecodable_lines_byte_for_byte() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dnsmasq.leases");
        let original: &[u8] = b"1 aa:01 10.0.0.5 host1 *\n1 aa:02 10.0.0.6 h\xe9st *\n1 aa:03 10.0.0.7 host3 *";
        std::fs::write(&path, original).unwrap();

        let removed = prune_lease_file(&path, &["host1", ""]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"1 aa:02 10.0.0.6 h\xe9st *\n1 aa:03 10.0.0.7 host3 *");
    }

    #[test]
    fn test_command_from_settings() {
        let settings = Settings::from_lookup(|_| None).unwrap();
        let command = DnsmasqCommand::from_settings(&settings);
        assert_eq!(command.binary, PathBuf::from("dnsmasq"));
        assert_eq!(command.args, vec![
            "--keep-in-foreground",
            "--log-facility=/var/log/dnsmasq.log",
            "--conf-dir=/etc/dnsmasq.d",
        ]);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(Stopped.can_move_to(Starting));
        assert!(!Stopped.can_move_to(Running));
        assert!(!Running.can_move_to(Starting));
        assert!(!Stopping.can_move_to(Running));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = ProcessSupervisor::new(
            shell("echo ready >&2; exec sleep 30"),
            lease_file(&dir, ""),
            Duration::from_secs(1),
        );

        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), Running);
        assert!(supervisor.pid().is_some());

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), Stopped);
        assert!(supervisor.pid().is_none());
        assert_eq!(supervisor.history(), vec![Stopped, Starting, Running, Stopping, Stopped]);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = ProcessSupervisor::new(
            shell("trap '' TERM; while true; do sleep 1; done"),
            lease_file(&dir, ""),
            Duration::from_millis(200),
        );

        supervisor.start().await.unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(5), supervisor.stop()).await;
        assert!(matches!(stopped, Ok(Ok(()))));
        assert_eq!(supervisor.state(), Stopped);
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = ProcessSupervisor::new(
            DnsmasqCommand {
                binary: PathBuf::from("/nonexistent/dnsmasq"),
                args: vec![],
            },
            lease_file(&dir, ""),
            Duration::from_secs(1),
        );

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, ControllerError::BinaryNotFound(_)));
        assert_eq!(supervisor.state(), Stopped);
    }

    #[tokio::test]
    async fn test_deletion_stops_prunes_and_restarts() {
        let dir = TempDir::new().unwrap();
        let path = lease_file(&dir, "\
1700000000 aa:bb:cc:dd:ee:ff 10.0.0.5 host1 *
1700000000 aa:bb:cc:dd:ee:00 10.0.0.6 host2 *
");
        let mut supervisor = ProcessSupervisor::new(shell("exec sleep 30"), path.clone(), Duration::from_secs(1));
        supervisor.start().await.unwrap();
        let first_pid = supervisor.pid();

        let removed = supervisor.handle_deletion(&["host1".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "1700000000 aa:bb:cc:dd:ee:00 10.0.0.6 host2 *\n"
        );
        assert_eq!(supervisor.state(), Running);
        assert_ne!(supervisor.pid(), first_pid);
        assert_eq!(
            supervisor.history(),
            vec![Stopped, Starting, Running, Stopping, Stopped, Starting, Running]
        );

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_blank_deletion_batch_is_ignored() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = ProcessSupervisor::new(shell("exec sleep 30"), lease_file(&dir, ""), Duration::from_secs(1));
        supervisor.start().await.unwrap();

        assert_eq!(supervisor.handle_deletion(&[String::new(), " ".to_string()]).await.unwrap(), 0);
        assert_eq!(supervisor.history(), vec![Stopped, Starting, Running]);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_reports_unexpected_exit() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = ProcessSupervisor::new(shell("exit 3"), lease_file(&dir, ""), Duration::from_secs(1));
        supervisor.start().await.unwrap();

        let (_deletion_tx, deletion_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let result = tokio::time::timeout(Duration::from_secs(5), supervisor.run(deletion_rx, shutdown_rx)).await;
        assert!(matches!(result, Ok(Err(ControllerError::ProcessExited(_)))));
    }

    #[tokio::test]
    async fn test_run_handles_deletions_then_shutdown() {
        let dir = TempDir::new().unwrap();
        let path = lease_file(&dir, "1700000000 aa:bb:cc:dd:ee:ff 10.0.0.5 host1 *\n");
        let mut supervisor = ProcessSupervisor::new(shell("exec sleep 30"), path.clone(), Duration::from_secs(1));
        supervisor.start().await.unwrap();

        let (deletion_tx, deletion_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(supervisor.run(deletion_rx, shutdown_rx));

        deletion_tx.send(vec!["host1".to_string()]).await.unwrap();
        for _ in 0..50 {
            if std::fs::read_to_string(&path).unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        shutdown_tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
