//! Process Supervisor
//!
//! Owns exactly one spawned server process end-to-end: launch, output
//! capture, health probing, and graceful-then-forced termination. The child
//! handle never leaves the supervisor task; the registry interacts only
//! through a [`SupervisorHandle`] and receives lifecycle reports over an
//! event channel. Every supervised process produces exactly one terminal
//! event.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::{FleetConfig, InstanceConfig};
use crate::logs::LogHub;

/// How often a running child is reaped for exit detection.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Per-attempt connect timeout during health probing.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle report from a supervisor to the registry.
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    /// Health probe succeeded; the server accepts connections.
    Started { id: String, pid: u32, url: String },
    /// The OS refused to spawn the process.
    SpawnFailed { id: String, error: String },
    /// The server never became reachable within the probe timeout.
    ProbeTimedOut { id: String },
    /// The process exited. `requested` distinguishes "stopped by request"
    /// from "exited unexpectedly".
    Exited {
        id: String,
        code: Option<i32>,
        requested: bool,
    },
    /// The process survived SIGKILL past the kill window.
    ForcedKillTimedOut { id: String },
}

impl InstanceEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Started { id, .. }
            | Self::SpawnFailed { id, .. }
            | Self::ProbeTimedOut { id }
            | Self::Exited { id, .. }
            | Self::ForcedKillTimedOut { id } => id,
        }
    }
}

/// Opaque handle the registry keeps for a live supervisor. Dropping it does
/// not kill the process; stopping is always an explicit request.
#[derive(Debug)]
pub struct SupervisorHandle {
    stop_tx: mpsc::Sender<()>,
}

impl SupervisorHandle {
    /// Ask the supervisor to terminate its child. Idempotent: repeated
    /// requests while one is pending are absorbed.
    pub fn request_stop(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

/// Supervises one spawned server process.
pub struct ProcessSupervisor {
    id: String,
    config: InstanceConfig,
    fleet: FleetConfig,
    events: mpsc::UnboundedSender<InstanceEvent>,
    logs: Arc<LogHub>,
}

impl ProcessSupervisor {
    pub fn new(
        config: InstanceConfig,
        fleet: FleetConfig,
        events: mpsc::UnboundedSender<InstanceEvent>,
        logs: Arc<LogHub>,
    ) -> Self {
        Self {
            id: config.id(),
            config,
            fleet,
            events,
            logs,
        }
    }

    /// Launch the process and drive its lifecycle on a dedicated task.
    /// Returns immediately; lifecycle outcomes arrive on the event channel.
    pub fn spawn(self) -> SupervisorHandle {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        tokio::spawn(self.run(stop_rx));
        SupervisorHandle { stop_tx }
    }

    async fn run(self, mut stop_rx: mpsc::Receiver<()>) {
        let prefix = self.config.log_prefix();

        let mut child = match self.launch() {
            Ok(child) => child,
            Err(e) => {
                let error = format!("{:#}", e);
                self.logs.emit(&prefix, format!("failed to spawn server: {}", error));
                self.send(InstanceEvent::SpawnFailed {
                    id: self.id.clone(),
                    error,
                });
                return;
            }
        };
        let pid = child.id();
        tracing::debug!(id = %self.id, pid, "spawned server process");
        self.pump_output(&mut child);

        // Probe until the server accepts connections, the child dies, a stop
        // arrives, or the timeout expires.
        let deadline = Instant::now() + self.fleet.probe_timeout;
        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    self.shutdown(child, &prefix).await;
                    return;
                }
                _ = tokio::time::sleep(self.fleet.probe_interval) => {
                    if let Ok(Some(status)) = child.try_wait() {
                        self.logs.emit(&prefix, format!(
                            "server process died during startup (status {})", status,
                        ));
                        self.send(InstanceEvent::Exited {
                            id: self.id.clone(),
                            code: status.code(),
                            requested: false,
                        });
                        return;
                    }
                    if self.probe_once().await {
                        let url = self.config.url();
                        self.logs.emit(&prefix, format!("server ready at {} (pid {})", url, pid));
                        self.send(InstanceEvent::Started {
                            id: self.id.clone(),
                            pid,
                            url,
                        });
                        break;
                    }
                    if Instant::now() >= deadline {
                        self.logs.emit(&prefix, "server never became reachable, killing process");
                        let _ = child.kill();
                        wait_with_deadline(&mut child, self.fleet.kill_timeout).await;
                        self.send(InstanceEvent::ProbeTimedOut { id: self.id.clone() });
                        return;
                    }
                }
            }
        }

        // Running: watch for exit or a stop request.
        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    self.shutdown(child, &prefix).await;
                    return;
                }
                _ = tokio::time::sleep(EXIT_POLL_INTERVAL) => {
                    if let Ok(Some(status)) = child.try_wait() {
                        self.logs.emit(&prefix, format!(
                            "server exited unexpectedly (status {})", status,
                        ));
                        self.send(InstanceEvent::Exited {
                            id: self.id.clone(),
                            code: status.code(),
                            requested: false,
                        });
                        return;
                    }
                }
            }
        }
    }

    fn launch(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.fleet.server.program);
        cmd.args(&self.fleet.server.args)
            .args(self.config.command_args())
            .envs(self.config.env())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.fleet.server.working_dir {
            cmd.current_dir(dir);
        }
        cmd.spawn().with_context(|| {
            format!(
                "failed to spawn {} for instance {}",
                self.fleet.server.program.display(),
                self.id
            )
        })
    }

    /// Forward both output streams into the hub on dedicated reader threads.
    /// The threads exit when the pipes close; they never block the child.
    fn pump_output(&self, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            let logs = Arc::clone(&self.logs);
            let prefix = self.config.log_prefix();
            std::thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                    logs.emit(&prefix, line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let logs = Arc::clone(&self.logs);
            let prefix = self.config.log_prefix();
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    logs.emit(&prefix, line);
                }
            });
        }
    }

    async fn probe_once(&self) -> bool {
        let addr = (self.config.host.as_str(), self.config.port);
        matches!(
            tokio::time::timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    /// Graceful stop: SIGTERM, wait up to the grace period, escalate to
    /// SIGKILL, wait the kill window. Always resolves to a definite event.
    async fn shutdown(&self, mut child: Child, prefix: &str) {
        self.logs.emit(prefix, "stopping server...");

        if let Ok(Some(status)) = child.try_wait() {
            // Already exited between the stop request and now.
            self.send(InstanceEvent::Exited {
                id: self.id.clone(),
                code: status.code(),
                requested: true,
            });
            return;
        }

        send_sigterm(&mut child);
        let status = match wait_with_deadline(&mut child, self.fleet.grace_period).await {
            Some(status) => Some(status),
            None => {
                self.logs.emit(prefix, "grace period expired, force-killing");
                let _ = child.kill();
                wait_with_deadline(&mut child, self.fleet.kill_timeout).await
            }
        };

        match status {
            Some(status) => {
                self.logs.emit(prefix, "server stopped");
                self.send(InstanceEvent::Exited {
                    id: self.id.clone(),
                    code: status.code(),
                    requested: true,
                });
            }
            None => {
                self.logs.emit(prefix, "process survived SIGKILL");
                self.send(InstanceEvent::ForcedKillTimedOut { id: self.id.clone() });
            }
        }
    }

    fn send(&self, event: InstanceEvent) {
        // The receiver lives as long as the registry; a closed channel means
        // the whole orchestrator is shutting down.
        let _ = self.events.send(event);
    }
}

/// Poll `try_wait` until the child exits or the window elapses.
async fn wait_with_deadline(child: &mut Child, window: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + window;
    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    let _ = child.kill();
}
