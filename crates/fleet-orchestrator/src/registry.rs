//! Instance Registry
//!
//! The stateful core: maps stable instance ids to configuration, assigned
//! device and port, and lifecycle state, and coordinates one supervisor per
//! live instance. The registry is the sole writer of instance state;
//! supervisors report back over an event channel that a registry-owned task
//! drains, so "process exited" never re-enters registry locks.
//!
//! All operations take the registry map lock only for short, non-blocking
//! critical sections. Anything that can block (spawning aside, which is a
//! fork, not a wait) lives in the per-instance supervisor tasks.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::{self, FleetConfig, InstanceConfig, VramMode};
use crate::error::{RegistryError, Result};
use crate::logs::LogHub;
use crate::ports::PortAllocator;
use crate::supervisor::{InstanceEvent, ProcessSupervisor, SupervisorHandle};

/// Lifecycle state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl InstanceState {
    /// A live instance claims its port exclusively.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Terminal-for-now states accept `start()` again.
    pub fn is_startable(&self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        };
        write!(f, "{}", name)
    }
}

/// Internal per-instance slot. The supervisor handle is opaque; the raw
/// process handle never reaches the registry.
struct Slot {
    config: InstanceConfig,
    state: InstanceState,
    handle: Option<SupervisorHandle>,
    url: Option<String>,
    pid: Option<u32>,
    started_at: Option<Instant>,
    last_error: Option<String>,
}

impl Slot {
    fn new(config: InstanceConfig) -> Self {
        Self {
            config,
            state: InstanceState::Stopped,
            handle: None,
            url: None,
            pid: None,
            started_at: None,
            last_error: None,
        }
    }

    fn clear_process(&mut self) {
        self.handle = None;
        self.url = None;
        self.pid = None;
        self.started_at = None;
    }
}

/// Immutable point-in-time view of one instance.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub id: String,
    pub config: InstanceConfig,
    pub state: InstanceState,
    pub url: Option<String>,
    pub pid: Option<u32>,
    pub uptime: Option<Duration>,
    pub last_error: Option<String>,
}

/// Outcome of one instance within a batch operation.
pub type BatchOutcome = Vec<(String, Result<()>)>;

/// Orchestrates many server instances. Cheap to clone; clones share state.
///
/// Must be created and used within a Tokio runtime: supervisors and the
/// event-drain task run on it.
#[derive(Clone)]
pub struct InstanceRegistry {
    inner: Arc<Mutex<BTreeMap<String, Slot>>>,
    config: FleetConfig,
    allocator: PortAllocator,
    logs: Arc<LogHub>,
    events_tx: mpsc::UnboundedSender<InstanceEvent>,
}

impl InstanceRegistry {
    pub fn new(config: FleetConfig, logs: Arc<LogHub>) -> Self {
        let inner: Arc<Mutex<BTreeMap<String, Slot>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let allocator = PortAllocator::new(config.port_range_start, config.port_range_end);

        tokio::spawn(Self::drain_events(
            Arc::clone(&inner),
            Arc::clone(&logs),
            events_rx,
        ));

        Self {
            inner,
            config,
            allocator,
            logs,
            events_tx,
        }
    }

    pub fn fleet_config(&self) -> &FleetConfig {
        &self.config
    }

    /// Register a new instance in `Stopped` state. Pure bookkeeping; no
    /// process is spawned.
    ///
    /// Fails with `DuplicatePort` when the port is claimed by a non-stopped
    /// instance. Re-adding the (device, port) pair of a stopped or crashed
    /// instance replaces its configuration.
    pub fn add_instance(&self, config: InstanceConfig) -> Result<InstanceSnapshot> {
        let mut config = config;
        if !(1024..=65535).contains(&config.port) {
            return Err(RegistryError::InvalidPort(config.port));
        }
        // A CPU instance always runs the server in CPU vram mode.
        if config.device.is_cpu() && config.vram_mode != VramMode::Cpu {
            config.vram_mode = VramMode::Cpu;
        }
        let id = config.id();

        let mut map = self.inner.lock().unwrap();

        for (other_id, slot) in map.iter() {
            if *other_id != id
                && slot.config.port == config.port
                && slot.state != InstanceState::Stopped
            {
                return Err(RegistryError::DuplicatePort {
                    port: config.port,
                    instance_id: other_id.clone(),
                });
            }
        }

        if let Some(existing) = map.get_mut(&id) {
            if existing.state.is_live() {
                return Err(RegistryError::DuplicatePort {
                    port: config.port,
                    instance_id: id,
                });
            }
            // Configs are mutable until started; replace in place.
            existing.config = config;
            existing.state = InstanceState::Stopped;
            existing.clear_process();
            existing.last_error = None;
            self.logs
                .emit_status(format!("updated instance {}", id));
            return Ok(snapshot_of(&id, existing));
        }

        if map.len() >= self.config.max_instances {
            return Err(RegistryError::TooManyInstances(self.config.max_instances));
        }

        if config.device.is_gpu()
            && map
                .values()
                .any(|slot| slot.config.device == config.device)
        {
            // Sharing a device is allowed (VRAM permitting); capacity is the
            // operator's responsibility, so only warn.
            tracing::warn!(
                id = %id,
                device = %config.device,
                "device already used by another instance, VRAM is shared"
            );
            self.logs.emit_status(format!(
                "warning: {} shares device {} with another instance",
                id, config.device
            ));
        }

        let slot = Slot::new(config);
        let snapshot = snapshot_of(&id, &slot);
        self.logs.emit_status(format!(
            "added instance {} ({} on port {})",
            id, slot.config.device_label, slot.config.port
        ));
        map.insert(id, slot);
        Ok(snapshot)
    }

    /// Delete a stopped or crashed instance and release its port.
    pub fn remove_instance(&self, id: &str) -> Result<InstanceConfig> {
        let mut map = self.inner.lock().unwrap();
        let Entry::Occupied(entry) = map.entry(id.to_string()) else {
            return Err(RegistryError::NotFound(id.to_string()));
        };
        if entry.get().state.is_live() {
            return Err(RegistryError::InvalidState {
                id: id.to_string(),
                state: entry.get().state,
                expected: "stopped or crashed",
            });
        }
        let slot = entry.remove();
        self.logs.emit_status(format!("removed instance {}", id));
        Ok(slot.config)
    }

    /// Begin starting an instance. Transitions to `Starting` and returns
    /// immediately; `Running`/`Crashed` arrives asynchronously via the
    /// supervisor. At most one spawn per id: the state check and the spawn
    /// happen under the registry lock.
    pub fn start_instance(&self, id: &str) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        let slot = map.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if !slot.state.is_startable() {
            return Err(RegistryError::InvalidState {
                id: id.to_string(),
                state: slot.state,
                expected: "stopped or crashed",
            });
        }

        // Two stopped instances may hold the same port; only one may go live.
        let port = slot.config.port;
        if let Some((other_id, _)) = map
            .iter()
            .find(|(other_id, other)| *other_id != id && other.config.port == port && other.state.is_live())
        {
            return Err(RegistryError::DuplicatePort {
                port,
                instance_id: other_id.clone(),
            });
        }

        let slot = map
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        slot.state = InstanceState::Starting;
        slot.started_at = Some(Instant::now());
        slot.last_error = None;

        let supervisor = ProcessSupervisor::new(
            slot.config.clone(),
            self.config.clone(),
            self.events_tx.clone(),
            Arc::clone(&self.logs),
        );
        slot.handle = Some(supervisor.spawn());

        self.logs
            .emit_status(format!("starting instance {} on port {}", id, port));
        Ok(())
    }

    /// Request a graceful stop. Idempotent: stopping a stopped, crashed, or
    /// already-stopping instance is a no-op.
    pub fn stop_instance(&self, id: &str) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        let slot = map.get_mut(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        match slot.state {
            InstanceState::Stopped | InstanceState::Crashed | InstanceState::Stopping => Ok(()),
            InstanceState::Starting | InstanceState::Running => {
                slot.state = InstanceState::Stopping;
                if let Some(handle) = &slot.handle {
                    handle.request_stop();
                }
                self.logs.emit_status(format!("stopping instance {}", id));
                Ok(())
            }
        }
    }

    /// Start every startable instance. One instance failing never aborts the
    /// batch; every outcome is reported, and failures also reach the status
    /// feed for fire-and-forget controllers.
    pub fn start_all(&self) -> BatchOutcome {
        let ids: Vec<String> = {
            let map = self.inner.lock().unwrap();
            map.iter()
                .filter(|(_, slot)| slot.state.is_startable())
                .map(|(id, _)| id.clone())
                .collect()
        };
        self.logs
            .emit_status(format!("starting {} instance(s)", ids.len()));
        ids.into_iter()
            .map(|id| {
                let outcome = self.start_instance(&id);
                if let Err(e) = &outcome {
                    self.logs
                        .emit_status(format!("failed to start {}: {}", id, e));
                }
                (id, outcome)
            })
            .collect()
    }

    /// Request a stop for every instance. Completes once every request has
    /// been issued; it does not wait for `Stopped` confirmations.
    pub fn stop_all(&self) -> BatchOutcome {
        let ids: Vec<String> = {
            let map = self.inner.lock().unwrap();
            map.keys().cloned().collect()
        };
        ids.into_iter()
            .map(|id| {
                let outcome = self.stop_instance(&id);
                if let Err(e) = &outcome {
                    self.logs
                        .emit_status(format!("failed to stop {}: {}", id, e));
                }
                (id, outcome)
            })
            .collect()
    }

    /// Immutable snapshot of every instance, ordered by id. Never blocks on
    /// pending transitions.
    pub fn list(&self) -> Vec<InstanceSnapshot> {
        let map = self.inner.lock().unwrap();
        map.iter().map(|(id, slot)| snapshot_of(id, slot)).collect()
    }

    pub fn get(&self, id: &str) -> Option<InstanceSnapshot> {
        let map = self.inner.lock().unwrap();
        map.get(id).map(|slot| snapshot_of(id, slot))
    }

    pub fn running_count(&self) -> usize {
        let map = self.inner.lock().unwrap();
        map.values()
            .filter(|slot| slot.state == InstanceState::Running)
            .count()
    }

    /// True while any instance still holds (or is acquiring) a process.
    pub fn any_live(&self) -> bool {
        let map = self.inner.lock().unwrap();
        map.values().any(|slot| slot.state.is_live())
    }

    /// Lowest port in the configured range not held by any registered
    /// instance, stopped or not, so auto-picked ports never collide with an
    /// existing id either.
    pub fn next_available_port(&self) -> Result<u16> {
        let in_use: BTreeSet<u16> = {
            let map = self.inner.lock().unwrap();
            map.values().map(|slot| slot.config.port).collect()
        };
        self.allocator.next_free(&in_use)
    }

    /// Persist all instance configurations as an ordered JSON list.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let configs: Vec<InstanceConfig> = {
            let map = self.inner.lock().unwrap();
            map.values().map(|slot| slot.config.clone()).collect()
        };
        config::save_instances(path, &configs)
    }

    /// Reload persisted instances in `Stopped` state. Entries that no longer
    /// fit (duplicate port, over the cap) are skipped with a status line.
    /// Returns how many were restored.
    pub fn restore(&self, path: &Path) -> usize {
        let mut restored = 0;
        for config in config::load_instances(path) {
            let id = config.id();
            match self.add_instance(config) {
                Ok(_) => restored += 1,
                Err(e) => self
                    .logs
                    .emit_status(format!("skipping persisted instance {}: {}", id, e)),
            }
        }
        restored
    }

    /// Apply supervisor reports to instance state. This task is the only
    /// place asynchronous transitions happen, keeping them totally ordered
    /// per instance.
    async fn drain_events(
        inner: Arc<Mutex<BTreeMap<String, Slot>>>,
        logs: Arc<LogHub>,
        mut events_rx: mpsc::UnboundedReceiver<InstanceEvent>,
    ) {
        while let Some(event) = events_rx.recv().await {
            let event_id = event.id().to_string();
            let mut map = inner.lock().unwrap();
            let Some(slot) = map.get_mut(&event_id) else {
                // Instance was removed after its last event was in flight.
                continue;
            };
            let before = slot.state;
            match event {
                InstanceEvent::Started { pid, url, .. } => {
                    // A stop may have raced the probe; let the stop resolve.
                    if slot.state == InstanceState::Starting {
                        slot.state = InstanceState::Running;
                        slot.pid = Some(pid);
                        slot.url = Some(url);
                    }
                }
                InstanceEvent::SpawnFailed { id, error } => {
                    slot.state = InstanceState::Crashed;
                    slot.clear_process();
                    slot.last_error = Some(error);
                    logs.emit_status(format!("instance {} crashed: spawn failed", id));
                }
                InstanceEvent::ProbeTimedOut { id } => {
                    slot.state = InstanceState::Crashed;
                    slot.clear_process();
                    slot.last_error = Some("health probe timed out".to_string());
                    logs.emit_status(format!("instance {} crashed: probe timed out", id));
                }
                InstanceEvent::Exited { id, code, requested } => {
                    let stopping = slot.state == InstanceState::Stopping;
                    slot.clear_process();
                    if requested || stopping {
                        slot.state = InstanceState::Stopped;
                        logs.emit_status(format!("instance {} stopped", id));
                    } else {
                        slot.state = InstanceState::Crashed;
                        slot.last_error =
                            Some(format!("exited unexpectedly (status {:?})", code));
                        logs.emit_status(format!(
                            "instance {} crashed: exited with status {:?}",
                            id, code
                        ));
                    }
                }
                InstanceEvent::ForcedKillTimedOut { id } => {
                    slot.state = InstanceState::Crashed;
                    slot.clear_process();
                    slot.last_error = Some("process survived forced kill".to_string());
                    logs.emit_status(format!("instance {} crashed: unkillable process", id));
                }
            }
            if before != slot.state {
                tracing::debug!(id = %event_id, from = %before, to = %slot.state, "state transition");
            }
        }
    }
}

fn snapshot_of(id: &str, slot: &Slot) -> InstanceSnapshot {
    InstanceSnapshot {
        id: id.to_string(),
        config: slot.config.clone(),
        state: slot.state,
        url: slot.url.clone(),
        pid: slot.pid,
        uptime: slot.started_at.map(|t| t.elapsed()),
        last_error: slot.last_error.clone(),
    }
}
