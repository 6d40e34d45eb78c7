//! Fleet Configuration
//!
//! Orchestrator-wide settings, per-instance configuration, and persistence
//! of the instance list.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::device::DeviceSelector;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8188;
pub const PORT_RANGE_START: u16 = 8188;
pub const PORT_RANGE_END: u16 = 8199;
pub const MAX_INSTANCES: usize = 8;

/// Memory-usage policy passed to the spawned server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VramMode {
    #[default]
    Normal,
    Low,
    #[serde(rename = "none")]
    NoVram,
    Cpu,
}

impl VramMode {
    /// Launch flags this mode adds to the server command line.
    pub fn args(&self) -> &'static [&'static str] {
        match self {
            Self::Normal => &[],
            Self::Low => &["--lowvram"],
            Self::NoVram => &["--novram"],
            Self::Cpu => &["--cpu"],
        }
    }
}

impl fmt::Display for VramMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::Low => "low",
            Self::NoVram => "none",
            Self::Cpu => "cpu",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for VramMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            "none" => Ok(Self::NoVram),
            "cpu" => Ok(Self::Cpu),
            _ => Err(format!(
                "invalid vram mode: {:?} (choose from normal, low, none, cpu)",
                s
            )),
        }
    }
}

/// The spawnable server binary: program, leading arguments, and working
/// directory. An external collaborator; the orchestrator only launches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl ServerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Configuration for a single server instance. Mutable only while the
/// instance is not running; immutable once started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub device: DeviceSelector,
    pub device_label: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub vram_mode: VramMode,
    #[serde(default)]
    pub extra_flags: Vec<String>,
}

impl InstanceConfig {
    pub fn new(device: DeviceSelector, device_label: impl Into<String>, port: u16) -> Self {
        Self {
            device,
            device_label: device_label.into(),
            host: DEFAULT_HOST.to_string(),
            port,
            vram_mode: VramMode::Normal,
            extra_flags: Vec::new(),
        }
    }

    pub fn with_vram_mode(mut self, mode: VramMode) -> Self {
        self.vram_mode = mode;
        self
    }

    pub fn with_extra_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_flags = flags.into_iter().map(Into::into).collect();
        self
    }

    /// Stable identifier, a pure function of (device, port).
    pub fn id(&self) -> String {
        match self.device {
            DeviceSelector::Cpu => format!("cpu_{}", self.port),
            DeviceSelector::Gpu(index) => format!("gpu{}_{}", index, self.port),
        }
    }

    /// Prefix used to tag this instance's output lines.
    pub fn log_prefix(&self) -> String {
        match self.device {
            DeviceSelector::Cpu => format!("[CPU:{}]", self.port),
            DeviceSelector::Gpu(index) => format!("[GPU{}:{}]", index, self.port),
        }
    }

    /// URL the server is reachable at once running.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Command-line arguments appended to the server command.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "--listen".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
        ];
        args.extend(self.vram_mode.args().iter().map(|s| s.to_string()));
        args.extend(self.extra_flags.iter().cloned());
        args
    }

    /// Environment for the spawned process. Pins GPU instances to their
    /// device via CUDA_VISIBLE_DEVICES; an empty value hides all GPUs for
    /// CPU instances.
    pub fn env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        let visible = match self.device {
            DeviceSelector::Cpu => String::new(),
            DeviceSelector::Gpu(index) => index.to_string(),
        };
        env.insert("CUDA_VISIBLE_DEVICES".to_string(), visible);
        env
    }
}

/// Orchestrator-wide configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Host instances listen on.
    pub host: String,

    /// The server binary to spawn for each instance.
    pub server: ServerCommand,

    /// Inclusive port range instances are allocated from.
    pub port_range_start: u16,
    pub port_range_end: u16,

    /// Hard cap on registered instances.
    pub max_instances: usize,

    /// How long to wait for a started server to accept connections.
    pub probe_timeout: Duration,

    /// Delay between health-probe attempts.
    pub probe_interval: Duration,

    /// Wait after a graceful stop request before force-killing.
    pub grace_period: Duration,

    /// Wait after a force-kill before declaring the process unkillable.
    pub kill_timeout: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            server: ServerCommand::new("python").with_args(["main.py"]),
            port_range_start: PORT_RANGE_START,
            port_range_end: PORT_RANGE_END,
            max_instances: MAX_INSTANCES,
            probe_timeout: Duration::from_secs(120),
            probe_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
        }
    }
}

impl FleetConfig {
    pub fn new(server: ServerCommand) -> Self {
        Self {
            server,
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range_start = start;
        self.port_range_end = end;
        self
    }

    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }
}

/// Write the instance list as pretty-printed JSON.
pub fn save_instances(path: &Path, configs: &[InstanceConfig]) -> Result<()> {
    let json = serde_json::to_string_pretty(configs)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, json).with_context(|| format!("writing instance list to {}", path.display()))
}

/// Load a persisted instance list. Missing or corrupt files load as empty;
/// instances always come back in `Stopped` state, never with process state.
pub fn load_instances(path: &Path) -> Vec<InstanceConfig> {
    let Ok(data) = fs::read_to_string(path) else {
        return Vec::new();
    };
    match serde_json::from_str(&data) {
        Ok(configs) => configs,
        Err(e) => {
            tracing::warn!("ignoring corrupt instance list {}: {}", path.display(), e);
            Vec::new()
        }
    }
}
