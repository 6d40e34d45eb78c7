//! Device Detection Module
//!
//! Enumerates NVIDIA GPUs via `nvidia-smi` and produces immutable device
//! descriptors. Detection fails soft: if the tool is absent or errors, the
//! caller gets the CPU-fallback descriptor alone, never an error.

use std::fmt;
use std::process::Command;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Device an instance is pinned to: a GPU index or the CPU fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSelector {
    Cpu,
    Gpu(u32),
}

impl DeviceSelector {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu)
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Self::Gpu(_))
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu(index) => write!(f, "{}", index),
        }
    }
}

impl FromStr for DeviceSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("cpu") {
            return Ok(Self::Cpu);
        }
        s.parse::<u32>()
            .map(Self::Gpu)
            .map_err(|_| format!("invalid device selector: {:?} (expected \"cpu\" or a GPU index)", s))
    }
}

/// Raw information about a single NVIDIA GPU, as reported by `nvidia-smi`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_free_mb: u64,
    pub uuid: String,
}

impl fmt::Display for GpuInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GPU {}: {} ({} MB total, {} MB free)",
            self.index, self.name, self.memory_total_mb, self.memory_free_mb
        )
    }
}

/// Immutable descriptor for one compute device. A full set is produced per
/// detection cycle; re-detection replaces the whole set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub selector: DeviceSelector,
    pub label: String,
    pub memory_total_mb: u64,
}

impl DeviceDescriptor {
    fn cpu() -> Self {
        Self {
            selector: DeviceSelector::Cpu,
            label: "CPU (no GPU)".to_string(),
            memory_total_mb: 0,
        }
    }
}

impl From<&GpuInfo> for DeviceDescriptor {
    fn from(gpu: &GpuInfo) -> Self {
        Self {
            selector: DeviceSelector::Gpu(gpu.index),
            label: format!("GPU {}: {} ({} MB)", gpu.index, gpu.name, gpu.memory_total_mb),
            memory_total_mb: gpu.memory_total_mb,
        }
    }
}

/// Detects and enumerates compute devices using `nvidia-smi`.
pub struct DeviceRegistry;

impl DeviceRegistry {
    const QUERY_ARGS: [&'static str; 2] = [
        "--query-gpu=index,name,memory.total,memory.free,uuid",
        "--format=csv,noheader,nounits",
    ];

    /// Detect all NVIDIA GPUs. Returns an empty list if `nvidia-smi` is
    /// unavailable or fails.
    pub fn detect_gpus() -> Vec<GpuInfo> {
        let output = match Command::new("nvidia-smi").args(Self::QUERY_ARGS).output() {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!("nvidia-smi not available: {}", e);
                return Vec::new();
            }
        };

        if !output.status.success() {
            tracing::debug!("nvidia-smi exited with {}", output.status);
            return Vec::new();
        }

        parse_smi_csv(&String::from_utf8_lossy(&output.stdout))
    }

    /// Produce the full device snapshot: the CPU fallback first, then one
    /// descriptor per detected GPU.
    pub fn detect() -> Vec<DeviceDescriptor> {
        let mut devices = vec![DeviceDescriptor::cpu()];
        for gpu in Self::detect_gpus() {
            devices.push(DeviceDescriptor::from(&gpu));
        }
        devices
    }

    /// Quick check whether `nvidia-smi` is present and working.
    pub fn is_nvidia_available() -> bool {
        Command::new("nvidia-smi")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Find the display label for a selector in a detection snapshot.
    /// Falls back to a synthetic label for GPUs that are not (or no longer)
    /// present.
    pub fn label_for(devices: &[DeviceDescriptor], selector: DeviceSelector) -> String {
        devices
            .iter()
            .find(|d| d.selector == selector)
            .map(|d| d.label.clone())
            .unwrap_or_else(|| match selector {
                DeviceSelector::Cpu => "CPU (no GPU)".to_string(),
                DeviceSelector::Gpu(index) => format!("GPU {}", index),
            })
    }
}

/// Parse `nvidia-smi --format=csv,noheader,nounits` output. Malformed lines
/// are skipped rather than failing the whole detection.
fn parse_smi_csv(stdout: &str) -> Vec<GpuInfo> {
    let mut gpus = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 5 {
            continue;
        }
        let (index, total, free) = match (
            parts[0].parse::<u32>(),
            parts[2].parse::<u64>(),
            parts[3].parse::<u64>(),
        ) {
            (Ok(i), Ok(t), Ok(f)) => (i, t, f),
            _ => continue,
        };
        gpus.push(GpuInfo {
            index,
            name: parts[1].to_string(),
            memory_total_mb: total,
            memory_free_mb: free,
            uuid: parts[4].to_string(),
        });
    }
    gpus
}
