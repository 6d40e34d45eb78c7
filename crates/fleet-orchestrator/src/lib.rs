//! Fleet Orchestrator
//!
//! Multi-instance orchestration for generative-media server processes:
//! detects compute devices, allocates each instance a dedicated port and
//! device pinning, supervises N server processes concurrently, and merges
//! their output into one subscribable feed.
//!
//! The entry point is [`registry::InstanceRegistry`]; everything else backs
//! it. Installation and model management of the wrapped server are external
//! concerns — this crate only launches and supervises it.

pub mod config;
pub mod device;
pub mod error;
pub mod logs;
pub mod ports;
pub mod registry;
pub mod supervisor;

pub use config::{FleetConfig, InstanceConfig, ServerCommand, VramMode};
pub use device::{DeviceDescriptor, DeviceRegistry, DeviceSelector, GpuInfo};
pub use error::RegistryError;
pub use logs::{LogHub, LogLine};
pub use registry::{InstanceRegistry, InstanceSnapshot, InstanceState};
pub use supervisor::{InstanceEvent, ProcessSupervisor, SupervisorHandle};
