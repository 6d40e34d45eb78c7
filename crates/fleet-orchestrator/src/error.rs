//! Registry Error Types
//!
//! Synchronous errors returned by registry operations. Supervisor-level
//! failures (spawn errors, probe timeouts, unexpected exits) are delivered
//! asynchronously as events and reflected in instance state instead.

use thiserror::Error;

use crate::registry::InstanceState;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("port {port} already in use by instance {instance_id}")]
    DuplicatePort { port: u16, instance_id: String },

    #[error("instance {0} not found")]
    NotFound(String),

    #[error("instance {id} is {state}, expected {expected}")]
    InvalidState {
        id: String,
        state: InstanceState,
        expected: &'static str,
    },

    #[error("port {0} out of range (must be 1024-65535)")]
    InvalidPort(u16),

    #[error("maximum of {0} instances reached")]
    TooManyInstances(usize),

    #[error("no free port in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },
}

pub type Result<T> = std::result::Result<T, RegistryError>;
