//! Container runtime interface
//!
//! The manager treats each container runtime as an opaque RPC surface. The
//! [`ContainerRuntime`] trait is that surface; [`RuntimeConnector`] turns an
//! endpoint URL into a live handle. The Docker adapter talks to real daemons,
//! the memory adapter backs tests and dry runs.

mod docker;
mod memory;

pub use docker::{DockerConnector, DockerRuntime, DEFAULT_TIMEOUT_SECS};
pub use memory::{MemoryConnector, MemoryRuntime};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{BerthError, Result};

/// Broad class of a runtime failure, used to decide between reconnecting
/// and surfacing the error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The endpoint could not be reached (refused, reset, timed out)
    Connectivity,
    /// The referenced container does not exist
    NotFound,
    /// The requested image is not present on the endpoint
    ImageNotFound,
    Other,
}

#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct RuntimeFault {
    pub kind: FaultKind,
    pub message: String,
}

impl RuntimeFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Connectivity, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FaultKind::NotFound, message)
    }

    pub fn is_connectivity(&self) -> bool {
        self.kind == FaultKind::Connectivity
    }
}

impl From<RuntimeFault> for BerthError {
    fn from(fault: RuntimeFault) -> Self {
        match fault.kind {
            FaultKind::Connectivity => BerthError::ConnectionLost,
            FaultKind::NotFound => BerthError::NotFound(fault.message),
            FaultKind::ImageNotFound => BerthError::Runtime("Docker image not found".to_string()),
            FaultKind::Other => BerthError::Runtime(fault.message),
        }
    }
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeFault>;

/// Resource constraints applied to a new container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<i64>,
}

/// One entry of a volume mapping: `{"/host/path": {"bind": "/in/container", "mode": "ro"}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub bind: String,
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_mode() -> String {
    "rw".to_string()
}

/// Parse a challenge's volume mapping into Docker bind strings.
///
/// An empty specification means no volumes.
pub fn parse_volumes(spec: &str) -> Result<Vec<String>> {
    if spec.trim().is_empty() {
        return Ok(Vec::new());
    }

    let volumes: BTreeMap<String, VolumeBinding> = serde_json::from_str(spec).map_err(|_| {
        BerthError::InvalidConfiguration("Volumes JSON string is invalid".to_string())
    })?;

    Ok(volumes
        .into_iter()
        .map(|(host, binding)| format!("{}:{}:{}", host, binding.bind, binding.mode))
        .collect())
}

/// Everything needed to create and start one workload container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    /// Port the workload listens on inside the container
    pub container_port: u16,
    /// Host port published for `container_port`
    pub host_port: u16,
    pub command: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub limits: ResourceLimits,
    /// Docker bind strings (`host:container:mode`)
    pub binds: Vec<String>,
}

/// Filter for [`ContainerRuntime::list_containers`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    pub id: Option<String>,
    pub running_only: bool,
}

impl ContainerFilter {
    /// Matches the container with this id, only while it is running
    pub fn running(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            running_only: true,
            ..Default::default()
        }
    }
}

/// What the runtime reports about one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub id: String,
    pub running: bool,
    /// Published host ports, in no particular order
    pub host_ports: Vec<u16>,
}

/// RPC surface of one container runtime endpoint
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> RuntimeResult<()>;

    /// Ids of the containers matching `filter`
    async fn list_containers(&self, filter: &ContainerFilter) -> RuntimeResult<Vec<String>>;

    /// Create and start a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerStatus>;

    async fn kill_container(&self, id: &str) -> RuntimeResult<()>;

    /// First tag of every tagged image
    async fn list_images(&self) -> RuntimeResult<Vec<String>>;
}

/// Establishes connections to named endpoints
#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    async fn connect(&self, name: &str, url: &str) -> RuntimeResult<Arc<dyn ContainerRuntime>>;
}
