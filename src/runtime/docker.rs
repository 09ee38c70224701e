//! Docker Engine API adapter

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::{
    errors::Error as BollardError,
    models::{ContainerCreateBody, HostConfig, PortBinding},
    query_parameters::{
        CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
        ListContainersOptionsBuilder, ListImagesOptions, RemoveContainerOptionsBuilder,
        StartContainerOptions,
    },
    Docker, API_DEFAULT_VERSION,
};
use tracing::{debug, warn};

use super::{
    ContainerFilter, ContainerRuntime, ContainerSpec, ContainerStatus, FaultKind,
    RuntimeConnector, RuntimeFault, RuntimeResult,
};

/// Client timeout applied to every request against a daemon
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// One connected Docker daemon
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    name: String,
    docker: Docker,
}

impl DockerRuntime {
    /// Build a client for `url` without contacting the daemon.
    ///
    /// Supported schemes are `unix://`, `tcp://`, `http://` and `https://`.
    /// With `tls` set, `tcp://` and `https://` endpoints are reached over TLS
    /// using the `key.pem`, `cert.pem` and `ca.pem` files in that directory.
    pub fn new(name: &str, url: &str, timeout_secs: u64, tls: Option<&Path>) -> RuntimeResult<Self> {
        let docker = if let Some(path) = url.strip_prefix("unix://") {
            Docker::connect_with_socket(path, timeout_secs, API_DEFAULT_VERSION)
                .map_err(|e| RuntimeFault::connectivity(e.to_string()))?
        } else if url.starts_with("https://") || (url.starts_with("tcp://") && tls.is_some()) {
            let cert_dir = tls.ok_or_else(|| {
                RuntimeFault::new(
                    FaultKind::Other,
                    format!("Docker endpoint '{}' needs TLS certificates (--tls-certs)", url),
                )
            })?;
            connect_tls(url, cert_dir, timeout_secs)?
        } else if url.starts_with("tcp://") || url.starts_with("http://") {
            Docker::connect_with_http(url, timeout_secs, API_DEFAULT_VERSION)
                .map_err(|e| RuntimeFault::connectivity(e.to_string()))?
        } else {
            return Err(RuntimeFault::new(
                FaultKind::Other,
                format!("unsupported Docker endpoint URL '{}'", url),
            ));
        };

        Ok(Self {
            name: name.to_string(),
            docker,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        self.docker.ping().await.map_err(classify)?;
        Ok(())
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> RuntimeResult<Vec<String>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(id) = &filter.id {
            filters.insert("id".to_string(), vec![id.clone()]);
        }
        if filter.running_only {
            filters.insert("status".to_string(), vec!["running".to_string()]);
        }

        let options = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&filters)
            .build();

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let port_key = format!("{}/tcp", spec.container_port);
        let port_bindings = HashMap::from([(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(spec.host_port.to_string()),
            }]),
        )]);

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            env: Some(
                spec.env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            labels: Some(spec.labels.clone().into_iter().collect()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                binds: if spec.binds.is_empty() {
                    None
                } else {
                    Some(spec.binds.clone())
                },
                memory: spec.limits.memory_bytes,
                cpu_quota: spec.limits.cpu_quota,
                cpu_period: spec.limits.cpu_period,
                auto_remove: Some(true),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions>, config)
            .await
            .map_err(|e| classify_create(e, &spec.image))?;

        start_or_discard(
            &created.id,
            self.docker
                .start_container(&created.id, None::<StartContainerOptions>),
            self.docker.remove_container(
                &created.id,
                Some(RemoveContainerOptionsBuilder::new().force(true).build()),
            ),
        )
        .await?;

        debug!(endpoint = %self.name, id = %created.id, image = %spec.image, "container started");
        Ok(created.id)
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerStatus> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;

        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        let host_ports = info
            .network_settings
            .and_then(|n| n.ports)
            .map(|ports| {
                ports
                    .into_values()
                    .flatten()
                    .flatten()
                    .filter_map(|binding| binding.host_port)
                    .filter_map(|port| port.parse::<u16>().ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(ContainerStatus {
            id: info.id.unwrap_or_else(|| id.to_string()),
            running,
            host_ports,
        })
    }

    async fn kill_container(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .kill_container(id, None::<KillContainerOptions>)
            .await
            .map_err(classify_kill)
    }

    async fn list_images(&self) -> RuntimeResult<Vec<String>> {
        let images = self
            .docker
            .list_images(None::<ListImagesOptions>)
            .await
            .map_err(classify)?;

        Ok(images
            .into_iter()
            .filter_map(|image| image.repo_tags.into_iter().next())
            .filter(|tag| tag != "<none>:<none>")
            .collect())
    }
}

#[cfg(feature = "tls")]
fn connect_tls(url: &str, cert_dir: &Path, timeout_secs: u64) -> RuntimeResult<Docker> {
    Docker::connect_with_ssl(
        url,
        &cert_dir.join("key.pem"),
        &cert_dir.join("cert.pem"),
        &cert_dir.join("ca.pem"),
        timeout_secs,
        API_DEFAULT_VERSION,
    )
    .map_err(|e| RuntimeFault::connectivity(e.to_string()))
}

#[cfg(not(feature = "tls"))]
fn connect_tls(url: &str, _cert_dir: &Path, _timeout_secs: u64) -> RuntimeResult<Docker> {
    Err(RuntimeFault::new(
        FaultKind::Other,
        format!(
            "cannot reach '{}' over TLS: berth was built without the `tls` feature",
            url
        ),
    ))
}

/// Start a freshly created container, force-removing it when the start
/// fails so no stopped container is left behind
async fn start_or_discard<S, D>(id: &str, start: S, discard: D) -> RuntimeResult<()>
where
    S: Future<Output = Result<(), BollardError>>,
    D: Future<Output = Result<(), BollardError>>,
{
    let Err(err) = start.await else {
        return Ok(());
    };
    let fault = classify(err);
    if let Err(e) = discard.await {
        warn!(id, error = %e, "could not remove container that failed to start");
    }
    Err(fault)
}

/// Connects to Docker daemons and verifies them with a ping
#[derive(Debug, Clone)]
pub struct DockerConnector {
    timeout_secs: u64,
    /// Directory holding `key.pem`, `cert.pem` and `ca.pem`
    tls: Option<PathBuf>,
}

impl DockerConnector {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout_secs,
            tls: None,
        }
    }

    pub fn with_tls(mut self, cert_dir: impl Into<PathBuf>) -> Self {
        self.tls = Some(cert_dir.into());
        self
    }
}

impl Default for DockerConnector {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_SECS)
    }
}

#[async_trait]
impl RuntimeConnector for DockerConnector {
    async fn connect(&self, name: &str, url: &str) -> RuntimeResult<Arc<dyn ContainerRuntime>> {
        let runtime = DockerRuntime::new(name, url, self.timeout_secs, self.tls.as_deref())?;
        runtime.ping().await?;
        Ok(Arc::new(runtime))
    }
}

fn classify(err: BollardError) -> RuntimeFault {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeFault::not_found(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeFault::new(
            FaultKind::Other,
            format!("Docker returned {}: {}", status_code, message),
        ),
        BollardError::RequestTimeoutError | BollardError::IOError { .. } => {
            RuntimeFault::connectivity(err.to_string())
        }
        other => {
            let message = other.to_string();
            if looks_like_connectivity(&message) {
                RuntimeFault::connectivity(message)
            } else {
                RuntimeFault::new(FaultKind::Other, message)
            }
        }
    }
}

fn classify_create(err: BollardError, image: &str) -> RuntimeFault {
    match &err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeFault::new(
            FaultKind::ImageNotFound,
            format!("image '{}' not found", image),
        ),
        _ => classify(err),
    }
}

/// A kill on a container that already stopped answers 409
fn classify_kill(err: BollardError) -> RuntimeFault {
    match &err {
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } if message.contains("is not running") => RuntimeFault::not_found(message.clone()),
        _ => classify(err),
    }
}

fn looks_like_connectivity(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["connection refused", "connection reset", "broken pipe", "timed out", "error trying to connect"]
        .iter()
        .any(|needle| lower.contains(needle))
}
