//! In-process container runtime
//!
//! Keeps containers in a map instead of talking to a daemon. Used by the
//! test-suite and by `--dry-run`, where it also lets tests script failures:
//! unreachable endpoints, containers that die, creations that never publish
//! a port.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ContainerFilter, ContainerRuntime, ContainerSpec, ContainerStatus, FaultKind,
    RuntimeConnector, RuntimeFault, RuntimeResult,
};

#[derive(Debug, Clone)]
struct MemoryContainer {
    spec: ContainerSpec,
    running: bool,
    publish_port: bool,
}

/// A fake endpoint holding its containers in memory
#[derive(Debug)]
pub struct MemoryRuntime {
    name: String,
    containers: Mutex<HashMap<String, MemoryContainer>>,
    images: Mutex<BTreeSet<String>>,
    reachable: AtomicBool,
    publish_ports: AtomicBool,
    next_id: AtomicUsize,
    calls: AtomicUsize,
    creates: AtomicUsize,
}

impl MemoryRuntime {
    /// A reachable endpoint that accepts any image
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            containers: Mutex::new(HashMap::new()),
            images: Mutex::new(BTreeSet::new()),
            reachable: AtomicBool::new(true),
            publish_ports: AtomicBool::new(true),
            next_id: AtomicUsize::new(1),
            calls: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Restrict creation to the given images
    pub fn with_images<I, S>(self, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.images.lock().extend(images.into_iter().map(Into::into));
        self
    }

    /// Simulate the daemon going away or coming back
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// When disabled, new containers start without a published port
    pub fn set_publish_ports(&self, publish: bool) {
        self.publish_ports.store(publish, Ordering::SeqCst);
    }

    /// Simulate a container exiting on its own
    pub fn stop(&self, id: &str) {
        if let Some(container) = self.containers.lock().get_mut(id) {
            container.running = false;
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.containers
            .lock()
            .get(id)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn spec(&self, id: &str) -> Option<ContainerSpec> {
        self.containers.lock().get(id).map(|c| c.spec.clone())
    }

    pub fn running_count(&self) -> usize {
        self.containers.lock().values().filter(|c| c.running).count()
    }

    /// Number of RPCs received, pings included
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    fn enter(&self) -> RuntimeResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RuntimeFault::connectivity(format!(
                "connection to '{}' refused",
                self.name
            )))
        }
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        self.enter()
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> RuntimeResult<Vec<String>> {
        self.enter()?;
        let containers = self.containers.lock();
        let mut ids: Vec<String> = containers
            .iter()
            .filter(|(id, _)| filter.id.as_ref().map_or(true, |want| want == *id))
            .filter(|(_, c)| !filter.running_only || c.running)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.enter()?;
        {
            let images = self.images.lock();
            if !images.is_empty() && !images.contains(&spec.image) {
                return Err(RuntimeFault::new(
                    FaultKind::ImageNotFound,
                    format!("image '{}' not found", spec.image),
                ));
            }
        }

        let mut containers = self.containers.lock();
        let taken = containers
            .values()
            .any(|c| c.running && c.spec.host_port == spec.host_port);
        if taken {
            return Err(RuntimeFault::new(
                FaultKind::Other,
                format!("port {} is already allocated", spec.host_port),
            ));
        }

        let id = format!(
            "{}-{:06}",
            self.name,
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        containers.insert(
            id.clone(),
            MemoryContainer {
                spec: spec.clone(),
                running: true,
                publish_port: self.publish_ports.load(Ordering::SeqCst),
            },
        );
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerStatus> {
        self.enter()?;
        let containers = self.containers.lock();
        let container = containers
            .get(id)
            .ok_or_else(|| RuntimeFault::not_found(format!("No such container: {}", id)))?;

        Ok(ContainerStatus {
            id: id.to_string(),
            running: container.running,
            host_ports: if container.publish_port {
                vec![container.spec.host_port]
            } else {
                Vec::new()
            },
        })
    }

    async fn kill_container(&self, id: &str) -> RuntimeResult<()> {
        self.enter()?;
        // Containers are auto-removed once they stop
        match self.containers.lock().remove(id) {
            Some(c) if c.running => Ok(()),
            Some(_) => Err(RuntimeFault::not_found(format!("Container {} is not running", id))),
            None => Err(RuntimeFault::not_found(format!("No such container: {}", id))),
        }
    }

    async fn list_images(&self) -> RuntimeResult<Vec<String>> {
        self.enter()?;
        Ok(self.images.lock().iter().cloned().collect())
    }
}

/// Hands out one shared [`MemoryRuntime`] per endpoint name, so state
/// survives reconnects
#[derive(Debug, Default)]
pub struct MemoryConnector {
    runtimes: Mutex<HashMap<String, Arc<MemoryRuntime>>>,
    refused: Mutex<BTreeSet<String>>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pre-built runtime under `name`
    pub fn insert(&self, runtime: MemoryRuntime) -> Arc<MemoryRuntime> {
        let runtime = Arc::new(runtime);
        self.runtimes
            .lock()
            .insert(runtime.name().to_string(), runtime.clone());
        runtime
    }

    /// The runtime behind `name`, created on first use
    pub fn runtime(&self, name: &str) -> Arc<MemoryRuntime> {
        self.runtimes
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryRuntime::new(name)))
            .clone()
    }

    /// Make every future connection to `name` fail, or succeed again
    pub fn set_refused(&self, name: &str, refused: bool) {
        let mut set = self.refused.lock();
        if refused {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeConnector for MemoryConnector {
    async fn connect(&self, name: &str, _url: &str) -> RuntimeResult<Arc<dyn ContainerRuntime>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refused.lock().contains(name) {
            return Err(RuntimeFault::connectivity(format!(
                "connection to '{}' refused",
                name
            )));
        }
        let runtime = self.runtime(name);
        runtime.ping().await?;
        Ok(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ResourceLimits;
    use std::collections::BTreeMap;

    fn spec(image: &str, host_port: u16) -> ContainerSpec {
        ContainerSpec {
            image: image.to_string(),
            container_port: 9000,
            host_port,
            command: None,
            env: BTreeMap::new(),
            labels: BTreeMap::from([("berth.challenge".to_string(), "1".to_string())]),
            limits: ResourceLimits::default(),
            binds: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_create_inspect_kill() {
        let runtime = MemoryRuntime::new("main");
        let id = runtime.create_container(&spec("ctf/pwn:1", 9100)).await.unwrap();

        let status = runtime.inspect_container(&id).await.unwrap();
        assert!(status.running);
        assert_eq!(status.host_ports, vec![9100]);

        runtime.kill_container(&id).await.unwrap();
        let err = runtime.kill_container(&id).await.unwrap_err();
        assert_eq!(err.kind, FaultKind::NotFound);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let runtime = MemoryRuntime::new("main");
        let a = runtime.create_container(&spec("img", 9100)).await.unwrap();
        let b = runtime.create_container(&spec("img", 9101)).await.unwrap();
        runtime.stop(&b);

        assert_eq!(runtime.list_containers(&ContainerFilter::running(&a)).await.unwrap(), vec![a.clone()]);
        assert!(runtime.list_containers(&ContainerFilter::running(&b)).await.unwrap().is_empty());
        assert_eq!(runtime.list_containers(&ContainerFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_kill_stopped_container_is_not_found() {
        let runtime = MemoryRuntime::new("main");
        let id = runtime.create_container(&spec("img", 9100)).await.unwrap();
        runtime.stop(&id);

        let err = runtime.kill_container(&id).await.unwrap_err();
        assert_eq!(err.kind, FaultKind::NotFound);
        assert!(err.message.contains("is not running"));
    }

    #[tokio::test]
    async fn test_unknown_image() {
        let runtime = MemoryRuntime::new("main").with_images(["ctf/web:2"]);
        let err = runtime.create_container(&spec("ctf/pwn:1", 9100)).await.unwrap_err();
        assert_eq!(err.kind, FaultKind::ImageNotFound);
    }

    #[tokio::test]
    async fn test_port_collision() {
        let runtime = MemoryRuntime::new("main");
        runtime.create_container(&spec("img", 9100)).await.unwrap();
        assert!(runtime.create_container(&spec("img", 9100)).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable() {
        let runtime = MemoryRuntime::new("main");
        runtime.set_reachable(false);
        assert!(runtime.ping().await.unwrap_err().is_connectivity());
        runtime.set_reachable(true);
        assert!(runtime.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_connector_refusal() {
        let connector = MemoryConnector::new();
        assert!(connector.connect("main", "mem://main").await.is_ok());
        connector.set_refused("main", true);
        assert!(connector.connect("main", "mem://main").await.is_err());
        assert_eq!(connector.connect_count(), 2);
    }
}
