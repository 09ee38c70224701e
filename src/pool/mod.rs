//! Runtime endpoint pool
//!
//! Holds one connected handle per configured endpoint. The registry is
//! rebuilt in full on every initialization and swapped in at once, so
//! readers see either the previous pool or the complete new one. A failed
//! initialization leaves the pool disconnected rather than half connected.

mod hostname;

pub use hostname::display_hostname;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::error::{BerthError, Result};
use crate::runtime::{ContainerRuntime, RuntimeConnector};

/// A connected runtime endpoint
#[derive(Clone)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    client: Arc<dyn ContainerRuntime>,
}

impl Endpoint {
    pub fn client(&self) -> Arc<dyn ContainerRuntime> {
        self.client.clone()
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("url", &self.url)
            .finish()
    }
}

type Registry = BTreeMap<String, Endpoint>;

type ConnectHook = Arc<dyn Fn() + Send + Sync>;

pub struct EndpointPool {
    connector: Arc<dyn RuntimeConnector>,
    registry: RwLock<Option<Arc<Registry>>>,
    /// Endpoint map of the last initialization, reused by `reconnect`
    servers: RwLock<BTreeMap<String, String>>,
    init_lock: AsyncMutex<()>,
    /// Called after every initialization that connects at least one endpoint
    on_connect: RwLock<Option<ConnectHook>>,
}

impl EndpointPool {
    pub fn new(connector: Arc<dyn RuntimeConnector>) -> Self {
        Self {
            connector,
            registry: RwLock::new(None),
            servers: RwLock::new(BTreeMap::new()),
            init_lock: AsyncMutex::new(()),
            on_connect: RwLock::new(None),
        }
    }

    /// Connect to every endpoint in `servers` and ping it.
    ///
    /// Fails on the first endpoint that cannot be reached, leaving the pool
    /// disconnected. An empty map leaves the pool disconnected without error.
    pub async fn initialize(&self, servers: &BTreeMap<String, String>) -> Result<()> {
        let _init = self.init_lock.lock().await;
        *self.servers.write() = servers.clone();

        if servers.is_empty() {
            *self.registry.write() = None;
            info!("no Docker endpoints configured");
            return Ok(());
        }

        let mut registry = Registry::new();
        for (name, url) in servers {
            info!(endpoint = %name, url = %url, "connecting to Docker endpoint");
            match self.connector.connect(name, url).await {
                Ok(client) => {
                    info!(endpoint = %name, "connected to Docker endpoint");
                    registry.insert(
                        name.clone(),
                        Endpoint {
                            name: name.clone(),
                            url: url.clone(),
                            client,
                        },
                    );
                }
                Err(fault) => {
                    warn!(endpoint = %name, url = %url, error = %fault, "Docker endpoint unreachable");
                    *self.registry.write() = None;
                    return Err(BerthError::connection(name.clone(), fault.message));
                }
            }
        }

        *self.registry.write() = Some(Arc::new(registry));

        let hook = self.on_connect.read().clone();
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    /// Replace the hook run after each successful initialization,
    /// including ones triggered by `reconnect`
    pub fn on_connect(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_connect.write() = Some(Arc::new(hook));
    }

    /// Re-run the last initialization
    pub async fn reconnect(&self) -> Result<()> {
        let servers = self.servers.read().clone();
        self.initialize(&servers).await
    }

    /// Drop every connection
    pub fn disconnect(&self) {
        *self.registry.write() = None;
    }

    fn snapshot(&self) -> Option<Arc<Registry>> {
        self.registry.read().clone()
    }

    /// Ping every endpoint; false when never initialized or any ping fails
    pub async fn is_connected(&self) -> bool {
        let Some(registry) = self.snapshot() else {
            return false;
        };
        for endpoint in registry.values() {
            if let Err(fault) = endpoint.client.ping().await {
                warn!(endpoint = %endpoint.name, error = %fault, "ping failed");
                return false;
            }
        }
        true
    }

    /// Names of the connected endpoints, sorted
    pub fn endpoint_names(&self) -> Vec<String> {
        self.snapshot()
            .map(|registry| registry.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Look up one endpoint
    pub fn endpoint(&self, name: &str) -> Result<Endpoint> {
        let registry = self
            .snapshot()
            .ok_or_else(|| BerthError::connection(name, "Docker is not connected"))?;
        registry.get(name).cloned().ok_or_else(|| {
            BerthError::NotFound(format!("Docker endpoint '{}' is not configured", name))
        })
    }
}

impl std::fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointPool")
            .field("endpoints", &self.endpoint_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MemoryConnector;

    fn servers(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_initialize() {
        let pool = EndpointPool::new(Arc::new(MemoryConnector::new()));
        assert!(!pool.is_connected().await);

        pool.initialize(&servers(&[("main", "tcp://host1:2376"), ("aux", "tcp://host2:2376")]))
            .await
            .unwrap();
        assert!(pool.is_connected().await);
        assert_eq!(pool.endpoint_names(), vec!["aux", "main"]);
        assert_eq!(pool.endpoint("main").unwrap().url, "tcp://host1:2376");
    }

    #[tokio::test]
    async fn test_partial_failure_disconnects_everything() {
        let connector = Arc::new(MemoryConnector::new());
        connector.set_refused("aux", true);
        let pool = EndpointPool::new(connector.clone());

        let err = pool
            .initialize(&servers(&[("main", "tcp://host1:2376"), ("aux", "tcp://host2:2376")]))
            .await
            .unwrap_err();
        match err {
            BerthError::Connection { endpoint, .. } => assert_eq!(endpoint, "aux"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(pool.endpoint_names().is_empty());
        assert!(!pool.is_connected().await);
        assert!(matches!(pool.endpoint("main"), Err(BerthError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_reconnect_uses_last_settings() {
        let connector = Arc::new(MemoryConnector::new());
        connector.set_refused("main", true);
        let pool = EndpointPool::new(connector.clone());
        assert!(pool.initialize(&servers(&[("main", "tcp://host1:2376")])).await.is_err());

        connector.set_refused("main", false);
        pool.reconnect().await.unwrap();
        assert_eq!(pool.endpoint_names(), vec!["main"]);
    }

    #[tokio::test]
    async fn test_connect_hook_runs_only_on_success() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let connector = Arc::new(MemoryConnector::new());
        connector.set_refused("main", true);
        let pool = EndpointPool::new(connector.clone());
        let connects = Arc::new(AtomicUsize::new(0));
        let counter = connects.clone();
        pool.on_connect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(pool.initialize(&servers(&[("main", "tcp://host1:2376")])).await.is_err());
        assert_eq!(connects.load(Ordering::SeqCst), 0);

        pool.initialize(&BTreeMap::new()).await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 0);

        pool.initialize(&servers(&[("main", "tcp://host1:2376")])).await.ok();
        assert_eq!(connects.load(Ordering::SeqCst), 0);

        connector.set_refused("main", false);
        pool.reconnect().await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let pool = EndpointPool::new(Arc::new(MemoryConnector::new()));
        pool.initialize(&servers(&[("main", "tcp://host1:2376")])).await.unwrap();
        assert!(matches!(pool.endpoint("gpu"), Err(BerthError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_ping_failure_reports_disconnected() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = EndpointPool::new(connector.clone());
        pool.initialize(&servers(&[("main", "tcp://host1:2376")])).await.unwrap();

        connector.runtime("main").set_reachable(false);
        assert!(!pool.is_connected().await);
        // Names stay listed until the pool is rebuilt
        assert_eq!(pool.endpoint_names(), vec!["main"]);
    }

    #[tokio::test]
    async fn test_empty_settings() {
        let pool = EndpointPool::new(Arc::new(MemoryConnector::new()));
        pool.initialize(&BTreeMap::new()).await.unwrap();
        assert!(!pool.is_connected().await);
    }
}
