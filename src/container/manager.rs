//! Container lifecycle engine
//!
//! The ContainerManager creates, looks up, renews and stops challenge
//! containers on behalf of users or teams. It owns the endpoint pool and the
//! expiration sweeper, and keeps the tracked-container store consistent with
//! what the runtimes actually report.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use super::locks::{SubjectLocks, SubjectScope};
use super::types::{ConnectionInfo, RequestStatus, RunningContainer, RunningOverview};
use crate::challenge::{Challenge, ChallengeCatalog};
use crate::clock::{Clock, SystemClock};
use crate::error::{BerthError, Result};
use crate::pool::{display_hostname, EndpointPool};
use crate::ports::PortAllocator;
use crate::retry;
use crate::runtime::{parse_volumes, ContainerSpec, RuntimeConnector};
use crate::settings::{self, ManagerSettings, MemorySettings, SettingsStore};
use crate::store::{ContainerStore, SubjectKey, TrackedContainer};
use crate::sweeper::{Sweeper, SweeperHandle, SWEEP_INTERVAL};

pub const LABEL_CHALLENGE: &str = "berth.challenge";
pub const LABEL_USER: &str = "berth.user";
pub const LABEL_TEAM: &str = "berth.team";

/// Orchestrates container lifecycles across the endpoint pool
pub struct ContainerManager {
    pool: Arc<EndpointPool>,
    store: Arc<dyn ContainerStore>,
    catalog: Arc<dyn ChallengeCatalog>,
    settings_store: Arc<dyn SettingsStore>,
    clock: Arc<dyn Clock>,
    ports: Arc<PortAllocator>,
    settings: RwLock<Arc<ManagerSettings>>,
    sweeper: Arc<Mutex<Option<SweeperHandle>>>,
    sweep_interval: Duration,
    locks: Arc<SubjectLocks>,
}

/// Starts the sweeper from the pool's connect hook, so a pool that comes up
/// on a later reconnect still gets its expiry task
struct SweeperLauncher {
    store: Arc<dyn ContainerStore>,
    pool: Weak<EndpointPool>,
    clock: Arc<dyn Clock>,
    locks: Arc<SubjectLocks>,
    interval: Duration,
    slot: Arc<Mutex<Option<SweeperHandle>>>,
}

impl SweeperLauncher {
    fn ensure_running(&self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().map(|h| h.is_running()).unwrap_or(false) {
            return;
        }
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let handle = Sweeper::new(self.store.clone(), pool, self.clock.clone())
            .with_locks(self.locks.clone())
            .with_interval(self.interval)
            .spawn();
        *slot = Some(handle);
    }
}

impl ContainerManager {
    /// Create an unconfigured manager; call [`initialize`](Self::initialize)
    /// to load settings and connect
    pub fn new(
        connector: Arc<dyn RuntimeConnector>,
        store: Arc<dyn ContainerStore>,
        catalog: Arc<dyn ChallengeCatalog>,
    ) -> Self {
        Self {
            pool: Arc::new(EndpointPool::new(connector)),
            store,
            catalog,
            settings_store: Arc::new(MemorySettings::new()),
            clock: Arc::new(SystemClock),
            ports: Arc::new(PortAllocator::new()),
            settings: RwLock::new(Arc::new(ManagerSettings::default())),
            sweeper: Arc::new(Mutex::new(None)),
            sweep_interval: SWEEP_INTERVAL,
            locks: Arc::new(SubjectLocks::default()),
        }
    }

    pub fn with_settings_store(mut self, settings_store: Arc<dyn SettingsStore>) -> Self {
        self.settings_store = settings_store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_port_allocator(mut self, ports: PortAllocator) -> Self {
        self.ports = Arc::new(ports);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Current settings snapshot
    pub fn settings(&self) -> Arc<ManagerSettings> {
        self.settings.read().clone()
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.pool
    }

    /// Load settings from the settings store and (re)connect
    pub async fn initialize(&self) -> Result<()> {
        let entries = self.settings_store.load().await?;
        let settings = ManagerSettings::from_map(entries)?;
        self.apply(settings).await
    }

    /// Swap in new settings: stop the sweeper and rebuild the pool. The
    /// sweeper starts whenever the pool connects, here or on a later
    /// reconnect, as long as expiry is enabled.
    pub async fn apply(&self, settings: ManagerSettings) -> Result<()> {
        self.stop_sweeper();

        let settings = Arc::new(settings);
        *self.settings.write() = settings.clone();

        if settings.is_configured() && settings.expiry_enabled() {
            let launcher = SweeperLauncher {
                store: self.store.clone(),
                pool: Arc::downgrade(&self.pool),
                clock: self.clock.clone(),
                locks: self.locks.clone(),
                interval: self.sweep_interval,
                slot: self.sweeper.clone(),
            };
            self.pool.on_connect(move || launcher.ensure_running());
        } else {
            self.pool.on_connect(|| {});
            info!("automatic container expiry disabled");
        }

        self.pool.initialize(&settings.servers).await
    }

    /// Validate and persist an admin settings update, then re-initialize
    pub async fn update_settings(&self, blob: &HashMap<String, String>) -> Result<()> {
        let normalized = settings::validate_update(blob)?;
        self.settings_store.save(&normalized).await?;
        info!(keys = normalized.len(), "settings updated");
        self.initialize().await
    }

    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .map(|h| h.is_running())
            .unwrap_or(false)
    }

    fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.stop();
            info!("expiration sweeper stopped");
        }
    }

    /// Stop the sweeper and drop every connection
    pub fn shutdown(&self) {
        self.pool.on_connect(|| {});
        self.stop_sweeper();
        self.pool.disconnect();
    }

    async fn challenge(&self, challenge_id: u64) -> Result<Challenge> {
        self.catalog
            .challenge(challenge_id)
            .await?
            .ok_or_else(|| BerthError::NotFound("Challenge not found".to_string()))
    }

    pub async fn connect_type(&self, challenge_id: u64) -> Result<String> {
        Ok(self.challenge(challenge_id).await?.connect_type)
    }

    /// Return the subject's running container for a challenge, creating one
    /// if there is none.
    pub async fn request(&self, challenge_id: u64, subject: &SubjectKey) -> Result<ConnectionInfo> {
        let challenge = self.challenge(challenge_id).await?;
        let settings = self.settings();

        if !settings.servers.contains_key(&challenge.server) {
            return Err(BerthError::NotFound(format!(
                "Challenge server '{}' is not a configured Docker endpoint",
                challenge.server
            )));
        }

        let _guard = self.locks.acquire(SubjectScope::new(challenge_id, subject)).await;

        let owned = self.store.count_owned_by(subject.owner()).await?;
        if owned >= settings.max_containers {
            info!(user = subject.owner(), owned, "container quota reached");
            return Err(BerthError::QuotaExceeded {
                limit: settings.max_containers,
            });
        }

        if let Some(existing) = self.store.find(challenge_id, subject).await? {
            if self.still_running(&existing).await? {
                return Ok(self.connection_info(
                    RequestStatus::AlreadyRunning,
                    &challenge,
                    &existing,
                    &settings,
                ));
            }
            info!(id = %existing.runtime_id, %subject, "tracked container stopped, replacing it");
            self.store.remove(&existing.runtime_id).await?;
        }

        self.create(&challenge, subject, &settings).await
    }

    /// Whether a tracked container is still up; a retired endpoint counts
    /// as stopped
    async fn still_running(&self, container: &TrackedContainer) -> Result<bool> {
        match retry::is_running(&self.pool, &container.endpoint, &container.runtime_id).await {
            Err(BerthError::NotFound(_)) => Ok(false),
            other => other,
        }
    }

    async fn create(
        &self,
        challenge: &Challenge,
        subject: &SubjectKey,
        settings: &ManagerSettings,
    ) -> Result<ConnectionInfo> {
        let limits = settings.resource_limits()?;
        let binds = parse_volumes(challenge.volumes.as_deref().unwrap_or(""))?;
        let host_port = self.ports.allocate(challenge.port)?;

        let mut env = BTreeMap::from([
            ("CHALLENGE_ID".to_string(), challenge.id.to_string()),
            ("USER_ID".to_string(), subject.owner().to_string()),
        ]);
        let mut labels = BTreeMap::from([
            (LABEL_CHALLENGE.to_string(), challenge.id.to_string()),
            (LABEL_USER.to_string(), subject.owner().to_string()),
        ]);
        if let Some(team_id) = subject.team_id() {
            env.insert("TEAM_ID".to_string(), team_id.to_string());
            labels.insert(LABEL_TEAM.to_string(), team_id.to_string());
        }

        let spec = ContainerSpec {
            image: challenge.image.clone(),
            container_port: challenge.port,
            host_port,
            command: challenge.command_args(),
            env,
            labels,
            limits,
            binds,
        };

        info!(
            challenge = challenge.id,
            %subject,
            endpoint = %challenge.server,
            host_port,
            "creating container"
        );
        let runtime_id = retry::guarded(&self.pool, &challenge.server, move |client| async move {
            client.create_container(&spec).await
        })
        .await?;

        let port = match self.published_port(&challenge.server, &runtime_id).await {
            Ok(Some(port)) => port,
            Ok(None) => {
                self.discard(&challenge.server, &runtime_id).await;
                return Err(BerthError::Runtime("Could not get port".to_string()));
            }
            Err(e) => {
                self.discard(&challenge.server, &runtime_id).await;
                return Err(e);
            }
        };

        let now = self.clock.now();
        let record = TrackedContainer {
            runtime_id,
            challenge_id: challenge.id,
            user_id: subject.owner(),
            team_id: subject.team_id(),
            endpoint: challenge.server.clone(),
            host_port: port,
            created_at: now,
            expires_at: now + settings.expiration(),
        };
        self.store.insert(record.clone()).await?;
        info!(id = %record.runtime_id, port, expires = %record.expires_at, "container created");

        Ok(self.connection_info(RequestStatus::Created, challenge, &record, settings))
    }

    async fn published_port(&self, endpoint: &str, runtime_id: &str) -> Result<Option<u16>> {
        let status = retry::guarded(&self.pool, endpoint, |client| async move {
            client.inspect_container(runtime_id).await
        })
        .await?;
        Ok(status.host_ports.first().copied())
    }

    /// Best-effort removal of a container that never became usable
    async fn discard(&self, endpoint: &str, runtime_id: &str) {
        warn!(id = runtime_id, endpoint, "discarding container without a published port");
        if let Err(e) = retry::kill(&self.pool, endpoint, runtime_id).await {
            warn!(id = runtime_id, error = %e, "could not discard container");
        }
    }

    /// Push the subject's expiry out to now plus the configured lifetime
    pub async fn renew(&self, challenge_id: u64, subject: &SubjectKey) -> Result<ConnectionInfo> {
        let challenge = self.challenge(challenge_id).await?;
        let settings = self.settings();
        let _guard = self.locks.acquire(SubjectScope::new(challenge_id, subject)).await;

        let not_found =
            || BerthError::NotFound("Container not found, try resetting the container.".to_string());
        let existing = self.store.find(challenge_id, subject).await?.ok_or_else(not_found)?;

        let expires_at = self.clock.now() + settings.expiration();
        let renewed = self
            .store
            .set_expiry(&existing.runtime_id, expires_at)
            .await?
            .ok_or_else(not_found)?;
        info!(id = %renewed.runtime_id, expires = %renewed.expires_at, "container renewed");

        Ok(self.connection_info(RequestStatus::AlreadyRunning, &challenge, &renewed, &settings))
    }

    /// Connection details of the subject's container, if it is running.
    ///
    /// A record the runtime no longer runs is dropped.
    pub async fn inspect(&self, challenge_id: u64, subject: &SubjectKey) -> Result<Option<ConnectionInfo>> {
        let challenge = self.challenge(challenge_id).await?;
        let settings = self.settings();
        let _guard = self.locks.acquire(SubjectScope::new(challenge_id, subject)).await;

        let Some(existing) = self.store.find(challenge_id, subject).await? else {
            return Ok(None);
        };

        if self.still_running(&existing).await? {
            Ok(Some(self.connection_info(
                RequestStatus::AlreadyRunning,
                &challenge,
                &existing,
                &settings,
            )))
        } else {
            info!(id = %existing.runtime_id, %subject, "tracked container stopped, untracking it");
            self.store.remove(&existing.runtime_id).await?;
            Ok(None)
        }
    }

    /// Kill a tracked container and forget it
    pub async fn stop(&self, container: &TrackedContainer) -> Result<()> {
        retry::kill(&self.pool, &container.endpoint, &container.runtime_id).await?;
        self.store.remove(&container.runtime_id).await?;
        info!(id = %container.runtime_id, "container stopped");
        Ok(())
    }

    /// Stop whatever the subject runs for a challenge
    pub async fn stop_for_subject(&self, challenge_id: u64, subject: &SubjectKey) -> Result<()> {
        let _guard = self.locks.acquire(SubjectScope::new(challenge_id, subject)).await;
        let container = self
            .store
            .find(challenge_id, subject)
            .await?
            .ok_or_else(|| BerthError::NotFound("No container found".to_string()))?;
        self.stop(&container).await
    }

    /// Stop a tracked container by runtime id
    pub async fn kill(&self, runtime_id: &str) -> Result<()> {
        let container = self
            .store
            .get(runtime_id)
            .await?
            .ok_or_else(|| BerthError::NotFound(format!("Container '{}' not found", runtime_id)))?;
        self.stop(&container).await
    }

    /// Stop every tracked container, returning how many were stopped.
    ///
    /// Containers that cannot be killed stay tracked.
    pub async fn purge_all(&self) -> Result<usize> {
        let mut purged = 0;
        for container in self.store.all().await? {
            match self.stop(&container).await {
                Ok(()) => purged += 1,
                Err(e) => warn!(id = %container.runtime_id, error = %e, "could not purge container"),
            }
        }
        info!(purged, "purged containers");
        Ok(purged)
    }

    /// Tagged images available across all endpoints, sorted and deduplicated
    pub async fn list_images(&self) -> Result<Vec<String>> {
        let mut images = BTreeSet::new();
        for name in self.pool.endpoint_names() {
            match retry::guarded(&self.pool, &name, |client| async move { client.list_images().await }).await {
                Ok(tags) => images.extend(tags),
                Err(e) => warn!(endpoint = %name, error = %e, "could not list images"),
            }
        }
        Ok(images.into_iter().collect())
    }

    /// Every tracked container with a live running flag, newest first
    pub async fn list_running_containers(&self) -> Result<RunningOverview> {
        let connected = self.pool.is_connected().await;
        let mut overview = RunningOverview {
            connected,
            ..Default::default()
        };
        let mut teams = BTreeSet::new();
        let mut challenges = BTreeSet::new();

        for container in self.store.all().await? {
            let is_running = retry::is_running(&self.pool, &container.endpoint, &container.runtime_id)
                .await
                .unwrap_or(false);

            let (challenge, image) = match self.catalog.challenge(container.challenge_id).await? {
                Some(c) => (format!("{} [{}]", c.name, c.id), c.image),
                None => (format!("[{}]", container.challenge_id), String::new()),
            };
            let user = format!("user [{}]", container.user_id);
            let team = container.team_id.map(|id| format!("team [{}]", id));

            teams.insert(team.clone().unwrap_or_else(|| user.clone()));
            challenges.insert(challenge.clone());

            overview.containers.push(RunningContainer {
                container_id: container.runtime_id,
                image,
                challenge,
                team,
                user,
                endpoint: container.endpoint,
                port: container.host_port,
                created: container.created_at,
                expires: container.expires_at,
                is_running,
            });
        }

        overview.teams = teams.into_iter().collect();
        overview.challenges = challenges.into_iter().collect();
        Ok(overview)
    }

    pub fn list_running_endpoints(&self) -> Vec<String> {
        self.pool.endpoint_names()
    }

    pub async fn is_connected(&self) -> bool {
        self.pool.is_connected().await
    }

    fn connection_info(
        &self,
        status: RequestStatus,
        challenge: &Challenge,
        container: &TrackedContainer,
        settings: &ManagerSettings,
    ) -> ConnectionInfo {
        let hostname = settings
            .servers
            .get(&container.endpoint)
            .map(|url| display_hostname(url, &settings.hostname))
            .unwrap_or_else(|| settings.hostname.clone());

        ConnectionInfo {
            status,
            hostname,
            port: container.host_port,
            connect: challenge.connect_type.clone(),
            expires: container.expires_at,
            runtime_id: container.runtime_id.clone(),
        }
    }
}

impl Drop for ContainerManager {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}
