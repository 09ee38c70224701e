//! Expiration sweeper
//!
//! A background task that reaps containers past their expiry, independent of
//! request traffic. It shares nothing with the request path except the
//! container store and the endpoint pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::container::locks::{SubjectLocks, SubjectScope};
use crate::error::Result;
use crate::pool::EndpointPool;
use crate::retry;
use crate::store::{ContainerStore, TrackedContainer};

/// Time between two sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired records reaped (all of them are untracked)
    pub expired: usize,
    /// Expired containers the runtime could not kill
    pub kill_failures: usize,
}

#[derive(Clone)]
pub struct Sweeper {
    store: Arc<dyn ContainerStore>,
    pool: Arc<EndpointPool>,
    clock: Arc<dyn Clock>,
    locks: Arc<SubjectLocks>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn ContainerStore>,
        pool: Arc<EndpointPool>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            pool,
            clock,
            locks: Arc::new(SubjectLocks::default()),
            interval: SWEEP_INTERVAL,
        }
    }

    /// Share the request path's subject locks
    pub(crate) fn with_locks(mut self, locks: Arc<SubjectLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Kill and untrack every expired container once.
    ///
    /// Each candidate is re-read under its subject lock, so a container
    /// renewed after the listing survives. Kill failures are logged and the
    /// record is dropped regardless, so one unreachable endpoint cannot stall
    /// the rest of the sweep.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let candidates: Vec<TrackedContainer> = self
            .store
            .all()
            .await?
            .into_iter()
            .filter(|row| row.is_expired(self.clock.now()))
            .collect();

        for candidate in candidates {
            let _guard = self
                .locks
                .acquire(SubjectScope::new(candidate.challenge_id, &candidate.subject()))
                .await;

            let container = match self.store.get(&candidate.runtime_id).await? {
                Some(current) if current.is_expired(self.clock.now()) => current,
                Some(_) => {
                    debug!(id = %candidate.runtime_id, "container renewed, skipping");
                    continue;
                }
                None => continue,
            };
            report.expired += 1;

            if let Err(e) = retry::kill(&self.pool, &container.endpoint, &container.runtime_id).await {
                report.kill_failures += 1;
                warn!(
                    id = %container.runtime_id,
                    endpoint = %container.endpoint,
                    error = %e,
                    "could not kill expired container"
                );
            }

            self.store.remove(&container.runtime_id).await?;
            info!(
                id = %container.runtime_id,
                challenge = container.challenge_id,
                user = container.user_id,
                "expired container removed"
            );
        }

        Ok(report)
    }

    /// Run the sweep on a fixed interval until the handle is stopped
    pub fn spawn(self) -> SweeperHandle {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let interval_secs = self.interval.as_secs();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            while flag.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                match self.sweep_once().await {
                    Ok(report) if report.expired > 0 => {
                        debug!(expired = report.expired, failures = report.kill_failures, "sweep finished");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "sweep failed"),
                }
            }
        });

        info!(interval_secs, "expiration sweeper started");
        SweeperHandle { running, task }
    }
}

/// Controls a spawned sweeper; dropping it stops the task
#[derive(Debug)]
pub struct SweeperHandle {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::runtime::{ContainerRuntime, ContainerSpec, MemoryConnector};
    use crate::store::{MemoryStore, SubjectKey};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::BTreeMap;

    struct Fixture {
        connector: Arc<MemoryConnector>,
        pool: Arc<EndpointPool>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        locks: Arc<SubjectLocks>,
        sweeper: Sweeper,
    }

    async fn fixture() -> Fixture {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(EndpointPool::new(connector.clone()));
        let servers = BTreeMap::from([("main".to_string(), "tcp://host1:2376".to_string())]);
        pool.initialize(&servers).await.unwrap();

        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let locks = Arc::new(SubjectLocks::default());
        let sweeper = Sweeper::new(store.clone(), pool.clone(), clock.clone()).with_locks(locks.clone());
        Fixture {
            connector,
            pool,
            store,
            clock,
            locks,
            sweeper,
        }
    }

    async fn track(fx: &Fixture, challenge_id: u64, lifetime: chrono::Duration) -> String {
        let runtime = fx.connector.runtime("main");
        let spec = ContainerSpec {
            image: "ctf/pwn:1".into(),
            container_port: 9000,
            host_port: 9000 + challenge_id as u16,
            command: None,
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            limits: Default::default(),
            binds: Vec::new(),
        };
        let id = runtime.create_container(&spec).await.unwrap();
        let now = fx.clock.now();
        fx.store
            .insert(TrackedContainer {
                runtime_id: id.clone(),
                challenge_id,
                user_id: 7,
                team_id: None,
                endpoint: "main".into(),
                host_port: spec.host_port,
                created_at: now,
                expires_at: now + lifetime,
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let fx = fixture().await;
        let short = track(&fx, 1, chrono::Duration::minutes(1)).await;
        let long = track(&fx, 2, chrono::Duration::minutes(30)).await;

        fx.clock.advance(chrono::Duration::minutes(2));
        let report = fx.sweeper.sweep_once().await.unwrap();

        assert_eq!(report, SweepReport { expired: 1, kill_failures: 0 });
        let runtime = fx.connector.runtime("main");
        assert!(!runtime.is_running(&short));
        assert!(runtime.is_running(&long));
        assert_eq!(fx.store.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_continues_when_endpoint_unreachable() {
        let fx = fixture().await;
        track(&fx, 1, chrono::Duration::minutes(1)).await;
        track(&fx, 2, chrono::Duration::minutes(1)).await;

        fx.connector.runtime("main").set_reachable(false);
        fx.clock.advance(chrono::Duration::minutes(5));

        let report = fx.sweeper.sweep_once().await.unwrap();
        assert_eq!(report.expired, 2);
        assert_eq!(report.kill_failures, 2);
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn test_container_already_gone() {
        let fx = fixture().await;
        let id = track(&fx, 1, chrono::Duration::minutes(1)).await;
        fx.connector.runtime("main").kill_container(&id).await.unwrap();

        fx.clock.advance(chrono::Duration::minutes(2));
        let report = fx.sweeper.sweep_once().await.unwrap();
        assert_eq!(report.kill_failures, 0);
        assert!(fx.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_reaps_within_interval() {
        let fx = fixture().await;
        let id = track(&fx, 1, chrono::Duration::seconds(30)).await;
        let handle = fx.sweeper.clone().spawn();

        fx.clock.advance(chrono::Duration::seconds(31));
        tokio::time::sleep(SWEEP_INTERVAL + Duration::from_millis(100)).await;

        assert!(fx.store.is_empty());
        assert!(!fx.connector.runtime("main").is_running(&id));

        handle.stop();
        assert!(!handle.is_running());
    }

    /// Renews every record right after listing it, like a renewal landing
    /// between the sweeper's listing and its kill
    struct RenewingStore {
        inner: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    #[async_trait]
    impl ContainerStore for RenewingStore {
        async fn insert(&self, container: TrackedContainer) -> Result<()> {
            self.inner.insert(container).await
        }

        async fn find(&self, challenge_id: u64, subject: &SubjectKey) -> Result<Option<TrackedContainer>> {
            self.inner.find(challenge_id, subject).await
        }

        async fn get(&self, runtime_id: &str) -> Result<Option<TrackedContainer>> {
            self.inner.get(runtime_id).await
        }

        async fn count_owned_by(&self, user_id: u64) -> Result<usize> {
            self.inner.count_owned_by(user_id).await
        }

        async fn all(&self) -> Result<Vec<TrackedContainer>> {
            let rows = self.inner.all().await?;
            let renewed = self.clock.now() + chrono::Duration::minutes(10);
            for row in &rows {
                self.inner.set_expiry(&row.runtime_id, renewed).await?;
            }
            Ok(rows)
        }

        async fn set_expiry(&self, runtime_id: &str, expires_at: DateTime<Utc>) -> Result<Option<TrackedContainer>> {
            self.inner.set_expiry(runtime_id, expires_at).await
        }

        async fn remove(&self, runtime_id: &str) -> Result<bool> {
            self.inner.remove(runtime_id).await
        }
    }

    #[tokio::test]
    async fn test_renewed_after_listing_survives() {
        let fx = fixture().await;
        let id = track(&fx, 1, chrono::Duration::minutes(1)).await;
        fx.clock.advance(chrono::Duration::minutes(2));

        let store = Arc::new(RenewingStore {
            inner: fx.store.clone(),
            clock: fx.clock.clone(),
        });
        let sweeper = Sweeper::new(store, fx.pool.clone(), fx.clock.clone());

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert!(fx.connector.runtime("main").is_running(&id));
        assert_eq!(fx.store.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_waits_for_subject_lock() {
        let fx = fixture().await;
        let id = track(&fx, 1, chrono::Duration::minutes(1)).await;
        fx.clock.advance(chrono::Duration::minutes(2));

        // A renewal in flight holds the subject lock
        let guard = fx.locks.acquire(SubjectScope::new(1, &SubjectKey::user(7))).await;
        let sweeper = fx.sweeper.clone();
        let sweep = tokio::spawn(async move { sweeper.sweep_once().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sweep.is_finished());

        fx.store
            .set_expiry(&id, fx.clock.now() + chrono::Duration::minutes(10))
            .await
            .unwrap();
        drop(guard);

        let report = sweep.await.unwrap().unwrap();
        assert_eq!(report.expired, 0);
        assert!(fx.connector.runtime("main").is_running(&id));
        assert!(fx.store.get(&id).await.unwrap().is_some());
    }
}
