//! Tracked container records
//!
//! The store is the only state shared between request handling and the
//! expiration sweeper. Implementations must be safe to call concurrently;
//! each method is one atomic step.

mod file;

pub use file::JsonFileStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Who a container belongs to.
///
/// In team mode containers are scoped to the team but still owned, for
/// quota purposes, by the user who requested them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SubjectKey {
    User { user_id: u64 },
    Team { team_id: u64, user_id: u64 },
}

impl SubjectKey {
    pub fn user(user_id: u64) -> Self {
        SubjectKey::User { user_id }
    }

    pub fn team(team_id: u64, user_id: u64) -> Self {
        SubjectKey::Team { team_id, user_id }
    }

    /// The user charged against the quota
    pub fn owner(&self) -> u64 {
        match self {
            SubjectKey::User { user_id } | SubjectKey::Team { user_id, .. } => *user_id,
        }
    }

    pub fn team_id(&self) -> Option<u64> {
        match self {
            SubjectKey::User { .. } => None,
            SubjectKey::Team { team_id, .. } => Some(*team_id),
        }
    }
}

impl std::fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubjectKey::User { user_id } => write!(f, "user {}", user_id),
            SubjectKey::Team { team_id, user_id } => write!(f, "team {} (user {})", team_id, user_id),
        }
    }
}

/// One provisioned workload instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedContainer {
    /// Handle returned by the runtime
    pub runtime_id: String,
    pub challenge_id: u64,
    pub user_id: u64,
    pub team_id: Option<u64>,
    /// Endpoint the container was scheduled on
    pub endpoint: String,
    pub host_port: u16,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
}

impl TrackedContainer {
    /// Whether this record is the one `subject` holds for `challenge_id`
    pub fn belongs_to(&self, challenge_id: u64, subject: &SubjectKey) -> bool {
        if self.challenge_id != challenge_id {
            return false;
        }
        match subject {
            SubjectKey::User { user_id } => self.team_id.is_none() && self.user_id == *user_id,
            SubjectKey::Team { team_id, .. } => self.team_id == Some(*team_id),
        }
    }

    pub fn subject(&self) -> SubjectKey {
        match self.team_id {
            Some(team_id) => SubjectKey::team(team_id, self.user_id),
            None => SubjectKey::user(self.user_id),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Durable table of tracked containers
#[async_trait]
pub trait ContainerStore: Send + Sync {
    async fn insert(&self, container: TrackedContainer) -> Result<()>;

    /// The record `subject` holds for `challenge_id`, if any
    async fn find(&self, challenge_id: u64, subject: &SubjectKey) -> Result<Option<TrackedContainer>>;

    async fn get(&self, runtime_id: &str) -> Result<Option<TrackedContainer>>;

    /// Number of records owned by `user_id`, across all challenges
    async fn count_owned_by(&self, user_id: u64) -> Result<usize>;

    /// Every record, newest first
    async fn all(&self) -> Result<Vec<TrackedContainer>>;

    /// Set a new expiry; returns the updated record, `None` if it is gone
    async fn set_expiry(&self, runtime_id: &str, expires_at: DateTime<Utc>) -> Result<Option<TrackedContainer>>;

    /// Delete a record; returns whether it existed
    async fn remove(&self, runtime_id: &str) -> Result<bool>;
}

/// Records held in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<Vec<TrackedContainer>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<TrackedContainer>) -> Self {
        Self {
            rows: RwLock::new(rows),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<TrackedContainer> {
        self.rows.read().clone()
    }
}

#[async_trait]
impl ContainerStore for MemoryStore {
    async fn insert(&self, container: TrackedContainer) -> Result<()> {
        let mut rows = self.rows.write();
        rows.retain(|row| row.runtime_id != container.runtime_id);
        rows.push(container);
        Ok(())
    }

    async fn find(&self, challenge_id: u64, subject: &SubjectKey) -> Result<Option<TrackedContainer>> {
        Ok(self
            .rows
            .read()
            .iter()
            .find(|row| row.belongs_to(challenge_id, subject))
            .cloned())
    }

    async fn get(&self, runtime_id: &str) -> Result<Option<TrackedContainer>> {
        Ok(self
            .rows
            .read()
            .iter()
            .find(|row| row.runtime_id == runtime_id)
            .cloned())
    }

    async fn count_owned_by(&self, user_id: u64) -> Result<usize> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|row| row.user_id == user_id)
            .count())
    }

    async fn all(&self) -> Result<Vec<TrackedContainer>> {
        let mut rows = self.rows.read().clone();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn set_expiry(&self, runtime_id: &str, expires_at: DateTime<Utc>) -> Result<Option<TrackedContainer>> {
        let mut rows = self.rows.write();
        Ok(rows
            .iter_mut()
            .find(|row| row.runtime_id == runtime_id)
            .map(|row| {
                row.expires_at = expires_at;
                row.clone()
            }))
    }

    async fn remove(&self, runtime_id: &str) -> Result<bool> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|row| row.runtime_id != runtime_id);
        Ok(rows.len() != before)
    }
}

#[cfg(test)]
pub(crate) fn record(runtime_id: &str, challenge_id: u64, subject: &SubjectKey) -> TrackedContainer {
    let now = Utc::now();
    TrackedContainer {
        runtime_id: runtime_id.to_string(),
        challenge_id,
        user_id: subject.owner(),
        team_id: subject.team_id(),
        endpoint: "main".to_string(),
        host_port: 31337,
        created_at: now,
        expires_at: now + chrono::Duration::minutes(10),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_scoping() {
        let solo = record("a", 1, &SubjectKey::user(7));
        assert!(solo.belongs_to(1, &SubjectKey::user(7)));
        assert!(!solo.belongs_to(2, &SubjectKey::user(7)));
        assert!(!solo.belongs_to(1, &SubjectKey::team(7, 7)));

        // Any member of the team sees the team's container
        let team = record("b", 1, &SubjectKey::team(3, 7));
        assert!(team.belongs_to(1, &SubjectKey::team(3, 8)));
        assert!(!team.belongs_to(1, &SubjectKey::user(7)));
        assert_eq!(team.subject(), SubjectKey::team(3, 7));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.insert(record("a", 1, &SubjectKey::user(7))).await.unwrap();
        store.insert(record("b", 2, &SubjectKey::user(7))).await.unwrap();
        store.insert(record("c", 1, &SubjectKey::user(8))).await.unwrap();

        assert_eq!(store.count_owned_by(7).await.unwrap(), 2);
        assert_eq!(
            store.find(1, &SubjectKey::user(8)).await.unwrap().unwrap().runtime_id,
            "c"
        );

        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        assert_eq!(store.count_owned_by(7).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_expiry() {
        let store = MemoryStore::new();
        store.insert(record("a", 1, &SubjectKey::user(7))).await.unwrap();

        let later = Utc::now() + chrono::Duration::hours(1);
        let updated = store.set_expiry("a", later).await.unwrap().unwrap();
        assert_eq!(updated.expires_at, later);
        assert!(store.set_expiry("missing", later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_all_newest_first() {
        let mut old = record("old", 1, &SubjectKey::user(1));
        old.created_at -= chrono::Duration::minutes(5);
        let store = MemoryStore::with_rows(vec![old, record("new", 2, &SubjectKey::user(1))]);

        let ids: Vec<String> = store.all().await.unwrap().into_iter().map(|r| r.runtime_id).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }
}
