//! JSON file backed container store

use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{ContainerStore, MemoryStore, SubjectKey, TrackedContainer};
use crate::error::Result;

/// Keeps records in memory and rewrites the whole file after every change
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rows = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            Vec::new()
        };

        debug!(path = %path.display(), rows = rows.len(), "opened container store");
        Ok(Self {
            path,
            inner: MemoryStore::with_rows(rows),
        })
    }

    fn flush(&self) -> Result<()> {
        let rows = self.inner.snapshot();
        fs::write(&self.path, serde_json::to_string_pretty(&rows)?)?;
        Ok(())
    }
}

#[async_trait]
impl ContainerStore for JsonFileStore {
    async fn insert(&self, container: TrackedContainer) -> Result<()> {
        self.inner.insert(container).await?;
        self.flush()
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
        self.inner.all().await
    }

    async fn set_expiry(&self, runtime_id: &str, expires_at: DateTime<Utc>) -> Result<Option<TrackedContainer>> {
        let updated = self.inner.set_expiry(runtime_id, expires_at).await?;
        if updated.is_some() {
            self.flush()?;
        }
        Ok(updated)
    }

    async fn remove(&self, runtime_id: &str) -> Result<bool> {
        let removed = self.inner.remove(runtime_id).await?;
        if removed {
            self.flush()?;
        }
        Ok(removed)
    }
}
