//! Per-subject request serialization

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::store::SubjectKey;

/// Scope a container is unique within: challenge plus team or user
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SubjectScope {
    challenge_id: u64,
    team_id: Option<u64>,
    user_id: Option<u64>,
}

impl SubjectScope {
    pub(crate) fn new(challenge_id: u64, subject: &SubjectKey) -> Self {
        match subject {
            SubjectKey::User { user_id } => Self {
                challenge_id,
                team_id: None,
                user_id: Some(*user_id),
            },
            SubjectKey::Team { team_id, .. } => Self {
                challenge_id,
                team_id: Some(*team_id),
                user_id: None,
            },
        }
    }
}

type LockMap = Arc<Mutex<HashMap<SubjectScope, Arc<AsyncMutex<()>>>>>;

/// Hands out one async lock per subject scope, forgetting it once nobody
/// holds or waits on it
#[derive(Debug, Default)]
pub(crate) struct SubjectLocks {
    locks: LockMap,
}

impl SubjectLocks {
    pub(crate) async fn acquire(&self, scope: SubjectScope) -> SubjectGuard {
        let lock = self
            .locks
            .lock()
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let guard = lock.lock_owned().await;
        SubjectGuard {
            scope,
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

pub(crate) struct SubjectGuard {
    scope: SubjectScope,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SubjectGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // One reference in the map, one inside our guard
        let idle = locks
            .get(&self.scope)
            .map(|lock| Arc::strong_count(lock) == 2)
            .unwrap_or(false);
        self.guard.take();
        if idle {
            locks.remove(&self.scope);
        }
    }
}
