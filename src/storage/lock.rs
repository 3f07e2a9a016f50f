//! Per-reference async locks serialising compare-and-swap within one server process.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::storage::types::RepositoryName;

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Map of `(repository, reference)` to a mutex. Entries are created on demand and removed when
/// the last guard for them is dropped, so the map only holds references being updated.
#[derive(Debug, Default, Clone)]
pub struct RefLocks {
    inner: Arc<LockMap>,
}

impl RefLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(repo: &RepositoryName, reference: &str) -> String {
        format!("{repo}\0{reference}")
    }

    /// Waits for exclusive access to one reference of one repository.
    pub async fn lock(&self, repo: &RepositoryName, reference: &str) -> RefGuard {
        let key = Self::key(repo, reference);
        let mutex = self.inner.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        RefGuard {
            key,
            map: self.inner.clone(),
            guard: Some(guard),
        }
    }

    /// Number of references currently tracked.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

pub struct RefGuard {
    key: String,
    map: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RefGuard {
    fn drop(&mut self) {
        // Release first so the guard's clone of the mutex no longer counts.
        self.guard.take();
        self.map
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
