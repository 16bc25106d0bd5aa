//! An advisory mirror of due jobs.
//!
//! The mirror lets runners learn about upcoming work without polling the store. It is never
//! authoritative: entries may be missing or stale, and every failure is logged and ignored.
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::JobId;

/// A pointer to a job which becomes due at `due_at`.
///
/// Pointers order by due time, then by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobPointer {
    pub due_at: DateTime<Utc>,
    pub id: JobId,
}

#[async_trait]
pub trait CacheMirror: Send + Sync {
    async fn record(&self, pointer: JobPointer) -> Result<(), CacheError>;

    /// Drops the pointers for jobs that have been claimed.
    async fn forget(&self, ids: &[JobId]) -> Result<(), CacheError>;

    /// Drops every pointer due at or before `now`, returning how many were removed.
    async fn evict_due(&self, now: DateTime<Utc>) -> Result<usize, CacheError>;

    /// The earliest due time currently mirrored.
    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, CacheError>;
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
    #[error("Cache in bad state")]
    BadState,
}

/// A mirror that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl CacheMirror for NoopCache {
    async fn record(&self, _pointer: JobPointer) -> Result<(), CacheError> {
        Ok(())
    }

    async fn forget(&self, _ids: &[JobId]) -> Result<(), CacheError> {
        Ok(())
    }

    async fn evict_due(&self, _now: DateTime<Utc>) -> Result<usize, CacheError> {
        Ok(0)
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, CacheError> {
        Ok(None)
    }
}

/// A per process mirror holding at most `capacity` pointers.
///
/// When full, the latest due pointer is dropped so that the earliest work stays visible.
#[derive(Debug, Clone)]
pub struct InMemoryCache {
    entries: Arc<Mutex<BTreeSet<JobPointer>>>,
    capacity: usize,
}

impl InMemoryCache {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Default::default(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheMirror for InMemoryCache {
    async fn record(&self, pointer: JobPointer) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::BadState)?;
        entries.insert(pointer);
        while entries.len() > self.capacity {
            entries.pop_last();
        }
        Ok(())
    }

    async fn forget(&self, ids: &[JobId]) -> Result<(), CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::BadState)?
            .retain(|pointer| !ids.contains(&pointer.id));
        Ok(())
    }

    async fn evict_due(&self, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::BadState)?;
        let before = entries.len();
        entries.retain(|pointer| pointer.due_at > now);
        Ok(before - entries.len())
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, CacheError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| CacheError::BadState)?
            .first()
            .map(|pointer| pointer.due_at))
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;

    use super::*;

    fn pointer(id: i64, due_in: TimeDelta) -> JobPointer {
        JobPointer {
            due_at: Utc::now() + due_in,
            id: id.into(),
        }
    }

    #[tokio::test]
    async fn next_due_at_is_earliest_pointer() {
        let cache = InMemoryCache::new();
        let later = pointer(1, TimeDelta::minutes(5));
        let sooner = pointer(2, TimeDelta::minutes(1));

        cache.record(later).await.unwrap();
        cache.record(sooner).await.unwrap();

        assert_eq!(cache.next_due_at().await.unwrap(), Some(sooner.due_at));
    }

    #[tokio::test]
    async fn forget_removes_claimed_jobs() {
        let cache = InMemoryCache::new();
        cache.record(pointer(1, TimeDelta::zero())).await.unwrap();
        cache.record(pointer(2, TimeDelta::minutes(1))).await.unwrap();

        cache.forget(&[1.into()]).await.unwrap();

        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn evict_due_drops_only_due_pointers() {
        let cache = InMemoryCache::new();
        cache.record(pointer(1, -TimeDelta::seconds(1))).await.unwrap();
        cache.record(pointer(2, -TimeDelta::seconds(2))).await.unwrap();
        let future = pointer(3, TimeDelta::minutes(1));
        cache.record(future).await.unwrap();

        assert_eq!(cache.evict_due(Utc::now()).await.unwrap(), 2);
        assert_eq!(cache.next_due_at().await.unwrap(), Some(future.due_at));
    }

    #[tokio::test]
    async fn capacity_keeps_earliest_pointers() {
        let cache = InMemoryCache::with_capacity(2);
        let first = pointer(1, TimeDelta::seconds(1));
        cache.record(pointer(3, TimeDelta::seconds(3))).await.unwrap();
        cache.record(first).await.unwrap();
        cache.record(pointer(2, TimeDelta::seconds(2))).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.next_due_at().await.unwrap(), Some(first.due_at));
        assert_eq!(cache.evict_due(first.due_at).await.unwrap(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn noop_cache_mirrors_nothing() {
        let cache = NoopCache;
        cache.record(pointer(1, TimeDelta::zero())).await.unwrap();
        assert_eq!(cache.next_due_at().await.unwrap(), None);
        assert_eq!(cache.evict_due(Utc::now()).await.unwrap(), 0);
    }
}
