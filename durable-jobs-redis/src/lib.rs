//! A Redis backed [`CacheMirror`] for `durable-jobs`.
//!
//! Due pointers are kept in one sorted set per namespace, scored by due time in milliseconds, so
//! several processes sharing a namespace see each other's upcoming work. The mirror is advisory:
//! the job store remains the source of truth.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use durable_jobs::{
    cache::{CacheError, CacheMirror, JobPointer},
    job::JobId,
};
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, ToRedisArgs};

#[derive(Clone)]
pub struct RedisCacheMirror {
    conn: ConnectionManager,
    namespace: NameSpace,
    capacity: usize,
}

fn map_err(error: RedisError) -> CacheError {
    if error.is_io_error()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.is_timeout()
    {
        CacheError::Unavailable(error.to_string())
    } else {
        tracing::error!(?error, "Redis error: {error}");
        CacheError::BadState
    }
}

impl RedisCacheMirror {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub async fn from_url(redis_url: &str, namespace: impl ToString) -> Result<Self, CacheError> {
        let client = Client::open(redis_url).map_err(map_err)?;

        Ok(Self {
            conn: ConnectionManager::new(client).await.map_err(map_err)?,
            namespace: NameSpace(namespace.to_string()),
            capacity: Self::DEFAULT_CAPACITY,
        })
    }

    /// Caps the number of mirrored pointers; the latest due pointers are dropped first.
    pub fn with_capacity(self, capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ..self
        }
    }

    /// Number of pointers currently mirrored.
    pub async fn len(&self) -> Result<usize, CacheError> {
        self.conn
            .clone()
            .zcard(self.namespace.due())
            .await
            .map_err(map_err)
    }

    pub async fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len().await? == 0)
    }
}

impl std::fmt::Debug for RedisCacheMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheMirror")
            .field("namespace", &self.namespace.0)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CacheMirror for RedisCacheMirror {
    async fn record(&self, pointer: JobPointer) -> Result<(), CacheError> {
        let key = self.namespace.due();
        let capacity = isize::try_from(self.capacity).unwrap_or(isize::MAX);
        let (): () = redis::pipe()
            .atomic()
            .zadd(&key, i64::from(pointer.id), pointer.due_at.timestamp_millis())
            .ignore()
            .zremrangebyrank(&key, capacity, -1)
            .ignore()
            .query_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn forget(&self, ids: &[JobId]) -> Result<(), CacheError> {
        if ids.is_empty() {
            return Ok(());
        }
        let members: Vec<i64> = ids.iter().copied().map(i64::from).collect();
        let _: usize = self
            .conn
            .clone()
            .zrem(self.namespace.due(), members)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn evict_due(&self, now: DateTime<Utc>) -> Result<usize, CacheError> {
        self.conn
            .clone()
            .zrembyscore(self.namespace.due(), "-inf", now.timestamp_millis())
            .await
            .map_err(map_err)
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, CacheError> {
        let earliest: Vec<(i64, f64)> = self
            .conn
            .clone()
            .zrange_withscores(self.namespace.due(), 0, 0)
            .await
            .map_err(map_err)?;
        earliest
            .first()
            .map(|(_, score)| {
                DateTime::from_timestamp_millis(*score as i64).ok_or(CacheError::BadState)
            })
            .transpose()
    }
}

#[derive(Clone)]
struct NameSpace(String);

impl NameSpace {
    fn due(&self) -> NameSpacedKey<'_> {
        NameSpacedKey {
            namespace: &self.0,
            kind: KeyType::Due,
        }
    }
}

struct NameSpacedKey<'a> {
    namespace: &'a str,
    kind: KeyType,
}

impl std::fmt::Display for NameSpacedKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.namespace)?;
        match self.kind {
            KeyType::Due => write!(f, ":due_jobs"),
        }
    }
}

impl<'a> ToRedisArgs for NameSpacedKey<'a> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg_fmt(self);
    }
}

enum KeyType {
    Due,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let namespace = NameSpace("billing".to_owned());
        assert_eq!(namespace.due().to_string(), "billing:due_jobs");
    }

    #[test]
    fn keys_write_a_single_argument() {
        let namespace = NameSpace("billing".to_owned());
        assert_eq!(namespace.due().to_redis_args(), vec![b"billing:due_jobs".to_vec()]);
    }

    #[test]
    fn io_errors_are_unavailable() {
        let error = RedisError::from(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(matches!(map_err(error), CacheError::Unavailable(_)));
    }

    #[test]
    fn other_errors_are_bad_state() {
        let error = RedisError::from((redis::ErrorKind::TypeError, "unexpected reply"));
        assert!(matches!(map_err(error), CacheError::BadState));
    }
}
