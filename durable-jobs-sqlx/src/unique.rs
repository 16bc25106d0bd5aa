use std::hash::{Hash, Hasher};

use durable_jobs::store::{IdempotencyScope, NewJob};
use sqlx::{Postgres, QueryBuilder};

pub(crate) trait Unique {
    /// Key of the advisory lock serializing inserts that share an idempotency key.
    fn lock_key(&self) -> Option<i64>;
    /// Finds the active job this insert collides with.
    fn existing_query(&self) -> Option<QueryBuilder<'_, Postgres>>;
}

impl Unique for NewJob {
    fn lock_key(&self) -> Option<i64> {
        // Both scopes hash the key alone so global and per type inserts contend on one lock.
        let key = self.idempotency_key.as_deref()?;
        let mut state = fxhash::FxHasher64::default();
        key.hash(&mut state);
        Some(state.finish() as i64)
    }

    fn existing_query(&self) -> Option<QueryBuilder<'_, Postgres>> {
        let key = self.idempotency_key.as_deref()?;
        let mut builder =
            QueryBuilder::new("SELECT id FROM durable_jobs WHERE idempotency_key = ");
        builder.push_bind(key);
        builder.push(" AND status IN ('pending', 'running')");
        if self.idempotency_scope == IdempotencyScope::JobType {
            builder.push(" AND job_type = ").push_bind(&self.job_type);
        }
        builder.push(" ORDER BY id LIMIT 1");
        Some(builder)
    }
}
