//! Test suite for ensuring a correct implementation of a [`JobStore`].
use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, Utc};

use crate::job::{JobId, JobStatus, RunnerId};

use super::*;

const JOB_TYPE: &str = "send_email";

impl NewJob {
    pub(crate) fn mock_job() -> Self {
        Self {
            job_type: JOB_TYPE.to_owned(),
            payload: serde_json::json!({"to": "user@example.com"}),
            max_attempts: 3,
            next_run_at: Utc::now() - TimeDelta::seconds(1),
            expires_at: None,
            idempotency_key: None,
            idempotency_scope: IdempotencyScope::JobType,
        }
    }

    pub(crate) fn with_job_type(self, job_type: impl ToString) -> Self {
        Self {
            job_type: job_type.to_string(),
            ..self
        }
    }

    pub(crate) fn with_key(self, key: impl ToString) -> Self {
        Self {
            idempotency_key: Some(key.to_string()),
            ..self
        }
    }

    pub(crate) fn with_scope(self, idempotency_scope: IdempotencyScope) -> Self {
        Self {
            idempotency_scope,
            ..self
        }
    }

    pub(crate) fn with_next_run_at(self, next_run_at: DateTime<Utc>) -> Self {
        Self {
            next_run_at,
            ..self
        }
    }

    pub(crate) fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub(crate) fn with_expires_at(self, expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at: Some(expires_at),
            ..self
        }
    }
}

/// Create test suite for a job store.
///
/// For store implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use durable_jobs::test_suite;
/// use durable_jobs::store::memory::InMemoryJobStore;
/// test_suite!(for: InMemoryJobStore::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead. For example when using `sqlx::test` you could do the following:
///
/// ```ignore
/// use durable_jobs::test_suite;
/// test_suite!(
///     attr: sqlx::test(migrations = "./migrations"),
///     args: (pool: PgPool),
///     store: PgJobStore::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $store:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        $crate::test_suite!(@tests $attr, $args, $store;
            insert_creates_pending_job,
            insert_with_same_key_returns_existing,
            insert_same_key_different_type_creates_job,
            insert_same_key_global_scope_returns_existing,
            insert_same_key_after_terminal_creates_job,
            claim_next_batch_claims_due_jobs_in_order,
            claim_next_batch_respects_limit,
            claim_next_batch_skips_future_expired_and_exhausted,
            claim_next_batch_is_exclusive,
            mark_completed,
            mark_completed_lock_lost,
            mark_completed_not_found,
            mark_retry,
            mark_retry_never_moves_next_run_at_backwards,
            mark_retry_exhausted_dead_letters,
            mark_retry_lock_lost,
            mark_dead_letter,
            mark_dead_letter_lock_lost,
            reclaim_stale_requeues_abandoned_jobs,
            reclaim_stale_dead_letters_exhausted_jobs,
            reclaim_stale_dead_letters_expired_jobs,
            reclaim_stale_ignores_fresh_locks,
            reclaimed_job_rejects_former_owner,
            query,
        );
    };
    (@tests $attr:meta, $args:tt, $store:expr; $($name:ident),* $(,)?) => {
        $(
            #[$attr]
            async fn $name $args {
                let store = $store;
                $crate::store::testing::$name(store).await;
            }
        )*
    };
}

pub use test_suite;

/// Helpers shared by the conformance tests.
#[doc(hidden)]
#[async_trait::async_trait]
pub trait StoreTesting: JobStore {
    async fn get_job(&self, id: JobId) -> crate::job::Job {
        self.get(id).await.unwrap().expect("job should exist")
    }

    async fn insert_job(&self, job: NewJob) -> JobId {
        self.insert(job).await.unwrap().id()
    }

    async fn claim_all(&self, runner_id: &RunnerId) -> Vec<crate::job::Job> {
        self.claim_next_batch(runner_id, 100, Utc::now())
            .await
            .unwrap()
    }
}

impl<T: JobStore> StoreTesting for T {}

#[doc(hidden)]
pub async fn insert_creates_pending_job(store: impl JobStore) {
    let new_job = NewJob::mock_job();
    let inserted = store.insert(new_job.clone()).await.unwrap();
    assert!(inserted.is_created());

    let job = store.get_job(inserted.id()).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);
    assert_eq!(job.job_type, JOB_TYPE);
    assert_eq!(job.payload, new_job.payload);
    assert!(job.locked_by.is_none());
    assert!(job.locked_at.is_none());
    assert!(job.error_message.is_none());
}

#[doc(hidden)]
pub async fn insert_with_same_key_returns_existing(store: impl JobStore) {
    let first = store
        .insert(NewJob::mock_job().with_key("order-42"))
        .await
        .unwrap();
    let second = store
        .insert(NewJob::mock_job().with_key("order-42"))
        .await
        .unwrap();

    assert!(first.is_created());
    assert_eq!(second, Inserted::Existing(first.id()));
    assert_eq!(
        store
            .query(Query::IdempotencyKeyEqual("order-42"))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[doc(hidden)]
pub async fn insert_same_key_different_type_creates_job(store: impl JobStore) {
    let first = store
        .insert_job(NewJob::mock_job().with_key("order-42"))
        .await;
    let second = store
        .insert(
            NewJob::mock_job()
                .with_job_type("resize_image")
                .with_key("order-42"),
        )
        .await
        .unwrap();

    assert!(second.is_created());
    assert_ne!(second.id(), first);
}

#[doc(hidden)]
pub async fn insert_same_key_global_scope_returns_existing(store: impl JobStore) {
    let first = store
        .insert_job(NewJob::mock_job().with_key("order-42"))
        .await;
    let second = store
        .insert(
            NewJob::mock_job()
                .with_job_type("resize_image")
                .with_key("order-42")
                .with_scope(IdempotencyScope::Global),
        )
        .await
        .unwrap();

    assert_eq!(second, Inserted::Existing(first));
}

#[doc(hidden)]
pub async fn insert_same_key_after_terminal_creates_job(store: impl JobStore) {
    let runner = RunnerId::from("runner-a");
    let first = store
        .insert_job(NewJob::mock_job().with_key("order-42"))
        .await;
    store.claim_all(&runner).await;
    store.mark_completed(first, &runner, None).await.unwrap();

    let second = store
        .insert(NewJob::mock_job().with_key("order-42"))
        .await
        .unwrap();

    assert!(second.is_created());
    assert_ne!(second.id(), first);
}

#[doc(hidden)]
pub async fn claim_next_batch_claims_due_jobs_in_order(store: impl JobStore) {
    let runner = RunnerId::from("runner-a");
    let now = Utc::now();
    let later = store
        .insert_job(NewJob::mock_job().with_next_run_at(now - TimeDelta::seconds(1)))
        .await;
    let earliest = store
        .insert_job(NewJob::mock_job().with_next_run_at(now - TimeDelta::seconds(10)))
        .await;
    let tied = store
        .insert_job(NewJob::mock_job().with_next_run_at(now - TimeDelta::seconds(1)))
        .await;

    let claimed = store.claim_next_batch(&runner, 10, now).await.unwrap();
    let ids: Vec<_> = claimed.iter().map(|job| job.id).collect();

    assert_eq!(ids, vec![earliest, later, tied]);
    for job in claimed {
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.locked_by.as_ref(), Some(&runner));
        assert!(job.locked_at.is_some());
    }
}

#[doc(hidden)]
pub async fn claim_next_batch_respects_limit(store: impl JobStore) {
    let runner = RunnerId::from("runner-a");
    for _ in 0..5 {
        store.insert_job(NewJob::mock_job()).await;
    }

    let claimed = store
        .claim_next_batch(&runner, 2, Utc::now())
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);

    let running = store
        .query(Query::StatusEqual(JobStatus::Running))
        .await
        .unwrap();
    assert_eq!(running.len(), 2);

    let none = store
        .claim_next_batch(&runner, 0, Utc::now())
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[doc(hidden)]
pub async fn claim_next_batch_skips_future_expired_and_exhausted(store: impl JobStore) {
    let runner = RunnerId::from("runner-a");
    let now = Utc::now();
    store
        .insert_job(NewJob::mock_job().with_next_run_at(now + TimeDelta::hours(1)))
        .await;
    store
        .insert_job(NewJob::mock_job().with_expires_at(now - TimeDelta::seconds(1)))
        .await;
    let exhausted = store
        .insert_job(NewJob::mock_job().with_max_attempts(1))
        .await;
    store.claim_all(&runner).await;
    store
        .mark_retry(exhausted, &runner, now, "transient failure: boom")
        .await
        .unwrap();

    let claimed = store.claim_next_batch(&runner, 10, now).await.unwrap();
    assert!(claimed.is_empty(), "{claimed:?}");
}

#[doc(hidden)]
pub async fn claim_next_batch_is_exclusive(store: impl JobStore) {
    let runners: Vec<RunnerId> = (0..4)
        .map(|i| RunnerId::from(format!("runner-{i}")))
        .collect();
    let mut inserted = HashSet::new();
    for _ in 0..10 {
        inserted.insert(store.insert_job(NewJob::mock_job()).await);
    }

    let now = Utc::now();
    let batches = futures::future::join_all(
        runners
            .iter()
            .map(|runner| store.claim_next_batch(runner, 3, now)),
    )
    .await;

    let mut claimed = HashSet::new();
    let mut total = 0;
    for batch in batches {
        for job in batch.unwrap() {
            total += 1;
            claimed.insert(job.id);
        }
    }
    assert_eq!(total, claimed.len(), "a job was claimed twice");
    assert!(claimed.is_subset(&inserted));
    assert_eq!(total, 10);
}

#[doc(hidden)]
pub async fn mark_completed(store: impl JobStore) {
    let runner = RunnerId::from("runner-a");
    let id = store.insert_job(NewJob::mock_job()).await;
    store.claim_all(&runner).await;

    store
        .mark_completed(id, &runner, Some(serde_json::json!({"delivered": true})))
        .await
        .unwrap();

    let job = store.get_job(id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(serde_json::json!({"delivered": true})));
    assert!(job.locked_by.is_none());
    assert!(job.locked_at.is_none());
}

#[doc(hidden)]
pub async fn mark_completed_lock_lost(store: impl JobStore) {
    let owner = RunnerId::from("runner-a");
    let other = RunnerId::from("runner-b");
    let id = store.insert_job(NewJob::mock_job()).await;

    assert!(matches!(
        store.mark_completed(id, &owner, None).await,
        Err(StoreError::LockLost(_))
    ));

    store.claim_all(&owner).await;
    assert!(matches!(
        store.mark_completed(id, &other, None).await,
        Err(StoreError::LockLost(_))
    ));
    assert_eq!(store.get_job(id).await.status, JobStatus::Running);
}

#[doc(hidden)]
pub async fn mark_completed_not_found(store: impl JobStore) {
    let runner = RunnerId::from("runner-a");
    assert!(matches!(
        store.mark_completed(0.into(), &runner, None).await,
        Err(StoreError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn mark_retry(store: impl JobStore) {
    let runner = RunnerId::from("runner-a");
    let id = store.insert_job(NewJob::mock_job()).await;
    store.claim_all(&runner).await;
    let next_run_at = Utc::now() + TimeDelta::minutes(5);

    let status = store
        .mark_retry(id, &runner, next_run_at, "transient failure: smtp\nrefused")
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Pending);
    let job = store.get_job(id).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.next_run_at > Utc::now() + TimeDelta::minutes(4));
    assert_eq!(
        job.error_message.as_deref(),
        Some("transient failure: smtp refused")
    );
    assert!(job.locked_by.is_none());
    assert!(job.locked_at.is_none());
}

#[doc(hidden)]
pub async fn mark_retry_never_moves_next_run_at_backwards(store: impl JobStore) {
    let runner = RunnerId::from("runner-a");
    let id = store.insert_job(NewJob::mock_job()).await;
    let original = store.get_job(id).await.next_run_at;
    store.claim_all(&runner).await;

    store
        .mark_retry(id, &runner, original - TimeDelta::hours(1), "error")
        .await
        .unwrap();

    assert!(store.get_job(id).await.next_run_at >= original);
}

#[doc(hidden)]
pub async fn mark_retry_exhausted_dead_letters(store: impl JobStore) {
    let runner = RunnerId::from("runner-a");
    let id = store
        .insert_job(NewJob::mock_job().with_max_attempts(1))
        .await;
    store.claim_all(&runner).await;

    let status = store
        .mark_retry(id, &runner, Utc::now(), "transient failure: boom")
        .await
        .unwrap();

    assert_eq!(status, JobStatus::DeadLetter);
    let job = store.get_job(id).await;
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.attempts, 1);
    assert!(job.locked_by.is_none());
}

#[doc(hidden)]
pub async fn mark_retry_lock_lost(store: impl JobStore) {
    let runner = RunnerId::from("runner-a");
    let id = store.insert_job(NewJob::mock_job()).await;
    store.claim_all(&runner).await;
    store.mark_completed(id, &runner, None).await.unwrap();

    assert!(matches!(
        store.mark_retry(id, &runner, Utc::now(), "late").await,
        Err(StoreError::LockLost(_))
    ));
    assert_eq!(store.get_job(id).await.status, JobStatus::Completed);
}

#[doc(hidden)]
pub async fn mark_dead_letter(store: impl JobStore) {
    let runner = RunnerId::from("runner-a");
    let id = store.insert_job(NewJob::mock_job()).await;
    store.claim_all(&runner).await;

    store
        .mark_dead_letter(id, &runner, "permanent failure: invalid address")
        .await
        .unwrap();

    let job = store.get_job(id).await;
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(
        job.error_message.as_deref(),
        Some("permanent failure: invalid address")
    );
    assert!(job.locked_by.is_none());
}

#[doc(hidden)]
pub async fn mark_dead_letter_lock_lost(store: impl JobStore) {
    let runner = RunnerId::from("runner-a");
    let id = store.insert_job(NewJob::mock_job()).await;
    store.claim_all(&runner).await;

    assert!(matches!(
        store
            .mark_dead_letter(id, &RunnerId::from("runner-b"), "error")
            .await,
        Err(StoreError::LockLost(_))
    ));
    assert!(matches!(
        store
            .mark_dead_letter(0.into(), &runner, "error")
            .await,
        Err(StoreError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn reclaim_stale_requeues_abandoned_jobs(store: impl JobStore) {
    let runner = RunnerId::from("crashed");
    let id = store.insert_job(NewJob::mock_job()).await;
    store.claim_all(&runner).await;

    let later = Utc::now() + TimeDelta::minutes(10);
    let reclaimed = store
        .reclaim_stale(TimeDelta::minutes(5), later)
        .await
        .unwrap();

    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, id);
    assert_eq!(reclaimed[0].status, JobStatus::Pending);
    assert_eq!(reclaimed[0].reason, ReclaimReason::StaleLock);

    let job = store.get_job(id).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.locked_by.is_none());
    assert!(job.locked_at.is_none());
}

#[doc(hidden)]
pub async fn reclaim_stale_dead_letters_exhausted_jobs(store: impl JobStore) {
    let runner = RunnerId::from("crashed");
    let id = store
        .insert_job(NewJob::mock_job().with_max_attempts(1))
        .await;
    store.claim_all(&runner).await;

    let reclaimed = store
        .reclaim_stale(TimeDelta::minutes(5), Utc::now() + TimeDelta::minutes(10))
        .await
        .unwrap();

    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].status, JobStatus::DeadLetter);
    let job = store.get_job(id).await;
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.attempts, 1);
    assert!(job.locked_by.is_none());
}

#[doc(hidden)]
pub async fn reclaim_stale_dead_letters_expired_jobs(store: impl JobStore) {
    let now = Utc::now();
    let pending = store
        .insert_job(NewJob::mock_job().with_expires_at(now - TimeDelta::seconds(1)))
        .await;
    let runner = RunnerId::from("runner-a");
    let running = store
        .insert_job(NewJob::mock_job().with_expires_at(now + TimeDelta::seconds(30)))
        .await;
    store.claim_all(&runner).await;
    let untouched = store.insert_job(NewJob::mock_job()).await;

    let reclaimed = store
        .reclaim_stale(TimeDelta::hours(1), now + TimeDelta::minutes(1))
        .await
        .unwrap();

    let ids: HashSet<_> = reclaimed.iter().map(|job| job.id).collect();
    assert_eq!(ids, HashSet::from([pending, running]));
    assert!(reclaimed
        .iter()
        .all(|job| job.status == JobStatus::DeadLetter && job.reason == ReclaimReason::Expired));

    let expired = store.get_job(pending).await;
    assert_eq!(expired.status, JobStatus::DeadLetter);
    assert_eq!(expired.attempts, 0);
    assert!(expired
        .error_message
        .is_some_and(|message| message.starts_with("expired")));
    assert_eq!(store.get_job(running).await.status, JobStatus::DeadLetter);
    assert_eq!(store.get_job(untouched).await.status, JobStatus::Pending);
}

#[doc(hidden)]
pub async fn reclaim_stale_ignores_fresh_locks(store: impl JobStore) {
    let runner = RunnerId::from("runner-a");
    let id = store.insert_job(NewJob::mock_job()).await;
    store.claim_all(&runner).await;

    let reclaimed = store
        .reclaim_stale(TimeDelta::minutes(5), Utc::now())
        .await
        .unwrap();

    assert!(reclaimed.is_empty());
    assert_eq!(store.get_job(id).await.status, JobStatus::Running);
}

#[doc(hidden)]
pub async fn reclaimed_job_rejects_former_owner(store: impl JobStore) {
    let crashed = RunnerId::from("crashed");
    let healthy = RunnerId::from("healthy");
    let id = store.insert_job(NewJob::mock_job()).await;
    store.claim_all(&crashed).await;

    let later = Utc::now() + TimeDelta::minutes(10);
    store
        .reclaim_stale(TimeDelta::minutes(5), later)
        .await
        .unwrap();
    let claimed = store.claim_next_batch(&healthy, 1, later).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].attempts, 2);

    assert!(matches!(
        store.mark_completed(id, &crashed, None).await,
        Err(StoreError::LockLost(_))
    ));
    store.mark_completed(id, &healthy, None).await.unwrap();
    assert_eq!(store.get_job(id).await.status, JobStatus::Completed);
}

#[doc(hidden)]
pub async fn query(store: impl JobStore) {
    let runner = RunnerId::from("runner-a");
    let email = store
        .insert_job(NewJob::mock_job().with_key("order-42"))
        .await;
    let image = store
        .insert_job(
            NewJob::mock_job()
                .with_job_type("resize_image")
                .with_next_run_at(Utc::now() + TimeDelta::hours(1)),
        )
        .await;
    store.claim_all(&runner).await;
    store
        .mark_dead_letter(email, &runner, "permanent failure")
        .await
        .unwrap();

    let ids = |jobs: Vec<crate::job::Job>| jobs.into_iter().map(|job| job.id).collect::<Vec<_>>();

    assert_eq!(ids(store.query(Query::All).await.unwrap()), vec![email, image]);
    assert_eq!(
        ids(store
            .query(Query::StatusEqual(JobStatus::DeadLetter))
            .await
            .unwrap()),
        vec![email]
    );
    assert_eq!(
        ids(store
            .query(Query::And(vec![
                Query::JobTypeEqual("resize_image"),
                Query::NextRunAtAfter(Utc::now()),
            ]))
            .await
            .unwrap()),
        vec![image]
    );
    assert_eq!(
        ids(store
            .query(Query::Or(vec![
                Query::IdempotencyKeyEqual("order-42"),
                Query::IdEquals(image),
            ]))
            .await
            .unwrap()),
        vec![email, image]
    );
    assert_eq!(
        ids(store
            .query(Query::Not(Box::new(Query::JobTypeEqual(JOB_TYPE))))
            .await
            .unwrap()),
        vec![image]
    );
    assert_eq!(
        ids(store
            .query(Query::PayloadEquals(NewJob::mock_job().payload))
            .await
            .unwrap()),
        vec![email, image]
    );
    assert!(store.get(0.into()).await.unwrap().is_none());
}
