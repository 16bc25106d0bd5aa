//! Helpers for testing.
#![allow(clippy::vec_init_then_push)]

/// A macro for making assertions about what jobs should have been enqueued.
///
/// Facilitates making assertions about the jobs held by a [`crate::store::JobStore`].
/// Assertions can be based on payload, job type, status, idempotency key and due time.
///
/// # Example
///
/// ```
/// # use durable_jobs::prelude::*;
/// # use durable_jobs::testing::assert_enqueued;
/// # use chrono::{TimeDelta, Utc};
/// # struct SendEmail;
/// #
/// # #[async_trait::async_trait]
/// # impl Executor for SendEmail {
/// #     type Data = String;
/// #     const NAME: &'static str = "send_email";
/// #     async fn execute(&self, _to: String, _job: &Job) -> ExecutionResult {
/// #         ExecutionResult::done()
/// #     }
/// # }
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = InMemoryJobStore::new();
/// let queue = JobQueue::new(store.clone());
///
/// SendEmail::builder()
///     .with_payload("user@example.com")
///     .with_idempotency_key("welcome-1")
///     .schedule_in(TimeDelta::minutes(5))
///     .enqueue(&queue)
///     .await
///     .unwrap();
///
/// SendEmail::builder()
///     .with_payload("admin@example.com")
///     .enqueue(&queue)
///     .await
///     .unwrap();
///
/// assert_enqueued!(
///     to: store,
///     with_payload: "user@example.com",
///     due_after: Utc::now(),
///     for_executor: SendEmail
/// );
///
/// assert_enqueued!(
///     1 job,
///     to: store,
///     with_idempotency_key: "welcome-1",
///     for_executor: SendEmail
/// );
///
/// assert_enqueued!(
///     2 jobs,
///     to: store,
///     with_status: JobStatus::Pending,
///     due_before: Utc::now() + TimeDelta::hours(1),
///     for_executor: "send_email"
/// );
/// # });
/// ```
#[macro_export]
macro_rules! assert_enqueued {
    (1 job, to: $store:ident, $($tail:tt)*) => {
        assert_enqueued!(@internal 1 to: $store, $($tail)*);
    };
    ($n:literal jobs, to: $store:ident, $($tail:tt)*) => {
        assert_enqueued!(@internal $n to: $store, $($tail)*);
    };
    (to: $store:ident, $($tail:tt)*) => {
        assert_enqueued!(@internal any to: $store, $($tail)*);
    };
    (@internal any to: $store:ident, $($tail:tt)*) => {{
        use $crate::store::Query;
        use $crate::store::JobStore;
        let mut queries = Vec::new();
        assert_enqueued!(@query queries; $($tail)*);
        let jobs = $store.query(Query::And(queries)).await.unwrap();
        let all_jobs = $store.query(Query::All).await.unwrap();
        assert!(
            !jobs.is_empty(),
            "No jobs enqueued {}\n\nAll enqueued jobs:\n{all_jobs:#?}",
            stringify!($($tail)*)
        );
    }};
    (@internal $n:literal to: $store:ident, $($tail:tt)*) => {{
        use $crate::store::Query;
        use $crate::store::JobStore;
        let mut queries = Vec::new();
        assert_enqueued!(@query queries; $($tail)*);
        let jobs = $store.query(Query::And(queries)).await.unwrap();
        let all_jobs = $store.query(Query::All).await.unwrap();
        assert!(
            jobs.len() == $n,
            "Unexpected number of jobs enqueued {},\n\n\
            Expected {} jobs, found {} matching job enqueued:\n\n\
            Matching jobs:\n\
            {jobs:#?}\n\n\
            All enqueued jobs:\n\
            {all_jobs:#?}",
            stringify!($($tail)*),
            $n,
            jobs.len(),
        );
    }};
    (@query $vec:ident; with_payload: $payload:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::PayloadEquals(serde_json::to_value($payload).unwrap()));
        $(assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; with_status: $status:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::StatusEqual($status));
        $(assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; with_idempotency_key: $key:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::IdempotencyKeyEqual($key));
        $(assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; due_before: $due_before:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::NextRunAtBefore($due_before));
        $(assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; due_after: $due_after:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::NextRunAtAfter($due_after));
        $(assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; for_executor: $job_type:literal $(, $($tail:tt)*)?) => {
        $vec.push(Query::JobTypeEqual($job_type));
        $(assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; for_executor: $executor:path $(, $($tail:tt)*)?) => {
        $vec.push(Query::JobTypeEqual(<$executor as $crate::executor::Executor>::NAME));
        $(assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident;) => {};
}

pub use assert_enqueued;
