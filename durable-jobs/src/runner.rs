//! The poll loop that claims due jobs and dispatches them to their handlers.
//!
//! A runner claims at most as many jobs as it has free capacity, executes each in its own task
//! and records the outcome under its claim. Several runners, in one process or many, may share
//! a store; the store's conditional writes are the only coordination between them.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{Notify, Semaphore},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::{
    cache::{CacheMirror, NoopCache},
    config::RunnerConfig,
    events::{EventSink, JobEvent, TracingEventSink},
    handler::HandlerRegistry,
    job::{JobStatus, RunnerId},
    store::{JobStore, ReclaimReason, ReclaimedJob, StoreError},
    JobsError,
};

mod dispatch;

pub use dispatch::{Failure, FailureKind};

pub struct JobRunner<S> {
    store: S,
    registry: Arc<HandlerRegistry>,
    cache: Arc<dyn CacheMirror>,
    events: Arc<dyn EventSink>,
    config: Arc<RunnerConfig>,
    runner_id: RunnerId,
    permits: Arc<Semaphore>,
    wake: Arc<Notify>,
}

impl<S: Clone> Clone for JobRunner<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            cache: self.cache.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
            runner_id: self.runner_id.clone(),
            permits: self.permits.clone(),
            wake: self.wake.clone(),
        }
    }
}

impl<S> std::fmt::Debug for JobRunner<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("runner_id", &self.runner_id)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("available", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl<S> JobRunner<S>
where
    S: JobStore + Clone + 'static,
{
    /// Creates a runner, rejecting invalid configurations.
    pub fn new(store: S, registry: HandlerRegistry, config: RunnerConfig) -> Result<Self, JobsError> {
        config.validate()?;
        let runner_id = config.runner_id.clone().unwrap_or_else(RunnerId::generate);
        Ok(Self {
            store,
            registry: Arc::new(registry),
            cache: Arc::new(NoopCache),
            events: Arc::new(TracingEventSink),
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config: Arc::new(config),
            runner_id,
            wake: Arc::new(Notify::new()),
        })
    }

    pub fn with_cache(self, cache: Arc<dyn CacheMirror>) -> Self {
        Self { cache, ..self }
    }

    pub fn with_event_sink(self, events: Arc<dyn EventSink>) -> Self {
        Self { events, ..self }
    }

    /// Shares a wake signal, typically with [`crate::queue::JobQueue::with_waker`].
    pub fn with_waker(self, wake: Arc<Notify>) -> Self {
        Self { wake, ..self }
    }

    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn runner_id(&self) -> &RunnerId {
        &self.runner_id
    }

    /// Number of jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrency - self.permits.available_permits()
    }

    /// Runs the poll loop in a new task until `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> RunnerHandle {
        let runner_id = self.runner_id.clone();
        let handle = tokio::spawn({
            let token = token.clone();
            async move { self.run(token).await }
        });
        RunnerHandle {
            runner_id,
            token,
            handle: Some(handle),
        }
    }

    /// Runs the poll loop until `token` is cancelled, then waits up to the configured shutdown
    /// timeout for in-flight jobs.
    #[instrument(skip_all, fields(runner_id = %self.runner_id))]
    pub async fn run(&self, token: CancellationToken) {
        tracing::info!(
            registry = ?self.registry,
            "Starting job runner {}",
            self.runner_id
        );
        let mut next_reclaim = Instant::now();
        let mut consecutive_failures: u32 = 0;

        loop {
            if Instant::now() >= next_reclaim {
                let _ = self.reclaim_once().await.inspect_err(|error| {
                    tracing::error!(?error, "Failed to reclaim stale jobs: {error}")
                });
                next_reclaim = Instant::now() + self.config.reclaim_interval;
            }

            let delay = match self.poll_once().await {
                Ok(_) => {
                    consecutive_failures = 0;
                    self.idle_delay().await
                }
                Err(error) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let delay = self.config.degraded_poll_delay(consecutive_failures);
                    tracing::error!(
                        ?error,
                        consecutive_failures,
                        "Failed to claim jobs, polling again in {delay:?}: {error}"
                    );
                    delay
                }
            };
            let delay = delay.min(next_reclaim.saturating_duration_since(Instant::now()));

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!("Shutting down job runner {}", self.runner_id);
        self.drain().await;
    }

    /// Claims as many due jobs as there is capacity for and dispatches them.
    ///
    /// Returns the number of jobs claimed.
    pub async fn poll_once(&self) -> Result<usize, StoreError> {
        let capacity = self.permits.available_permits();
        if capacity == 0 {
            return Ok(0);
        }

        let now = Utc::now();
        let jobs = self
            .store
            .claim_next_batch(&self.runner_id, capacity, now)
            .await?;

        if jobs.len() < capacity {
            let _ = self.cache.evict_due(now).await.inspect_err(|error| {
                tracing::warn!(?error, "Failed to evict due pointers from the cache")
            });
        }
        if !jobs.is_empty() {
            let ids: Vec<_> = jobs.iter().map(|job| job.id).collect();
            let _ = self.cache.forget(&ids).await.inspect_err(|error| {
                tracing::warn!(?error, "Failed to drop claimed jobs from the cache")
            });
        }

        let claimed = jobs.len();
        for job in jobs {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                tracing::error!(
                    job_id = %job.id,
                    "No capacity for claimed job {}, it will be reclaimed once its lock is stale",
                    job.id
                );
                continue;
            };
            self.events.emit(JobEvent::new(
                job.id,
                &job.job_type,
                JobStatus::Running,
                job.attempts,
            ));

            let runner = self.clone();
            tokio::spawn(
                async move {
                    runner.execute_job(job).await;
                    drop(permit);
                    runner.wake.notify_one();
                }
                .in_current_span(),
            );
        }

        Ok(claimed)
    }

    /// Recovers jobs abandoned by crashed runners and dead-letters expired jobs.
    pub async fn reclaim_once(&self) -> Result<Vec<ReclaimedJob>, StoreError> {
        let reclaimed = self
            .store
            .reclaim_stale(self.config.stale_lock_threshold, Utc::now())
            .await?;

        for job in &reclaimed {
            let job_id = job.id;
            match job.reason {
                ReclaimReason::Expired => {
                    tracing::warn!(%job_id, "Job {job_id} expired and was dead-lettered")
                }
                ReclaimReason::StaleLock => tracing::warn!(
                    %job_id,
                    status = %job.status,
                    "Reclaimed {job_id} from a runner that stopped responding, now {}",
                    job.status
                ),
            }
            self.events
                .emit(JobEvent::new(job_id, &job.job_type, job.status, job.attempts));
        }

        Ok(reclaimed)
    }

    /// Waits until no jobs are executing.
    pub async fn wait_idle(&self) {
        let _ = self.permits.acquire_many(self.all_permits()).await;
    }

    async fn idle_delay(&self) -> Duration {
        let poll_interval = self.config.poll_interval;
        if self.permits.available_permits() == 0 {
            return poll_interval;
        }
        match self.cache.next_due_at().await {
            Ok(Some(due_at)) => (due_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(poll_interval),
            Ok(None) => poll_interval,
            Err(error) => {
                tracing::warn!(?error, "Failed to read the next due time from the cache");
                poll_interval
            }
        }
    }

    async fn drain(&self) {
        let in_flight = self.in_flight();
        if in_flight == 0 {
            return;
        }
        tracing::info!(in_flight, "Waiting for {in_flight} in-flight jobs to finish");
        match tokio::time::timeout(
            self.config.shutdown_timeout,
            self.permits.acquire_many(self.all_permits()),
        )
        .await
        {
            Ok(_) => tracing::debug!("All in-flight jobs finished"),
            Err(_elapsed) => tracing::warn!(
                in_flight = self.in_flight(),
                "Shutdown timeout elapsed with jobs still running, they will be reclaimed once their locks are stale"
            ),
        }
    }

    fn all_permits(&self) -> u32 {
        u32::try_from(self.config.max_concurrency).unwrap_or(u32::MAX)
    }
}

/// Handle to a runner spawned with [`JobRunner::spawn`].
#[derive(Debug)]
pub struct RunnerHandle {
    runner_id: RunnerId,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl RunnerHandle {
    pub fn runner_id(&self) -> &RunnerId {
        &self.runner_id
    }

    /// Stops claiming new jobs and waits for the runner to drain.
    pub async fn graceful_shutdown(&mut self) -> Result<(), JobsError> {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|_| JobsError::GracefulShutdownFailed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeDelta;

    use super::*;
    use crate::{
        backoff::BackoffStrategy,
        config::StoreRetryPolicy,
        events::ChannelEventSink,
        handler::{test::Succeed, ExecutionResult, HandlerError, JobHandler},
        job::{Job, JobId},
        queue::{EnqueueOptions, JobQueue},
        store::{memory::InMemoryJobStore, Query},
    };

    fn config() -> RunnerConfig {
        RunnerConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_reclaim_interval(Duration::from_millis(50))
            .with_backoff(
                BackoffStrategy::exponential(TimeDelta::milliseconds(1))
                    .with_max(TimeDelta::milliseconds(10)),
            )
            .with_store_retry(StoreRetryPolicy {
                max_attempts: 5,
                backoff: BackoffStrategy::exponential(TimeDelta::milliseconds(1)),
            })
    }

    async fn wait_for_status(store: &InMemoryJobStore, id: JobId, status: JobStatus) -> Job {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(Some(job)) = store.get(id).await {
                    if job.status == status {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{id} never reached {status}"))
    }

    /// Fails the first `failures` invocations.
    struct Flaky {
        calls: Arc<AtomicU16>,
        failures: u16,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _job: &Job) -> ExecutionResult {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                HandlerError::new("smtp refused").into()
            } else {
                ExecutionResult::done()
            }
        }
    }

    struct Sleep(Duration);

    #[async_trait]
    impl JobHandler for Sleep {
        async fn handle(&self, _job: &Job) -> ExecutionResult {
            tokio::time::sleep(self.0).await;
            ExecutionResult::done()
        }
    }

    /// Blocks its thread without yielding.
    struct BlockingSleep(Duration);

    #[async_trait]
    impl JobHandler for BlockingSleep {
        async fn handle(&self, _job: &Job) -> ExecutionResult {
            std::thread::sleep(self.0);
            ExecutionResult::done()
        }

        fn is_blocking(&self) -> bool {
            true
        }
    }

    /// Asks for more time than a lock lasts.
    struct Overrun {
        calls: Arc<AtomicU16>,
    }

    #[async_trait]
    impl JobHandler for Overrun {
        async fn handle(&self, _job: &Job) -> ExecutionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
            ExecutionResult::done()
        }

        fn timeout(&self, _job: &Job) -> Option<Duration> {
            Some(Duration::from_secs(60))
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn handle(&self, _job: &Job) -> ExecutionResult {
            panic!("boom")
        }
    }

    #[derive(Default)]
    struct Peak {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    struct Tracked(Arc<Peak>);

    #[async_trait]
    impl JobHandler for Tracked {
        async fn handle(&self, _job: &Job) -> ExecutionResult {
            let current = self.0.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.current.fetch_sub(1, Ordering::SeqCst);
            ExecutionResult::done()
        }
    }

    fn options() -> EnqueueOptions {
        EnqueueOptions::default()
    }

    #[tokio::test]
    async fn retries_until_success() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let calls = Arc::new(AtomicU16::new(0));
        let registry = HandlerRegistry::new().with_handler(
            "send_email",
            Flaky {
                calls: calls.clone(),
                failures: 2,
            },
        );
        let id = queue
            .enqueue(
                "send_email",
                serde_json::json!({"to": "a@example.com"}),
                options().with_max_attempts(3),
            )
            .await
            .unwrap();

        let mut handle = JobRunner::new(store.clone(), registry, config())
            .unwrap()
            .spawn(CancellationToken::new());

        let job = wait_for_status(&store, id, JobStatus::Completed).await;
        assert_eq!(job.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(job.locked_by.is_none());
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_enqueue_runs_once() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let calls = Arc::new(AtomicU16::new(0));
        let registry = HandlerRegistry::new().with_handler(
            "send_email",
            Flaky {
                calls: calls.clone(),
                failures: 0,
            },
        );

        let first = queue
            .enqueue("send_email", (), options().with_idempotency_key("order-42"))
            .await
            .unwrap();
        let second = queue
            .enqueue("send_email", (), options().with_idempotency_key("order-42"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.query(Query::All).await.unwrap().len(), 1);

        let mut handle = JobRunner::new(store.clone(), registry, config())
            .unwrap()
            .spawn(CancellationToken::new());
        wait_for_status(&store, first, JobStatus::Completed).await;
        handle.graceful_shutdown().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregistered_job_type_is_dead_lettered() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let id = queue
            .enqueue("unregistered_type", (), options())
            .await
            .unwrap();

        let mut handle = JobRunner::new(store.clone(), HandlerRegistry::new(), config())
            .unwrap()
            .spawn(CancellationToken::new());

        let job = wait_for_status(&store, id, JobStatus::DeadLetter).await;
        assert_eq!(job.attempts, 1);
        assert!(job
            .error_message
            .unwrap()
            .starts_with("configuration fault"));
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn expired_job_is_dead_lettered_without_dispatch() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let calls = Arc::new(AtomicU16::new(0));
        let registry = HandlerRegistry::new().with_handler(
            "send_email",
            Flaky {
                calls: calls.clone(),
                failures: 0,
            },
        );
        let id = queue
            .enqueue(
                "send_email",
                (),
                options().with_expires_at(Utc::now() - TimeDelta::seconds(1)),
            )
            .await
            .unwrap();

        let runner = JobRunner::new(store.clone(), registry, config()).unwrap();
        let reclaimed = runner.reclaim_once().await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].reason, ReclaimReason::Expired);

        assert_eq!(runner.poll_once().await.unwrap(), 0);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::DeadLetter);
        assert_eq!(job.attempts, 0);
        assert!(job.error_message.unwrap().starts_with("expired"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn startup_reclaims_jobs_abandoned_by_crashed_runner() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let id = queue.enqueue("send_email", (), options()).await.unwrap();
        let crashed = RunnerId::from("crashed");
        assert_eq!(
            store
                .claim_next_batch(&crashed, 1, Utc::now())
                .await
                .unwrap()
                .len(),
            1
        );

        let config = config()
            .with_stale_lock_threshold(TimeDelta::milliseconds(50))
            .with_default_timeout(Some(Duration::from_millis(20)))
            .with_reclaim_interval(Duration::from_millis(20));
        let registry = HandlerRegistry::new().with_handler("send_email", Succeed);
        let mut handle = JobRunner::new(store.clone(), registry, config)
            .unwrap()
            .spawn(CancellationToken::new());

        let job = wait_for_status(&store, id, JobStatus::Completed).await;
        assert_eq!(job.attempts, 2);
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn discarded_job_is_dead_lettered_immediately() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let registry = HandlerRegistry::new().with_fn("send_email", |_payload| async {
            ExecutionResult::discard("invalid address")
        });
        let id = queue
            .enqueue("send_email", (), options().with_max_attempts(5))
            .await
            .unwrap();

        let mut handle = JobRunner::new(store.clone(), registry, config())
            .unwrap()
            .spawn(CancellationToken::new());

        let job = wait_for_status(&store, id, JobStatus::DeadLetter).await;
        assert_eq!(job.attempts, 1);
        assert_eq!(
            job.error_message.as_deref(),
            Some("permanent failure: invalid address")
        );
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn timed_out_job_is_dead_lettered_on_final_attempt() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let registry =
            HandlerRegistry::new().with_handler("send_email", Sleep(Duration::from_secs(10)));
        let id = queue
            .enqueue("send_email", (), options().with_max_attempts(2))
            .await
            .unwrap();

        let config = config().with_default_timeout(Some(Duration::from_millis(20)));
        let mut handle = JobRunner::new(store.clone(), registry, config)
            .unwrap()
            .spawn(CancellationToken::new());

        let job = wait_for_status(&store, id, JobStatus::DeadLetter).await;
        assert_eq!(job.attempts, 2);
        assert!(job.error_message.unwrap().starts_with("timeout"));
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn blocking_handler_is_timed_out() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let registry = HandlerRegistry::new()
            .with_handler("resize_image", BlockingSleep(Duration::from_millis(500)));
        let id = queue
            .enqueue("resize_image", (), options().with_max_attempts(1))
            .await
            .unwrap();

        let config = config().with_default_timeout(Some(Duration::from_millis(20)));
        let started = Instant::now();
        let mut handle = JobRunner::new(store.clone(), registry, config)
            .unwrap()
            .spawn(CancellationToken::new());

        let job = wait_for_status(&store, id, JobStatus::DeadLetter).await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(job.attempts, 1);
        assert!(job.error_message.unwrap().starts_with("timeout"));
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn handler_timeout_is_capped_below_stale_lock_threshold() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let calls = Arc::new(AtomicU16::new(0));
        let registry = HandlerRegistry::new().with_handler(
            "send_email",
            Overrun {
                calls: calls.clone(),
            },
        );
        let id = queue
            .enqueue("send_email", (), options().with_max_attempts(1))
            .await
            .unwrap();

        let config = config()
            .with_stale_lock_threshold(TimeDelta::seconds(1))
            .with_default_timeout(None)
            .with_reclaim_interval(Duration::from_millis(20));
        let mut handle = JobRunner::new(store.clone(), registry, config)
            .unwrap()
            .spawn(CancellationToken::new());

        let job = wait_for_status(&store, id, JobStatus::DeadLetter).await;
        assert_eq!(job.attempts, 1);
        assert!(job.error_message.unwrap().starts_with("timeout"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn panicking_handler_does_not_crash_the_runner() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let registry = HandlerRegistry::new()
            .with_handler("explode", Panics)
            .with_handler("send_email", Succeed);
        let exploded = queue
            .enqueue("explode", (), options().with_max_attempts(1))
            .await
            .unwrap();

        let mut handle = JobRunner::new(store.clone(), registry, config())
            .unwrap()
            .spawn(CancellationToken::new());

        let job = wait_for_status(&store, exploded, JobStatus::DeadLetter).await;
        assert_eq!(job.error_message.as_deref(), Some("panic: boom"));

        let id = queue.enqueue("send_email", (), options()).await.unwrap();
        wait_for_status(&store, id, JobStatus::Completed).await;
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let peak = Arc::new(Peak::default());
        let registry = HandlerRegistry::new().with_handler("send_email", Tracked(peak.clone()));
        let mut ids = Vec::new();
        for _ in 0..12 {
            ids.push(queue.enqueue("send_email", (), options()).await.unwrap());
        }

        let mut handle = JobRunner::new(store.clone(), registry, config().with_max_concurrency(3))
            .unwrap()
            .spawn(CancellationToken::new());

        for id in ids {
            wait_for_status(&store, id, JobStatus::Completed).await;
        }
        handle.graceful_shutdown().await.unwrap();

        let peak = peak.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency was {peak}");
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn poll_once_claims_nothing_without_capacity() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let registry =
            HandlerRegistry::new().with_handler("send_email", Sleep(Duration::from_millis(50)));
        queue.enqueue("send_email", (), options()).await.unwrap();
        queue.enqueue("send_email", (), options()).await.unwrap();

        let runner = JobRunner::new(store.clone(), registry, config().with_max_concurrency(1))
            .unwrap();

        assert_eq!(runner.poll_once().await.unwrap(), 1);
        assert_eq!(runner.in_flight(), 1);
        assert_eq!(runner.poll_once().await.unwrap(), 0);

        runner.wait_idle().await;
        assert_eq!(runner.poll_once().await.unwrap(), 1);
        runner.wait_idle().await;
    }

    #[tokio::test]
    async fn emits_an_event_per_transition() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let (sink, mut events) = ChannelEventSink::new();
        let registry = HandlerRegistry::new().with_handler(
            "send_email",
            Flaky {
                calls: Arc::new(AtomicU16::new(0)),
                failures: 1,
            },
        );
        let id = queue.enqueue("send_email", (), options()).await.unwrap();

        let mut handle = JobRunner::new(store.clone(), registry, config())
            .unwrap()
            .with_event_sink(Arc::new(sink))
            .spawn(CancellationToken::new());

        let mut transitions = Vec::new();
        while let Some(event) = events.recv().await {
            assert_eq!(event.job_id, id);
            let done = event.status == JobStatus::Completed;
            transitions.push((event.status, event.attempts, event.duration.is_some()));
            if done {
                break;
            }
        }
        handle.graceful_shutdown().await.unwrap();

        assert_eq!(
            transitions,
            vec![
                (JobStatus::Running, 1, false),
                (JobStatus::Pending, 1, true),
                (JobStatus::Running, 2, false),
                (JobStatus::Completed, 2, true),
            ]
        );
    }

    #[tokio::test]
    async fn survives_store_outage() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let registry = HandlerRegistry::new().with_handler("send_email", Succeed);
        let id = queue.enqueue("send_email", (), options()).await.unwrap();
        store.simulate_outage(3);

        let mut handle = JobRunner::new(store.clone(), registry, config())
            .unwrap()
            .spawn(CancellationToken::new());

        wait_for_status(&store, id, JobStatus::Completed).await;
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_wakes_an_idle_runner() {
        let store = InMemoryJobStore::new();
        let registry = HandlerRegistry::new().with_handler("send_email", Succeed);
        let runner = JobRunner::new(
            store.clone(),
            registry,
            config()
                .with_poll_interval(Duration::from_secs(60))
                .with_reclaim_interval(Duration::from_secs(60)),
        )
        .unwrap();
        let queue = JobQueue::new(store.clone()).with_waker(runner.waker());
        let mut handle = runner.spawn(CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = queue.enqueue("send_email", (), options()).await.unwrap();

        wait_for_status(&store, id, JobStatus::Completed).await;
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn graceful_shutdown_waits_for_in_flight_jobs() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let registry =
            HandlerRegistry::new().with_handler("send_email", Sleep(Duration::from_millis(100)));
        let id = queue.enqueue("send_email", (), options()).await.unwrap();

        let mut handle = JobRunner::new(store.clone(), registry, config())
            .unwrap()
            .spawn(CancellationToken::new());
        wait_for_status(&store, id, JobStatus::Running).await;

        handle.graceful_shutdown().await.unwrap();

        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn graceful_shutdown_gives_up_after_timeout() {
        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let registry =
            HandlerRegistry::new().with_handler("send_email", Sleep(Duration::from_secs(30)));
        let id = queue.enqueue("send_email", (), options()).await.unwrap();

        let config = config()
            .with_default_timeout(None)
            .with_shutdown_timeout(Duration::from_millis(20));
        let mut handle = JobRunner::new(store.clone(), registry, config)
            .unwrap()
            .spawn(CancellationToken::new());
        wait_for_status(&store, id, JobStatus::Running).await;

        handle.graceful_shutdown().await.unwrap();

        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn handler_backoff_overrides_runner_backoff() {
        struct SlowRetry;

        #[async_trait]
        impl JobHandler for SlowRetry {
            async fn handle(&self, _job: &Job) -> ExecutionResult {
                HandlerError::new("try later").into()
            }

            fn backoff(&self, _job: &Job) -> Option<TimeDelta> {
                Some(TimeDelta::hours(1))
            }
        }

        let store = InMemoryJobStore::new();
        let queue = JobQueue::new(store.clone());
        let id = queue.enqueue("send_email", (), options()).await.unwrap();
        let runner = JobRunner::new(
            store.clone(),
            HandlerRegistry::new().with_handler("send_email", SlowRetry),
            config(),
        )
        .unwrap();

        assert_eq!(runner.poll_once().await.unwrap(), 1);
        runner.wait_idle().await;

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.next_run_at > Utc::now() + TimeDelta::minutes(59));
        assert_eq!(
            job.error_message.as_deref(),
            Some("transient failure: try later")
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = JobRunner::new(
            InMemoryJobStore::new(),
            HandlerRegistry::new(),
            config().with_max_concurrency(0),
        );
        assert!(matches!(result, Err(JobsError::InvalidConfig(_))));
    }

    #[test]
    fn configured_runner_id_is_used() {
        let runner = JobRunner::new(
            InMemoryJobStore::new(),
            HandlerRegistry::new(),
            config().with_runner_id("worker-1"),
        )
        .unwrap();
        assert_eq!(runner.runner_id().as_str(), "worker-1");
    }
}
