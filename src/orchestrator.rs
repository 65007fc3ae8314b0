//! Drives a batch of work items to completion.
//!
//! Per item: rate-limit token, Pending → Processing, then an attempt loop
//! around the injected [`WorkExecutor`] with bounded retries, deduplication of
//! successful results, health recording, result persistence and
//! checkpointing. Parallel and sequential modes run the same per-item logic
//! and differ only in how many items are in flight.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, ResultPointer, ResumePlan, plan_resume};
use crate::dedup::Deduplicator;
use crate::error::{ExecutionError, JobError};
use crate::executor::{WorkExecutor, WorkRequest};
use crate::health::{HealthMonitor, Outcome};
use crate::item::{ExecutionMode, ItemError, JobConfig, JobResult, SkipReason, WorkItem};
use crate::output::ResultSink;
use crate::rate_limit::RateLimiter;

/// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Progress callbacks. All methods default to no-ops.
pub trait JobObserver: Send + Sync {
    /// `total` includes the `resumed` items restored from the checkpoint.
    fn job_started(&self, _total: usize, _resumed: usize) {}
    fn item_started(&self, _item: &WorkItem) {}
    fn item_retrying(&self, _item: &WorkItem, _error: &ExecutionError, _delay: Duration) {}
    fn item_finished(&self, _item: &WorkItem) {}
}

/// Runs jobs against one executor.
///
/// Collaborators are shared handles: pass the same [`Deduplicator`] or
/// [`HealthMonitor`] to several orchestrators to share state across runs.
pub struct Orchestrator {
    config: JobConfig,
    executor: Arc<dyn WorkExecutor>,
    rate_limiter: Arc<RateLimiter>,
    deduplicator: Arc<Deduplicator>,
    health: Arc<HealthMonitor>,
    checkpoint: Option<Arc<CheckpointStore>>,
    sink: Option<Arc<dyn ResultSink>>,
    observer: Option<Arc<dyn JobObserver>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// An orchestrator with private collaborators: a fresh rate limiter,
    /// deduplicator and health monitor, and no checkpoint, sink or observer.
    pub fn new(config: JobConfig, executor: Arc<dyn WorkExecutor>) -> Self {
        Self {
            config,
            executor,
            rate_limiter: Arc::new(RateLimiter::new()),
            deduplicator: Arc::new(Deduplicator::new()),
            health: Arc::new(HealthMonitor::default()),
            checkpoint: None,
            sink: None,
            observer: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a rate limiter, e.g. with other jobs hitting the same destination.
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    /// Share result hashes with other runs.
    pub fn with_deduplicator(mut self, deduplicator: Arc<Deduplicator>) -> Self {
        self.deduplicator = deduplicator;
        self
    }

    /// Record destination health into `health`.
    pub fn with_health_monitor(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = health;
        self
    }

    /// Resume from, and save progress to, `store`.
    pub fn with_checkpoint_store(mut self, store: Arc<CheckpointStore>) -> Self {
        self.checkpoint = Some(store);
        self
    }

    /// Make every terminal item durable through `sink`.
    pub fn with_result_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Report progress to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Use an externally owned cancellation signal.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels the job when fired.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The configuration this orchestrator runs with.
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Process `items` and aggregate the outcome.
    ///
    /// Items already completed according to the attached checkpoint are
    /// restored, not dispatched. Only configuration, checkpoint and
    /// result-persistence failures (or a panic outside the executor) make
    /// this return `Err`; individual item failures are reported in the
    /// [`JobResult`].
    pub async fn run(&self, items: Vec<WorkItem>) -> Result<JobResult, JobError> {
        self.config.validate()?;
        let job_id = Uuid::new_v4();
        let started_at = Utc::now();
        let destination = self.config.destination.clone();

        let ResumePlan { completed, pending } = match &self.checkpoint {
            Some(store) => plan_resume(&store.load().await?, items),
            None => ResumePlan {
                completed: Vec::new(),
                pending: items,
            },
        };

        if let Some(limit) = &self.config.rate_limit {
            self.rate_limiter.configure(&destination, limit).await;
        }

        let total = completed.len() + pending.len();
        tracing::info!(
            %job_id,
            destination = %destination,
            total,
            resumed = completed.len(),
            mode = ?self.config.mode,
            concurrency = self.config.effective_concurrency(),
            "job started"
        );
        if let Some(observer) = &self.observer {
            observer.job_started(total, completed.len());
        }

        let runner = Arc::new(ItemRunner::new(self));
        match self.config.mode {
            ExecutionMode::Sequential => run_sequential(&runner, pending).await,
            ExecutionMode::Parallel => run_parallel(&runner, pending).await,
        }
        runner.flush_checkpoint().await;

        if let Some(err) = runner.fatal.lock().await.take() {
            tracing::error!(%job_id, error = %err, "job halted");
            return Err(err);
        }

        let mut items = completed;
        items.append(&mut *runner.finished.lock().await);
        if self.config.mode == ExecutionMode::Sequential {
            items.sort_by_key(|item| item.position);
        }

        let mut result = JobResult::from_items(job_id, destination, items, started_at);
        result.aborted = runner.aborted.load(Ordering::SeqCst);
        result.cancelled = self.cancel.is_cancelled();
        result.destination_health = Some(self.health.snapshot().await);

        tracing::info!(
            %job_id,
            total = result.total,
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            resumed = result.resumed,
            aborted = result.aborted,
            cancelled = result.cancelled,
            duration_ms = result.duration_ms(),
            "job finished"
        );
        Ok(result)
    }
}

async fn run_sequential(runner: &Arc<ItemRunner>, pending: Vec<WorkItem>) {
    for item in pending {
        if runner.dispatch.is_cancelled() {
            runner.skip_undispatched(item).await;
        } else {
            runner.process_guarded(item).await;
        }
    }
}

async fn run_parallel(runner: &Arc<ItemRunner>, pending: Vec<WorkItem>) {
    let semaphore = Arc::new(Semaphore::new(runner.config.effective_concurrency()));
    let mut tasks = JoinSet::new();

    for item in pending {
        if runner.dispatch.is_cancelled() {
            runner.skip_undispatched(item).await;
            continue;
        }
        let permit = tokio::select! {
            biased;
            _ = runner.dispatch.cancelled() => None,
            permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            runner.skip_undispatched(item).await;
            continue;
        };

        let runner = Arc::clone(runner);
        tasks.spawn(async move {
            runner.process_guarded(item).await;
            drop(permit);
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            // Only reachable if the task is aborted; panics are caught inside.
            tracing::error!(error = %e, "item task did not complete");
        }
    }
}

/// How an item's attempt loop ended.
enum Settled {
    Completed(Value),
    Failed(ExecutionError),
    Interrupted,
}

/// Per-run state and the per-item logic shared by both dispatch modes.
struct ItemRunner {
    config: JobConfig,
    executor: Arc<dyn WorkExecutor>,
    rate_limiter: Arc<RateLimiter>,
    deduplicator: Arc<Deduplicator>,
    health: Arc<HealthMonitor>,
    checkpoint: Option<Arc<CheckpointStore>>,
    sink: Option<Arc<dyn ResultSink>>,
    observer: Option<Arc<dyn JobObserver>>,
    /// Interrupts in-flight work after the grace period. Fired by the
    /// caller's token or by a fatal error.
    halt: CancellationToken,
    /// Stops new dispatch. Child of `halt`, also fired on abort.
    dispatch: CancellationToken,
    aborted: AtomicBool,
    fatal: Mutex<Option<JobError>>,
    /// Terminal items, in completion order.
    finished: Mutex<Vec<WorkItem>>,
    /// Newly terminal items not yet written to the checkpoint.
    unflushed: Mutex<Vec<(String, ResultPointer)>>,
}

impl ItemRunner {
    fn new(orchestrator: &Orchestrator) -> Self {
        let halt = orchestrator.cancel.child_token();
        let dispatch = halt.child_token();
        Self {
            config: orchestrator.config.clone(),
            executor: Arc::clone(&orchestrator.executor),
            rate_limiter: Arc::clone(&orchestrator.rate_limiter),
            deduplicator: Arc::clone(&orchestrator.deduplicator),
            health: Arc::clone(&orchestrator.health),
            checkpoint: orchestrator.checkpoint.clone(),
            sink: orchestrator.sink.clone(),
            observer: orchestrator.observer.clone(),
            halt,
            dispatch,
            aborted: AtomicBool::new(false),
            fatal: Mutex::new(None),
            finished: Mutex::new(Vec::new()),
            unflushed: Mutex::new(Vec::new()),
        }
    }

    fn destination(&self) -> &str {
        &self.config.destination
    }

    /// Deadline for an attempt starting now. Timeouts past the clock's range
    /// mean no deadline.
    fn deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.config.item_timeout).unwrap_or_else(|| now + FAR_FUTURE)
    }

    /// [`process`](Self::process) with a panic turned into a fatal job error.
    async fn process_guarded(&self, item: WorkItem) {
        let id = item.id.clone();
        if let Err(panic) = AssertUnwindSafe(self.process(item)).catch_unwind().await {
            let message = panic_message(panic.as_ref());
            self.fail_job(JobError::ItemPanicked { id, message }).await;
        }
    }

    async fn process(&self, mut item: WorkItem) {
        // `dispatch` is a child of `halt`, so this also covers cancellation.
        let acquired = tokio::select! {
            biased;
            _ = self.dispatch.cancelled() => false,
            _ = self.rate_limiter.acquire(self.destination()) => true,
        };
        if !acquired {
            self.skip_undispatched(item).await;
            return;
        }

        if let Err(e) = item.start() {
            self.fail_job(e).await;
            self.finished.lock().await.push(item);
            return;
        }
        if let Some(observer) = &self.observer {
            observer.item_started(&item);
        }
        tracing::debug!(item = %item.id, "item started");

        let settled = self.attempt_loop(&mut item).await;
        let transition = match settled {
            Settled::Completed(value) => self.complete(&mut item, value).await,
            Settled::Failed(error) => {
                tracing::debug!(item = %item.id, attempts = item.attempts, %error, "item failed");
                let failed = item.fail(ItemError::from(&error));
                if failed.is_ok() && !self.config.continue_on_error {
                    self.abort(&item);
                }
                failed
            }
            Settled::Interrupted => item.skip(SkipReason::Cancelled),
        };
        if let Err(e) = transition {
            self.fail_job(e).await;
        }

        self.settle(item).await;
    }

    async fn attempt_loop(&self, item: &mut WorkItem) -> Settled {
        let retry = &self.config.retry;
        loop {
            let attempt = item.begin_attempt();
            let request = WorkRequest::for_item(item, self.destination(), self.deadline());

            let started = Instant::now();
            let Some(outcome) = self.attempt(&request).await else {
                tracing::debug!(item = %item.id, attempt, "attempt interrupted");
                return Settled::Interrupted;
            };
            let latency_ms = started.elapsed().as_millis() as u64;
            let health_outcome = if outcome.is_ok() {
                Outcome::Success
            } else {
                Outcome::Failure
            };
            self.health
                .record(self.destination(), health_outcome, latency_ms)
                .await;

            let error = match outcome {
                Ok(value) => return Settled::Completed(value),
                Err(error) => error,
            };
            if !error.is_retryable() || attempt >= retry.max_attempts {
                return Settled::Failed(error);
            }

            let backoff = retry.delay_for_attempt(attempt);
            let delay = error.retry_after.map_or(backoff, |after| after.max(backoff));
            tracing::warn!(
                item = %item.id,
                attempt,
                max_attempts = retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                %error,
                "retrying item"
            );
            if let Some(observer) = &self.observer {
                observer.item_retrying(item, &error, delay);
            }

            let resumed = tokio::select! {
                biased;
                _ = self.halt.cancelled() => false,
                _ = sleep(delay) => true,
            };
            if !resumed {
                return Settled::Interrupted;
            }
            let acquired = tokio::select! {
                biased;
                _ = self.halt.cancelled() => false,
                _ = self.rate_limiter.acquire(self.destination()) => true,
            };
            if !acquired {
                return Settled::Interrupted;
            }
        }
    }

    /// One call to the executor. `None` when interrupted by a halt.
    async fn attempt(&self, request: &WorkRequest) -> Option<Result<Value, ExecutionError>> {
        let timeout = self.config.item_timeout;
        let call = AssertUnwindSafe(self.executor.execute(request)).catch_unwind();
        let grace = async {
            self.halt.cancelled().await;
            sleep(self.config.cancel_grace).await;
        };

        tokio::select! {
            outcome = tokio::time::timeout(timeout, call) => Some(match outcome {
                Err(_) => Err(ExecutionError::deadline_exceeded(timeout)),
                Ok(Err(panic)) => Err(ExecutionError::permanent(format!(
                    "work function panicked: {}",
                    panic_message(panic.as_ref())
                ))),
                Ok(Ok(result)) => result,
            }),
            _ = grace => None,
        }
    }

    async fn complete(&self, item: &mut WorkItem, value: Value) -> Result<(), JobError> {
        if self.config.deduplicate
            && let Some(first_id) = self.deduplicator.record_owner(&value, &item.id).await
        {
            tracing::debug!(item = %item.id, first = %first_id, "duplicate result");
            return item.skip(SkipReason::Duplicate { first_id });
        }
        item.succeed(value)
    }

    /// Persist and checkpoint a terminal item, then record it as finished.
    async fn settle(&self, mut item: WorkItem) {
        if item.is_checkpointable() && self.persist(&mut item).await {
            self.buffer_checkpoint(&item).await;
        }

        tracing::debug!(
            item = %item.id,
            status = %item.status,
            attempts = item.attempts,
            duration_ms = item.duration_ms,
            "item finished"
        );
        if let Some(observer) = &self.observer {
            observer.item_finished(&item);
        }
        self.finished.lock().await.push(item);
    }

    /// Returns false if the result could not be made durable.
    async fn persist(&self, item: &mut WorkItem) -> bool {
        let Some(sink) = &self.sink else {
            return true;
        };
        match sink.persist(item).await {
            Ok(location) => {
                item.result_location = Some(location);
                true
            }
            Err(e) => {
                self.fail_job(e).await;
                false
            }
        }
    }

    async fn buffer_checkpoint(&self, item: &WorkItem) {
        let interval = self.config.checkpoint_interval_items;
        let Some(store) = &self.checkpoint else {
            return;
        };
        if interval == 0 {
            return;
        }

        let batch = {
            let mut unflushed = self.unflushed.lock().await;
            unflushed.push((item.id.clone(), ResultPointer::for_item(item)));
            if unflushed.len() >= interval {
                std::mem::take(&mut *unflushed)
            } else {
                Vec::new()
            }
        };
        if let Err(e) = store.append_all(batch).await {
            self.fail_job(e).await;
        }
    }

    /// Write out whatever is still buffered. Runs once at the end of a job.
    async fn flush_checkpoint(&self) {
        if self.config.checkpoint_interval_items == 0 {
            return;
        }
        let Some(store) = &self.checkpoint else {
            return;
        };
        let batch = std::mem::take(&mut *self.unflushed.lock().await);
        if let Err(e) = store.append_all(batch).await {
            self.fail_job(e).await;
        }
    }

    /// Mark an item that never ran as Skipped.
    async fn skip_undispatched(&self, mut item: WorkItem) {
        let reason = if self.aborted.load(Ordering::SeqCst) {
            SkipReason::Aborted
        } else {
            SkipReason::Cancelled
        };
        if let Err(e) = item.skip(reason) {
            self.fail_job(e).await;
        }
        if let Some(observer) = &self.observer {
            observer.item_finished(&item);
        }
        self.finished.lock().await.push(item);
    }

    fn abort(&self, item: &WorkItem) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            tracing::warn!(item = %item.id, "item failed, stopping dispatch");
        }
        self.dispatch.cancel();
    }

    /// Record the first fatal error and halt the job.
    async fn fail_job(&self, err: JobError) {
        let mut fatal = self.fatal.lock().await;
        if fatal.is_none() {
            tracing::error!(error = %err, "fatal error, halting job");
            *fatal = Some(err);
        } else {
            tracing::debug!(error = %err, "additional error after halt");
        }
        self.halt.cancel();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;
    use crate::item::{ItemStatus, RetryPolicy};
    use crate::rate_limit::RateLimit;

    /// Scripted executor: per item id, a queue of outcomes; default is to
    /// echo the payload.
    #[derive(Default)]
    struct Scripted {
        script: std::sync::Mutex<HashMap<String, Vec<Result<Value, ExecutionError>>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Scripted {
        fn with(mut self, id: &str, outcomes: Vec<Result<Value, ExecutionError>>) -> Self {
            self.script.get_mut().unwrap().insert(id.to_string(), outcomes);
            self
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl WorkExecutor for Scripted {
        async fn execute(&self, request: &WorkRequest) -> Result<Value, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            let next = {
                let mut script = self.script.lock().unwrap();
                script.get_mut(&request.item_id).and_then(|queue| {
                    if queue.is_empty() {
                        None
                    } else {
                        Some(queue.remove(0))
                    }
                })
            };
            next.unwrap_or_else(|| Ok(json!({"echo": request.payload})))
        }
    }

    struct Panicking;

    #[async_trait]
    impl WorkExecutor for Panicking {
        async fn execute(&self, _request: &WorkRequest) -> Result<Value, ExecutionError> {
            panic!("boom");
        }
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (1..=n)
            .map(|i| WorkItem::new(i.to_string(), i - 1, json!(format!("q{i}"))))
            .collect()
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1_000,
        }
    }

    fn orchestrator(config: JobConfig, executor: impl WorkExecutor + 'static) -> Orchestrator {
        Orchestrator::new(config, Arc::new(executor))
    }

    #[tokio::test]
    async fn sequential_run_preserves_input_order() {
        let config = JobConfig {
            mode: ExecutionMode::Sequential,
            ..Default::default()
        };
        let result = orchestrator(config, Scripted::default())
            .run(items(5))
            .await
            .unwrap();

        let ids: Vec<&str> = result.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4", "5"]);
        assert!(result.items.iter().all(|i| i.status == ItemStatus::Success));
        assert!(result.is_clean());
        assert_eq!(result.items[0].result, Some(json!({"echo": "q1"})));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let executor = Scripted::default().with(
            "2",
            vec![
                Err(ExecutionError::transient("reset")),
                Err(ExecutionError::transient("reset")),
            ],
        );
        let config = JobConfig {
            retry: fast_retry(3),
            ..Default::default()
        };
        let result = orchestrator(config, executor).run(items(3)).await.unwrap();

        assert_eq!(result.succeeded, 3);
        for item in &result.items {
            let expected = if item.id == "2" { 3 } else { 1 };
            assert_eq!(item.attempts, expected, "item {}", item.id);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_exponentially() {
        let executor = Scripted::default().with(
            "1",
            vec![
                Err(ExecutionError::transient("a")),
                Err(ExecutionError::transient("b")),
                Err(ExecutionError::transient("c")),
            ],
        );
        let config = JobConfig {
            retry: fast_retry(4),
            ..Default::default()
        };
        let start = Instant::now();
        let result = orchestrator(config, executor).run(items(1)).await.unwrap();

        // 100 + 200 + 400 ms of backoff
        assert_eq!(start.elapsed(), Duration::from_millis(700));
        assert_eq!(result.items[0].attempts, 4);
        assert_eq!(result.succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_extends_backoff() {
        let executor = Scripted::default().with(
            "1",
            vec![Err(ExecutionError::rate_limited(Duration::from_secs(2)))],
        );
        let config = JobConfig {
            retry: fast_retry(2),
            ..Default::default()
        };
        let start = Instant::now();
        orchestrator(config, executor).run(items(1)).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_the_item() {
        let executor = Scripted::default().with(
            "1",
            vec![
                Err(ExecutionError::transient("x")),
                Err(ExecutionError::transient("y")),
                Err(ExecutionError::transient("z")),
            ],
        );
        let config = JobConfig {
            retry: fast_retry(3),
            ..Default::default()
        };
        let result = orchestrator(config, executor).run(items(1)).await.unwrap();

        let item = &result.items[0];
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.attempts, 3);
        assert_eq!(item.error.as_ref().unwrap().message, "z");
        assert!(item.result.is_none());
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let executor =
            Scripted::default().with("1", vec![Err(ExecutionError::permanent("syntax error"))]);
        let result = orchestrator(JobConfig::default(), executor)
            .run(items(2))
            .await
            .unwrap();

        let failed: Vec<&WorkItem> = result.failures().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 1);
        assert_eq!(failed[0].error.as_ref().unwrap().kind, ErrorKind::Permanent);
        assert_eq!(result.succeeded, 1);
        assert!(!result.aborted);
    }

    #[tokio::test]
    async fn stop_on_error_skips_the_rest() {
        let executor = Scripted::default().with("2", vec![Err(ExecutionError::permanent("bad"))]);
        let config = JobConfig {
            mode: ExecutionMode::Sequential,
            continue_on_error: false,
            ..Default::default()
        };
        let result = orchestrator(config, executor).run(items(5)).await.unwrap();

        assert_eq!(result.total, 5);
        assert!(result.aborted);
        assert_eq!(result.items[0].status, ItemStatus::Success);
        assert_eq!(result.items[1].status, ItemStatus::Failed);
        for item in &result.items[2..] {
            assert_eq!(item.status, ItemStatus::Skipped);
            assert_eq!(item.skip_reason, Some(SkipReason::Aborted));
            assert_eq!(item.attempts, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_on_error_skips_items_waiting_for_a_token() {
        let executor = Scripted::default().with("1", vec![Err(ExecutionError::permanent("bad"))]);
        let config = JobConfig {
            concurrency: 8,
            continue_on_error: false,
            rate_limit: Some(RateLimit::per_second(1.0)),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(config, Arc::new(executor));
        let start = Instant::now();
        let result = orchestrator.run(items(5)).await.unwrap();

        assert!(result.aborted);
        assert_eq!(result.total, 5);
        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 4);
        for item in result.items.iter().filter(|i| i.id != "1") {
            assert_eq!(item.status, ItemStatus::Skipped, "item {}", item.id);
            assert_eq!(item.skip_reason, Some(SkipReason::Aborted));
            assert_eq!(item.attempts, 0);
        }
        // Nobody sat out their reservation.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn identical_results_are_deduplicated() {
        let executor = Scripted::default()
            .with("1", vec![Ok(json!({"b": 1, "a": 2}))])
            .with("2", vec![Ok(json!({"a": 2, "b": 1}))]);
        let config = JobConfig {
            mode: ExecutionMode::Sequential,
            deduplicate: true,
            ..Default::default()
        };
        let result = orchestrator(config, executor).run(items(2)).await.unwrap();

        assert_eq!(result.succeeded, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(
            result.items[1].skip_reason,
            Some(SkipReason::Duplicate {
                first_id: "1".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_hit_the_deadline() {
        let executor = Scripted::default().delayed(Duration::from_secs(10));
        let config = JobConfig {
            item_timeout: Duration::from_secs(1),
            retry: fast_retry(2),
            ..Default::default()
        };
        let result = orchestrator(config, executor).run(items(1)).await.unwrap();

        let item = &result.items[0];
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.attempts, 2);
        assert_eq!(item.error.as_ref().unwrap().kind, ErrorKind::DeadlineExceeded);
    }

    #[tokio::test]
    async fn panics_are_permanent_failures() {
        let result = orchestrator(JobConfig::default(), Panicking)
            .run(items(2))
            .await
            .unwrap();

        assert_eq!(result.failed, 2);
        for item in &result.items {
            assert_eq!(item.attempts, 1);
            let error = item.error.as_ref().unwrap();
            assert_eq!(error.kind, ErrorKind::Permanent);
            assert!(error.message.contains("boom"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_mode_bounds_in_flight_items() {
        struct Gauge {
            current: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl WorkExecutor for Gauge {
            async fn execute(&self, _request: &WorkRequest) -> Result<Value, ExecutionError> {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        }

        let gauge = Arc::new(Gauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let config = JobConfig {
            concurrency: 3,
            ..Default::default()
        };
        let result = Orchestrator::new(config, gauge.clone())
            .run(items(10))
            .await
            .unwrap();

        assert_eq!(result.succeeded, 10);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_spaces_out_dispatch() {
        let config = JobConfig {
            rate_limit: Some(RateLimit::per_second(2.0)),
            concurrency: 8,
            ..Default::default()
        };
        let start = Instant::now();
        let result = orchestrator(config, Scripted::default())
            .run(items(5))
            .await
            .unwrap();

        assert_eq!(result.succeeded, 5);
        // First token is free, the other four arrive at 2/s.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1990), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(2050), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_after_grace() {
        let executor = Scripted::default().delayed(Duration::from_secs(30));
        let config = JobConfig {
            concurrency: 2,
            item_timeout: Duration::from_secs(60),
            cancel_grace: Duration::from_secs(1),
            ..Default::default()
        };
        let orchestrator = orchestrator(config, executor);
        let token = orchestrator.cancellation_token();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            token.cancel();
        });

        let start = Instant::now();
        let result = orchestrator.run(items(4)).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert!(result.cancelled);
        assert_eq!(result.total, 4);
        assert_eq!(result.skipped, 4);
        assert!(
            result
                .items
                .iter()
                .all(|i| i.skip_reason == Some(SkipReason::Cancelled))
        );
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_running() {
        let executor = Scripted::default();
        let config = JobConfig {
            concurrency: 0,
            ..Default::default()
        };
        let orchestrator = orchestrator(config, executor);
        let err = orchestrator.run(items(1)).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn glacial_rate_limit_is_rejected() {
        let config = JobConfig {
            rate_limit: Some(RateLimit::per_second(1e-30)),
            ..Default::default()
        };
        let err = orchestrator(config, Scripted::default())
            .run(items(2))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn unbounded_item_timeout_means_no_deadline() {
        let config = JobConfig {
            item_timeout: Duration::from_secs(u64::MAX),
            ..Default::default()
        };
        let result = orchestrator(config, Scripted::default())
            .run(items(2))
            .await
            .unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(result.succeeded, 2);
    }

    /// Panics when told about the item with id `target`.
    struct PanicOn {
        target: &'static str,
    }

    impl JobObserver for PanicOn {
        fn item_started(&self, item: &WorkItem) {
            if item.id == self.target {
                panic!("observer blew up");
            }
        }
    }

    #[tokio::test]
    async fn panic_outside_the_executor_fails_the_job() {
        for mode in [ExecutionMode::Sequential, ExecutionMode::Parallel] {
            let config = JobConfig {
                mode,
                ..Default::default()
            };
            let err = orchestrator(config, Scripted::default())
                .with_observer(Arc::new(PanicOn { target: "2" }))
                .run(items(3))
                .await
                .unwrap_err();
            match err {
                JobError::ItemPanicked { id, message } => {
                    assert_eq!(id, "2");
                    assert!(message.contains("observer blew up"), "{message}");
                }
                other => panic!("unexpected error {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn health_snapshot_is_attached() {
        let executor = Scripted::default().with("1", vec![Err(ExecutionError::permanent("no"))]);
        let config = JobConfig {
            destination: "http://example.org/sparql".into(),
            ..Default::default()
        };
        let result = orchestrator(config, executor).run(items(3)).await.unwrap();

        let health = result.destination_health.unwrap();
        let dest = &health["http://example.org/sparql"];
        assert_eq!(dest.samples, 3);
    }

    #[derive(Default)]
    struct Recorder {
        events: std::sync::Mutex<Vec<String>>,
    }

    impl JobObserver for Recorder {
        fn job_started(&self, total: usize, resumed: usize) {
            self.events.lock().unwrap().push(format!("job {total} {resumed}"));
        }
        fn item_started(&self, item: &WorkItem) {
            self.events.lock().unwrap().push(format!("start {}", item.id));
        }
        fn item_retrying(&self, item: &WorkItem, _error: &ExecutionError, delay: Duration) {
            self.events
                .lock()
                .unwrap()
                .push(format!("retry {} {}ms", item.id, delay.as_millis()));
        }
        fn item_finished(&self, item: &WorkItem) {
            self.events
                .lock()
                .unwrap()
                .push(format!("done {} {}", item.id, item.status));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_lifecycle() {
        let recorder = Arc::new(Recorder::default());
        let executor = Scripted::default().with("1", vec![Err(ExecutionError::transient("t"))]);
        let config = JobConfig {
            mode: ExecutionMode::Sequential,
            retry: fast_retry(2),
            ..Default::default()
        };
        orchestrator(config, executor)
            .with_observer(recorder.clone())
            .run(items(1))
            .await
            .unwrap();

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["job 1 0", "start 1", "retry 1 100ms", "done 1 SUCCESS"]
        );
    }
}
