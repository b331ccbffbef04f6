//! Worker pool: two parallel pools (normal + priority) of cooperative tasks
//! consuming buffered queues, applying per-job-type deadlines, jittered
//! retry with backoff, and DLQ routing (spec §4.2).
//!
//! Grounded on the teacher's `JobWorker::run` claim/dispatch/ack loop
//! (`kernel/jobs/worker.rs`), adapted from DB-polling to channel-consuming,
//! and on its `CancellationToken`-scoped shutdown convention.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::ai_batch::AiBatchProcessor;
use super::dispatcher::Dispatcher;
use super::dlq::DeadLetterQueue;
use super::job::Job;
use super::timeout_table::TimeoutTable;
use crate::error::WorkerError;
use crate::metrics::Metrics;
use crate::rate_limiter::RateLimiter;

const MAX_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_JITTER_MS: u64 = 500;
const STOP_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub worker_batch_size: usize,
    pub channel_buffer_size: usize,
    pub default_job_timeout: Duration,
    pub dlq_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            queue_capacity: 1000,
            worker_batch_size: 1,
            channel_buffer_size: 1000,
            default_job_timeout: Duration::from_secs(60),
            dlq_capacity: 100,
        }
    }
}

/// Tracks in-flight submitted work so `Wait()` can block until it's all done.
struct Inflight {
    count: AtomicI64,
    notify: Notify,
}

impl Inflight {
    fn new() -> Self {
        Self {
            count: AtomicI64::new(0),
            notify: Notify::new(),
        }
    }

    fn incr(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn decr(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait_zero(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count.load(Ordering::SeqCst) <= 0 {
                return;
            }
            notified.await;
        }
    }
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Job>>>;

/// Emitted once a job reaches a terminal state (processed, or DLQ'd after
/// exhausting retries) — consumed by the Stream Consumer so it knows when
/// it is safe to ack the source message (spec §5 "respects queue pressure by
/// not acking until the handler returns").
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub job_id: String,
    pub success: bool,
}

const COMPLETION_CHANNEL_CAPACITY: usize = 1024;

pub struct WorkerPool {
    config: PoolConfig,
    dispatcher: Arc<Dispatcher>,
    timeout_table: Arc<TimeoutTable>,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    dlq: Arc<DeadLetterQueue>,
    ai_batcher: OnceCell<Arc<AiBatchProcessor>>,

    normal_tx: mpsc::Sender<Job>,
    normal_rx: SharedReceiver,
    priority_tx: mpsc::Sender<Job>,
    priority_rx: SharedReceiver,

    stopped: AtomicBool,
    started: AtomicBool,
    cancel: CancellationToken,
    inflight: Inflight,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    retry_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    completions: broadcast::Sender<JobCompletion>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        dispatcher: Arc<Dispatcher>,
        timeout_table: Arc<TimeoutTable>,
        rate_limiter: Arc<RateLimiter>,
        metrics: Arc<Metrics>,
        dlq: Arc<DeadLetterQueue>,
    ) -> Arc<Self> {
        let (normal_tx, normal_rx) = mpsc::channel(config.queue_capacity);
        let priority_capacity = (config.queue_capacity / 4).max(50);
        let (priority_tx, priority_rx) = mpsc::channel(priority_capacity);

        Arc::new(Self {
            config,
            dispatcher,
            timeout_table,
            rate_limiter,
            metrics,
            dlq,
            ai_batcher: OnceCell::new(),
            normal_tx,
            normal_rx: Arc::new(Mutex::new(normal_rx)),
            priority_tx,
            priority_rx: Arc::new(Mutex::new(priority_rx)),
            stopped: AtomicBool::new(false),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            inflight: Inflight::new(),
            worker_handles: Mutex::new(Vec::new()),
            retry_handles: Mutex::new(Vec::new()),
            completions: broadcast::channel(COMPLETION_CHANNEL_CAPACITY).0,
        })
    }

    /// Subscribe to per-job terminal-state events. Used by the Stream
    /// Consumer to know when it's safe to ack the source message — it must
    /// not ack before the handler actually finishes (spec §5).
    pub fn subscribe_completions(&self) -> broadcast::Receiver<JobCompletion> {
        self.completions.subscribe()
    }

    /// Post-construction setter for the AI batch accumulator, flushed on
    /// `Stop()` (spec §9 Open Question: batch drain on shutdown). Mirrors the
    /// teacher's late-bound-collaborator convention (§9 design note).
    pub async fn set_ai_batcher(&self, batcher: Arc<AiBatchProcessor>) {
        let _ = self.ai_batcher.set(batcher);
    }

    /// Idempotent. Spawns both worker pools.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(max_workers = self.config.max_workers, "starting worker pool");

        let priority_workers = self.config.max_workers / 4 + 1;

        let mut handles = self.worker_handles.lock().await;
        for i in 0..self.config.max_workers {
            handles.push(self.spawn_worker(format!("normal-{i}"), self.normal_rx.clone(), false));
        }
        for i in 0..priority_workers {
            handles.push(self.spawn_worker(format!("priority-{i}"), self.priority_rx.clone(), true));
        }
    }

    fn spawn_worker(
        self: &Arc<Self>,
        name: String,
        rx: SharedReceiver,
        is_priority: bool,
    ) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = Self::recv_next(&rx) => job,
                };
                let Some(job) = job else { break };

                if is_priority {
                    pool.metrics.decr_priority_queue_size();
                } else {
                    pool.metrics.decr_queue_size();
                }

                pool.process_one(job).await;

                // Opportunistically drain a small batch without blocking,
                // per the configured per-worker batch size (spec's Pool Config).
                let mut drained = 1;
                while drained < pool.config.worker_batch_size {
                    let maybe = { rx.lock().await.try_recv().ok() };
                    match maybe {
                        Some(extra) => {
                            if is_priority {
                                pool.metrics.decr_priority_queue_size();
                            } else {
                                pool.metrics.decr_queue_size();
                            }
                            pool.process_one(extra).await;
                            drained += 1;
                        }
                        None => break,
                    }
                }
            }
            info!(worker = %name, "worker exited");
        })
    }

    async fn recv_next(rx: &SharedReceiver) -> Option<Job> {
        rx.lock().await.recv().await
    }

    /// Process a single job: deadline-bound dispatch, then retry/DLQ routing.
    ///
    /// The dispatch itself runs on a detached task so a hung handler can be
    /// aborted rather than blocking the worker loop forever; the task is
    /// aborted both on deadline elapse and on pool shutdown so in-flight work
    /// actually observes cancellation rather than merely being abandoned
    /// (spec §4.2, §5).
    async fn process_one(self: &Arc<Self>, job: Job) {
        let timeout = self.timeout_table.timeout_for(&job.job_type);
        let dispatcher = self.dispatcher.clone();
        let job_clone = job.clone();
        let start = Instant::now();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move { dispatcher.dispatch(&job_clone).await });
        let abort_handle = handle.abort_handle();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                abort_handle.abort();
                Err(WorkerError::DeadlineExceeded(timeout))
            }
            res = tokio::time::timeout(timeout, handle) => match res {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(WorkerError::Panicked(join_err.to_string())),
                Err(_elapsed) => {
                    abort_handle.abort();
                    Err(WorkerError::DeadlineExceeded(timeout))
                }
            },
        };

        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                self.metrics.record_processed(duration_ms);
                self.inflight.decr();
                let _ = self.completions.send(JobCompletion { job_id: job.id.clone(), success: true });
            }
            Err(err) => self.handle_failure(job, err).await,
        }
    }

    async fn handle_failure(self: &Arc<Self>, job: Job, err: WorkerError) {
        if err.is_terminal() {
            self.send_to_dlq(job, err.to_string()).await;
            return;
        }

        if job.retry_count < MAX_RETRIES {
            let retries = job.retry_count;
            let jitter_ms = rand::rng().random_range(0..=RETRY_JITTER_MS);
            let delay = RETRY_BASE * 2u32.pow(retries) + Duration::from_millis(jitter_ms);

            warn!(job_id = %job.id, retry = retries, delay_ms = delay.as_millis() as u64, error = %err, "job failed, scheduling retry");
            self.metrics.record_retried();

            let retried_job = job.into_retry();
            let pool = self.clone();
            let cancel = self.cancel.clone();
            let handle = tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(job_id = %retried_job.id, "retry backoff cancelled by shutdown");
                    }
                    _ = tokio::time::sleep(delay) => {
                        // Retries always go through the non-priority queue so
                        // they never starve fresh priority work (spec §4.2).
                        let _ = pool.submit_retry(retried_job).await;
                    }
                }
            });
            self.retry_handles.lock().await.push(handle);
        } else {
            error!(job_id = %job.id, error = %err, "job exhausted retries, sending to dead-letter queue");
            self.metrics.record_failed();
            self.send_to_dlq(job, err.to_string()).await;
        }
    }

    async fn send_to_dlq(&self, job: Job, reason: String) {
        let job_id = job.id.clone();
        self.dlq.try_enqueue(job, reason).await;
        self.inflight.decr();
        let _ = self.completions.send(JobCompletion { job_id, success: false });
    }

    /// Internal re-submission path used by the retry scheduler: bypasses the
    /// stopped/rate-limit checks in `submit()` since this work was already
    /// accepted and counted against inflight.
    async fn submit_retry(&self, job: Job) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            self.inflight.decr();
            return false;
        }
        self.metrics.incr_queue_size();
        if self.normal_tx.send(job).await.is_err() {
            self.metrics.decr_queue_size();
            self.inflight.decr();
            return false;
        }
        true
    }

    /// Submit a job. Returns false (incrementing `dropped`) if stopped or
    /// rate-limited. Queue-full backpressure blocks the submitter briefly by
    /// design rather than dropping (spec §5).
    pub async fn submit(&self, job: Job) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            self.metrics.record_dropped();
            return false;
        }
        if !self.rate_limiter.allow() {
            self.metrics.record_dropped();
            return false;
        }

        self.inflight.incr();
        self.metrics.incr_queue_size();
        if self.normal_tx.send(job).await.is_err() {
            self.metrics.decr_queue_size();
            self.inflight.decr();
            self.metrics.record_dropped();
            return false;
        }
        true
    }

    /// Submit each job independently; returns the count that were accepted.
    pub async fn submit_batch(&self, jobs: Vec<Job>) -> usize {
        let mut submitted = 0;
        for job in jobs {
            if self.submit(job).await {
                submitted += 1;
            }
        }
        submitted
    }

    /// Try the priority queue first; on overflow fall back to `submit()`.
    pub async fn submit_priority(&self, job: Job) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            self.metrics.record_dropped();
            return false;
        }
        if !self.rate_limiter.allow() {
            self.metrics.record_dropped();
            return false;
        }

        self.inflight.incr();
        match self.priority_tx.try_send(job) {
            Ok(()) => {
                self.metrics.incr_priority_queue_size();
                true
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                // Already accounted for in inflight; submit() will not
                // double-count since it increments again — undo first.
                self.inflight.decr();
                self.submit(job).await
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.inflight.decr();
                self.submit(job).await
            }
        }
    }

    /// Block until all submitted work (including retries) has reached a
    /// terminal state.
    pub async fn wait(&self) {
        self.inflight.wait_zero().await;
    }

    /// Idempotent. Cancels the root context (aborting in-flight dispatch
    /// tasks immediately, per §4.2/§5's deadline-context cancellation), waits
    /// up to 30s for the worker loops themselves to exit before abandoning
    /// them, flushes the AI batcher if one was
    /// registered, and drains the DLQ + priority channel.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("stopping worker pool");
        self.cancel.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        if tokio::time::timeout(STOP_DEADLINE, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("worker pool stop deadline exceeded, abandoning remaining tasks");
        }

        let retry_handles = {
            let mut guard = self.retry_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        let _ = futures::future::join_all(retry_handles).await;

        if let Some(batcher) = self.ai_batcher.get() {
            batcher.flush_all().await;
        }

        let mut lost = 0;
        {
            let mut rx = self.priority_rx.lock().await;
            while rx.try_recv().is_ok() {
                lost += 1;
            }
        }
        {
            let mut rx = self.normal_rx.lock().await;
            while rx.try_recv().is_ok() {
                lost += 1;
            }
        }
        if lost > 0 {
            warn!(count = lost, "messages lost during shutdown");
        }

        info!("worker pool stopped");
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }
}

/// Lets processors publish follow-on jobs (e.g. MailSave publishing
/// `ai.classify` / `rag.index`) without holding a concrete `WorkerPool`
/// reference at construction time — the cyclic processors-produce-into-pool
/// relationship is broken via a post-construction setter (spec §9).
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, job: Job) -> bool;
    async fn publish_priority(&self, job: Job) -> bool;
}

#[async_trait]
impl JobPublisher for WorkerPool {
    async fn publish(&self, job: Job) -> bool {
        self.submit(job).await
    }

    async fn publish_priority(&self, job: Job) -> bool {
        self.submit_priority(job).await
    }
}
