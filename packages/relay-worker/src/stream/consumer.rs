//! Stream Consumer: durable-stream consumer-group loop that submits each
//! message's job into the pool and only acks once the job reaches a
//! terminal state (spec §2 item 7, §5 "respects queue pressure by not
//! acking until the handler returns").
//!
//! Grounded on the teacher's worker loop shape (`kernel/jobs/worker.rs`):
//! a `CancellationToken`-scoped `tokio::select!` loop pulling one unit of
//! work at a time.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::jobs::job::Job;
use crate::jobs::pool::WorkerPool;

/// A single unseen entry pulled from the durable stream.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub id: String,
    pub job: Job,
}

/// Port over whatever durable stream backs the deployment (e.g. a Redis
/// consumer group). `next()` blocks for the next unseen message on this
/// consumer group; `ack()` marks one message as delivered.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn next(&self) -> anyhow::Result<Option<StreamMessage>>;
    async fn ack(&self, message_id: &str) -> anyhow::Result<()>;
}

pub struct StreamConsumer {
    source: Arc<dyn StreamSource>,
    pool: Arc<WorkerPool>,
    cancel: CancellationToken,
}

impl StreamConsumer {
    pub fn start(source: Arc<dyn StreamSource>, pool: Arc<WorkerPool>) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let consumer = Arc::new(Self { source, pool, cancel: cancel.clone() });

        let loop_consumer = consumer.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = loop_consumer.source.next() => {
                        match result {
                            Ok(Some(message)) => loop_consumer.handle_message(message).await,
                            Ok(None) => {
                                // No unseen entries right now; avoid a hot spin.
                                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                            }
                            Err(err) => {
                                error!(error = %err, "stream read failed");
                                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                            }
                        }
                    }
                }
            }
        });

        (consumer, handle)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Submits the job, waits for its specific terminal-state event, then
    /// acks. Queue-pressure backpressure (submit blocking on a full queue)
    /// naturally stalls the consumer loop rather than acking speculatively.
    async fn handle_message(&self, message: StreamMessage) {
        let mut completions = self.pool.subscribe_completions();
        let job_id = message.job.id.clone();

        let accepted = if message.job.priority.is_priority() {
            self.pool.submit_priority(message.job).await
        } else {
            self.pool.submit(message.job).await
        };

        if !accepted {
            // Dropped (stopped or rate-limited) before entering a queue —
            // nothing will ever complete it, so don't block waiting for one.
            warn!(message_id = %message.id, job_id = %job_id, "job dropped before submission, not acking");
            return;
        }

        loop {
            match completions.recv().await {
                Ok(completion) if completion.job_id == job_id => break,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    warn!(message_id = %message.id, job_id = %job_id, "completion channel closed before ack");
                    return;
                }
            }
        }

        if let Err(err) = self.source.ack(&message.id).await {
            error!(message_id = %message.id, error = %err, "failed to ack stream message");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::InMemoryStreamSource;
    use super::*;
    use crate::error::WorkerError;
    use crate::jobs::dispatcher::{Dispatcher, Processor};
    use crate::jobs::job::{Job, JobPriority, JobType};
    use crate::jobs::pool::PoolConfig;
    use crate::jobs::timeout_table::TimeoutTable;
    use crate::jobs::dlq::DeadLetterQueue;
    use crate::metrics::Metrics;
    use crate::rate_limiter::RateLimiter;
    use std::collections::HashMap;
    use std::time::Duration;

    struct EchoProcessor;

    #[async_trait]
    impl Processor for EchoProcessor {
        async fn process(&self, _job: &Job) -> crate::error::Result<()> {
            Ok(())
        }
    }

    struct AlwaysFailProcessor;

    #[async_trait]
    impl Processor for AlwaysFailProcessor {
        async fn process(&self, _job: &Job) -> crate::error::Result<()> {
            Err(WorkerError::Validation("nope".to_string()))
        }
    }

    fn make_pool(dispatcher: Dispatcher) -> Arc<WorkerPool> {
        let config = PoolConfig {
            max_workers: 2,
            queue_capacity: 100,
            worker_batch_size: 1,
            channel_buffer_size: 100,
            default_job_timeout: Duration::from_secs(5),
            dlq_capacity: 10,
        };
        let metrics = Arc::new(Metrics::new());
        let rate_limiter = Arc::new(RateLimiter::new(10_000, 10_000, Duration::from_millis(1)));
        let (dlq, _handle) = DeadLetterQueue::start(10);
        WorkerPool::new(config, Arc::new(dispatcher), Arc::new(TimeoutTable::default()), rate_limiter, metrics, dlq)
    }

    #[tokio::test]
    async fn acks_only_after_successful_handler_completion() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(JobType::MailSync, Arc::new(EchoProcessor));
        let pool = make_pool(dispatcher);
        pool.start().await;

        let job = Job::new(JobType::MailSync, HashMap::new());
        let message = StreamMessage { id: "msg-1".to_string(), job };
        let source = Arc::new(InMemoryStreamSource::new(vec![message]));
        let (consumer, handle) = StreamConsumer::start(source.clone(), pool.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !source.acked.lock().await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message should be acked");

        assert_eq!(*source.acked.lock().await, vec!["msg-1".to_string()]);

        consumer.stop();
        let _ = handle.await;
        pool.stop().await;
    }

    #[tokio::test]
    async fn does_not_ack_until_dead_lettered_terminal_failure() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(JobType::MailSync, Arc::new(AlwaysFailProcessor));
        let pool = make_pool(dispatcher);
        pool.start().await;

        let job = Job::new(JobType::MailSync, HashMap::new()).with_priority(JobPriority::Critical);
        let job_id = job.id.clone();
        let message = StreamMessage { id: "msg-2".to_string(), job };
        let source = Arc::new(InMemoryStreamSource::new(vec![message]));
        let (consumer, handle) = StreamConsumer::start(source.clone(), pool.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if pool.dlq().contains(&job_id).await {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job should be dead-lettered");

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !source.acked.lock().await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dead-lettered job is still a terminal state that should be acked");

        consumer.stop();
        let _ = handle.await;
        pool.stop().await;
    }
}
