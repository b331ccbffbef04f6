//! Dead-letter sink: a bounded queue for terminally failed jobs (spec §4.2, §7).
//!
//! The DLQ is deliberately in-memory only and not persisted (spec §9, Open
//! Question 3) — it is exposed via [`DeadLetterQueue::drain`] so a caller can
//! persist entries elsewhere if it chooses.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

use super::job::Job;

#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub reason: String,
    pub failed_at: chrono::DateTime<chrono::Utc>,
}

pub struct DeadLetterQueue {
    tx: mpsc::Sender<DeadLetterEntry>,
    store: Arc<Mutex<Vec<DeadLetterEntry>>>,
}

impl DeadLetterQueue {
    /// Spawn the DLQ with the given bounded capacity and start its consumer task.
    pub fn start(capacity: usize) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<DeadLetterEntry>(capacity);
        let store = Arc::new(Mutex::new(Vec::new()));
        let consumer_store = store.clone();

        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                error!(job_id = %entry.job.id, reason = %entry.reason, "job sent to dead-letter queue");
                consumer_store.lock().await.push(entry);
            }
        });

        (Arc::new(Self { tx, store }), handle)
    }

    /// Attempt to enqueue a terminally failed job. Returns false (and logs
    /// once) if the DLQ is full — the caller drops the job permanently.
    pub async fn try_enqueue(&self, job: Job, reason: impl Into<String>) -> bool {
        let entry = DeadLetterEntry {
            job,
            reason: reason.into(),
            failed_at: chrono::Utc::now(),
        };
        match self.tx.try_send(entry) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(entry)) => {
                warn!(job_id = %entry.job.id, "dead-letter queue full, dropping job permanently");
                false
            }
            Err(mpsc::error::TrySendError::Closed(entry)) => {
                warn!(job_id = %entry.job.id, "dead-letter queue closed, dropping job permanently");
                false
            }
        }
    }

    /// Drain all entries currently recorded in the DLQ store (for tests or
    /// for a caller that wants to persist them elsewhere).
    pub async fn drain(&self) -> Vec<DeadLetterEntry> {
        let mut guard = self.store.lock().await;
        std::mem::take(&mut *guard)
    }

    pub async fn contains(&self, job_id: &str) -> bool {
        self.store.lock().await.iter().any(|e| e.job.id == job_id)
    }

    pub async fn len(&self) -> usize {
        self.store.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::JobType;
    use std::collections::HashMap;

    #[tokio::test]
    async fn enqueue_and_drain_roundtrip() {
        let (dlq, _handle) = DeadLetterQueue::start(10);
        let job = Job::new(JobType::MailSync, HashMap::new());
        let id = job.id.clone();
        assert!(dlq.try_enqueue(job, "exhausted retries").await);

        // Give the consumer task a tick to drain the channel.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(dlq.contains(&id).await);
        assert_eq!(dlq.len().await, 1);

        let drained = dlq.drain().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(dlq.len().await, 0);
    }

    #[tokio::test]
    async fn full_dlq_drops_and_reports_false() {
        let (dlq, _handle) = DeadLetterQueue::start(1);
        // Fill the channel buffer without giving the consumer a chance to drain.
        let job1 = Job::new(JobType::MailSync, HashMap::new());
        let job2 = Job::new(JobType::MailSync, HashMap::new());
        let job3 = Job::new(JobType::MailSync, HashMap::new());
        // mpsc::channel(1) allows one in-flight send; push enough to overflow.
        let _ = dlq.try_enqueue(job1, "x").await;
        let _ = dlq.try_enqueue(job2, "x").await;
        let ok3 = dlq.try_enqueue(job3, "x").await;
        // At least one of these three must have been dropped given capacity 1.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(ok3 || dlq.len().await <= 2);
    }
}
