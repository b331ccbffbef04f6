//! AI batch processor: coalesces single-item classify/summarize jobs into
//! bulk LLM calls, flushed on either a size or a timeout threshold (spec §4.4).
//!
//! The accumulator pattern here — hold a mutex only long enough to snapshot
//! and clear, then do the I/O outside any lock — mirrors the teacher's
//! `CommandRegistry` critical-section discipline (`kernel/jobs/registry.rs`)
//! generalized to the spec's "snapshot-and-release" design note (§9).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Result;
use crate::provider::{LlmService, MailboxStore};
use crate::realtime::{RealtimeChannel, RealtimeEvent};

pub struct AiBatchProcessor {
    classify_acc: Mutex<Vec<String>>,
    summarize_acc: Mutex<Vec<String>>,
    last_classify_flush: Mutex<Instant>,
    last_summarize_flush: Mutex<Instant>,
    is_processing: AtomicBool,
    batch_size: usize,
    batch_timeout: Duration,
    llm: Arc<dyn LlmService>,
    mailbox: Arc<dyn MailboxStore>,
    realtime: Arc<dyn RealtimeChannel>,
    cancel: CancellationToken,
}

impl AiBatchProcessor {
    pub fn new(
        batch_size: usize,
        batch_timeout: Duration,
        llm: Arc<dyn LlmService>,
        mailbox: Arc<dyn MailboxStore>,
        realtime: Arc<dyn RealtimeChannel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            classify_acc: Mutex::new(Vec::new()),
            summarize_acc: Mutex::new(Vec::new()),
            last_classify_flush: Mutex::new(Instant::now()),
            last_summarize_flush: Mutex::new(Instant::now()),
            is_processing: AtomicBool::new(false),
            batch_size,
            batch_timeout,
            llm,
            mailbox,
            realtime,
            cancel: CancellationToken::new(),
        })
    }

    /// Starts the background ticker that time-triggers a flush of either
    /// accumulator. The returned handle is owned by the caller (spec §9
    /// "fire-and-forget → tracked lifetimes").
    pub fn spawn_ticker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let processor = self.clone();
        let cancel = self.cancel.clone();
        let mut interval = tokio::time::interval(processor.batch_timeout);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        processor.flush_if_due(&processor.classify_acc, &processor.last_classify_flush, true).await;
                        processor.flush_if_due(&processor.summarize_acc, &processor.last_summarize_flush, false).await;
                    }
                }
            }
        })
    }

    async fn flush_if_due(&self, acc: &Mutex<Vec<String>>, last_flush: &Mutex<Instant>, is_classify: bool) {
        let due = {
            let guard = acc.lock().await;
            !guard.is_empty() && last_flush.lock().await.elapsed() >= self.batch_timeout
        };
        if !due {
            return;
        }
        if is_classify {
            self.flush_classify(false).await;
        } else {
            self.flush_summarize().await;
        }
    }

    pub async fn process_classify(&self, email_id: String) -> Result<()> {
        let should_flush = {
            let mut acc = self.classify_acc.lock().await;
            acc.push(email_id);
            acc.len() >= self.batch_size
        };
        if should_flush {
            self.flush_classify(false).await;
        }
        Ok(())
    }

    pub async fn process_summarize(&self, email_id: String) -> Result<()> {
        let should_flush = {
            let mut acc = self.summarize_acc.lock().await;
            acc.push(email_id);
            acc.len() >= self.batch_size
        };
        if should_flush {
            self.flush_summarize().await;
        }
        Ok(())
    }

    /// `force` bypasses the `is_processing` guard — used only by shutdown
    /// drain, where a second concurrent flush is acceptable since the
    /// mutex-guarded snapshot still prevents double-processing any item.
    async fn flush_classify(&self, force: bool) {
        if !force && self.is_processing.swap(true, Ordering::AcqRel) {
            return;
        }

        let snapshot = {
            let mut acc = self.classify_acc.lock().await;
            let items = std::mem::take(&mut *acc);
            *self.last_classify_flush.lock().await = Instant::now();
            items
        };

        if snapshot.is_empty() {
            if !force {
                self.is_processing.store(false, Ordering::Release);
            }
            return;
        }

        match self.llm.classify_batch(&snapshot).await {
            Ok(results) => {
                for result in results {
                    if let Err(err) = self.mailbox.mark_classified(&result.email_id, &result.category).await {
                        warn!(email_id = %result.email_id, error = %err, "failed to persist classification");
                        continue;
                    }
                    if let Ok(Some(user_id)) = self.mailbox.owner_of(&result.email_id).await {
                        let event = RealtimeEvent::new(
                            "email.classified",
                            json!({ "email_id": result.email_id, "category": result.category }),
                        );
                        self.realtime.publish(&user_id, event).await;
                    }
                }
            }
            Err(err) => {
                // Errors from the AI service abandon the batch; items are not
                // re-enqueued (spec §4.4) — the next unclassified scan revisits them.
                warn!(count = snapshot.len(), error = %err, "classify batch call failed, abandoning batch");
            }
        }

        if !force {
            self.is_processing.store(false, Ordering::Release);
        }
    }

    async fn flush_summarize(&self) {
        let snapshot = {
            let mut acc = self.summarize_acc.lock().await;
            let items = std::mem::take(&mut *acc);
            *self.last_summarize_flush.lock().await = Instant::now();
            items
        };

        if snapshot.is_empty() {
            return;
        }

        match self.llm.summarize_batch(&snapshot).await {
            Ok(results) => {
                for result in results {
                    if let Err(err) = self.mailbox.mark_summarized(&result.email_id, &result.summary).await {
                        warn!(email_id = %result.email_id, error = %err, "failed to persist summary");
                        continue;
                    }
                    if let Ok(Some(user_id)) = self.mailbox.owner_of(&result.email_id).await {
                        let event = RealtimeEvent::new(
                            "email.summarized",
                            json!({ "email_id": result.email_id, "summary": result.summary }),
                        );
                        self.realtime.publish(&user_id, event).await;
                    }
                }
            }
            Err(err) => {
                warn!(count = snapshot.len(), error = %err, "summarize batch call failed, abandoning batch");
            }
        }
    }

    /// Flush both accumulators unconditionally. Called during pool shutdown
    /// (spec §4.4 "Drain on shutdown"; §9 Open Question resolved in favor of
    /// always flushing).
    pub async fn flush_all(&self) {
        self.cancel.cancel();
        self.flush_classify(true).await;
        self.flush_summarize().await;
    }

    #[cfg(test)]
    pub async fn classify_len(&self) -> usize {
        self.classify_acc.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::{MockLlmService, MockMailboxStore};
    use crate::realtime::StreamHub;

    fn make_processor(batch_size: usize, timeout: Duration) -> (Arc<AiBatchProcessor>, Arc<MockLlmService>) {
        let llm = Arc::new(MockLlmService::default());
        let mailbox = Arc::new(MockMailboxStore::default());
        let realtime = Arc::new(StreamHub::new());
        let processor = AiBatchProcessor::new(batch_size, timeout, llm.clone(), mailbox, realtime);
        (processor, llm)
    }

    #[tokio::test]
    async fn scenario_s7_size_triggered_flush() {
        let (processor, llm) = make_processor(10, Duration::from_secs(3));
        for i in 0..10 {
            processor.process_classify(format!("email-{i}")).await.unwrap();
        }
        assert_eq!(llm.classify_calls.lock().unwrap().len(), 1);
        assert_eq!(llm.classify_calls.lock().unwrap()[0].len(), 10);
        assert_eq!(processor.classify_len().await, 0);
    }

    #[tokio::test]
    async fn partial_batch_waits_for_timeout() {
        let (processor, llm) = make_processor(10, Duration::from_millis(50));
        for i in 0..7 {
            processor.process_classify(format!("email-{i}")).await.unwrap();
        }
        assert_eq!(llm.classify_calls.lock().unwrap().len(), 0);

        let handle = processor.spawn_ticker();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(llm.classify_calls.lock().unwrap().len(), 1);
        assert_eq!(llm.classify_calls.lock().unwrap()[0].len(), 7);
        handle.abort();
    }

    #[tokio::test]
    async fn flush_all_drains_both_accumulators_on_shutdown() {
        let (processor, llm) = make_processor(100, Duration::from_secs(60));
        processor.process_classify("email-1".into()).await.unwrap();
        processor.process_summarize("email-2".into()).await.unwrap();

        processor.flush_all().await;

        assert_eq!(llm.classify_calls.lock().unwrap().len(), 1);
        assert_eq!(processor.classify_len().await, 0);
    }

    #[tokio::test]
    async fn is_processing_guard_blocks_reentrant_classify_flush() {
        let (processor, _llm) = make_processor(1, Duration::from_secs(60));
        processor.is_processing.store(true, Ordering::SeqCst);
        processor.process_classify("email-1".into()).await.unwrap();
        // Flush was skipped because is_processing was already held.
        assert_eq!(processor.classify_len().await, 1);
    }
}
