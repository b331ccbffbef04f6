//! Mail sync state machine: InitialSync, DeltaSync, GapSync, FullResync,
//! RenewExpiredWatches (spec §4.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::warn;

use super::classifier::classify_from_headers;
use super::state::{SyncPhase, SyncState, SyncStatus};
use super::store::SyncStateStore;
use crate::error::{Result, WorkerError};
use crate::jobs::job::{Job, JobType};
use crate::jobs::pool::JobPublisher;
use crate::provider::{IncrementalSyncOutcome, MailProvider, MailboxStore, RawMessage};
use crate::realtime::{RealtimeChannel, RealtimeEvent};

const FIRST_BATCH_MONTHS_BACK: u32 = 6;
const MAX_SYNC_RETRIES: u32 = 5;
const RESCAN_BATCH_SIZE: usize = 50;
const RESCAN_INTERVAL: Duration = Duration::from_secs(2);
const RESCAN_CAP: usize = 2000;

pub struct MailSyncStateMachine {
    provider: Arc<dyn MailProvider>,
    store: Arc<dyn SyncStateStore>,
    mailbox: Arc<dyn MailboxStore>,
    realtime: Arc<dyn RealtimeChannel>,
    publisher: OnceCell<Arc<dyn JobPublisher>>,
}

impl MailSyncStateMachine {
    pub fn new(
        provider: Arc<dyn MailProvider>,
        store: Arc<dyn SyncStateStore>,
        mailbox: Arc<dyn MailboxStore>,
        realtime: Arc<dyn RealtimeChannel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            store,
            mailbox,
            realtime,
            publisher: OnceCell::new(),
        })
    }

    /// Post-construction setter breaking the machine ↔ pool cycle (spec §9):
    /// the machine publishes follow-on jobs into the same pool that invokes
    /// it via the Mail processor.
    pub async fn set_publisher(&self, publisher: Arc<dyn JobPublisher>) {
        let _ = self.publisher.set(publisher);
    }

    async fn publish(&self, job: Job) {
        if let Some(publisher) = self.publisher.get() {
            publisher.publish(job).await;
        }
    }

    async fn load_or_create(&self, user_id: &str, connection_id: &str, provider: &str) -> Result<SyncState> {
        match self.store.get(connection_id).await? {
            Some(state) => Ok(state),
            None => Ok(SyncState::new(user_id, connection_id, provider)),
        }
    }

    /// Two-phase progressive load with checkpointing/resume (spec §4.5).
    pub async fn initial_sync(&self, user_id: &str, connection_id: &str, provider: &str) -> Result<()> {
        let mut state = self.load_or_create(user_id, connection_id, provider).await?;

        let resuming = state.has_checkpoint();
        state.status = SyncStatus::Syncing;
        state.phase = if resuming { SyncPhase::InitialRemaining } else { SyncPhase::InitialFirstBatch };
        self.store.upsert(state.clone()).await?;

        if !resuming {
            self.realtime.publish(user_id, RealtimeEvent::new("sync_started", json!({}))).await;
        }

        let mut page_token = state.checkpoint_page_token.clone();
        let mut synced_count = state.checkpoint_synced_count;
        let mut last_history_id: Option<String> = None;
        let mut first_page = !resuming;

        loop {
            let page = match self
                .provider
                .initial_sync(connection_id, page_token.as_deref(), FIRST_BATCH_MONTHS_BACK)
                .await
            {
                Ok(page) => page,
                Err(WorkerError::Credential(reason)) => {
                    return self.handle_credential_failure(user_id, connection_id, &mut state, reason).await;
                }
                Err(err) => {
                    self.schedule_retry_or_fail(&mut state, err.to_string()).await?;
                    return Err(err);
                }
            };

            let count = page.messages.len() as u64;
            for message in page.messages {
                self.persist_and_classify(connection_id, user_id, message).await?;
            }
            synced_count += count;
            if let Some(hid) = page.history_id {
                last_history_id = Some(hid);
            }

            if first_page {
                self.realtime
                    .publish(user_id, RealtimeEvent::new("sync_first_batch", json!({ "current": synced_count })))
                    .await;
            } else {
                self.realtime
                    .publish(user_id, RealtimeEvent::new("sync_progress", json!({ "current": synced_count })))
                    .await;
            }
            first_page = false;

            match page.next_page_token {
                Some(token) => {
                    state.phase = SyncPhase::InitialRemaining;
                    state.checkpoint_page_token = Some(token.clone());
                    state.checkpoint_synced_count = synced_count;
                    self.store.upsert(state.clone()).await?;
                    page_token = Some(token);
                }
                None => break,
            }
        }

        if let Some(hid) = last_history_id {
            state.advance_history_id(&hid);
        }

        match self.provider.install_watch(connection_id).await {
            Ok(watch) => {
                state.watch_expires_at = Some(watch.expires_at);
                state.watch_channel_id = Some(watch.channel_id);
                state.status = SyncStatus::Idle;
            }
            Err(err) => {
                warn!(connection_id, error = %err, "watch installation failed, data commit still complete");
                state.status = SyncStatus::WatchExpired;
            }
        }

        state.clear_checkpoint();
        state.first_sync_complete = true;
        state.phase = SyncPhase::Delta;
        state.reset_retries();
        self.store.upsert(state.clone()).await?;

        self.realtime.publish(user_id, RealtimeEvent::new("sync_completed", json!({}))).await;

        self.spawn_background_rescan(connection_id.to_string(), user_id.to_string());

        Ok(())
    }

    async fn persist_and_classify(&self, connection_id: &str, user_id: &str, message: RawMessage) -> Result<()> {
        let external_id = message.external_id.clone();
        let shortcut = classify_from_headers(&message.headers);
        let email_id = self.mailbox.upsert(connection_id, message).await?;

        match shortcut {
            Some(category) => {
                self.mailbox.mark_classified(&email_id, category).await?;
            }
            None => {
                self.publish(classify_job(&email_id, user_id)).await;
            }
        }
        self.publish(rag_index_job(&email_id, user_id)).await;
        let _ = external_id;
        Ok(())
    }

    fn spawn_background_rescan(&self, connection_id: String, user_id: String) {
        let mailbox = self.mailbox.clone();
        let publisher = self.publisher.get().cloned();
        tokio::spawn(async move {
            let Some(publisher) = publisher else { return };
            let mut dispatched = 0usize;
            loop {
                if dispatched >= RESCAN_CAP {
                    break;
                }
                let ids = match mailbox.unclassified_ids(&connection_id, RESCAN_BATCH_SIZE).await {
                    Ok(ids) => ids,
                    Err(err) => {
                        warn!(connection_id, error = %err, "rescan lookup failed");
                        break;
                    }
                };
                if ids.is_empty() {
                    break;
                }
                for id in &ids {
                    publisher.publish(classify_job(id, &user_id)).await;
                }
                dispatched += ids.len();
                tokio::time::sleep(RESCAN_INTERVAL).await;
            }
        });
    }

    /// Called from a provider push notification (spec §4.5).
    pub async fn delta_sync(&self, connection_id: &str, new_history_id: &str) -> Result<()> {
        let Some(mut state) = self.store.get(connection_id).await? else {
            return Err(WorkerError::Validation(format!("unknown connection {connection_id}")));
        };
        state.phase = SyncPhase::Delta;
        state.status = SyncStatus::Syncing;
        self.store.upsert(state.clone()).await?;

        let history_id = state.history_id.clone().unwrap_or_else(|| new_history_id.to_string());
        match self.run_incremental(&state, &history_id, None, None).await? {
            IncrementalOutcome::FellBack => self.initial_sync(&state.user_id, connection_id, &state.provider).await,
            IncrementalOutcome::Applied => {
                // run_incremental advances history_id on the store row directly
                // (spec §8 invariant 5); re-fetch before writing status so this
                // upsert doesn't clobber it with the pre-sync snapshot.
                let mut fresh = self.store.get(connection_id).await?.unwrap_or(state);
                fresh.status = SyncStatus::Idle;
                self.store.upsert(fresh).await?;
                Ok(())
            }
        }
    }

    /// Catch-up reconciliation: same mechanics as delta sync but with gap
    /// phase events, and a sync-token expiry forces FullResync rather than
    /// InitialSync (spec §4.5).
    pub async fn gap_sync(&self, connection_id: &str) -> Result<()> {
        let Some(mut state) = self.store.get(connection_id).await? else {
            return Err(WorkerError::Validation(format!("unknown connection {connection_id}")));
        };
        if !state.first_sync_complete {
            return self.initial_sync(&state.user_id, connection_id, &state.provider).await;
        }

        state.phase = SyncPhase::Gap;
        state.status = SyncStatus::Syncing;
        self.store.upsert(state.clone()).await?;
        self.realtime.publish(&state.user_id, RealtimeEvent::new("gap_checking", json!({}))).await;

        let history_id = state.history_id.clone().unwrap_or_default();
        match self
            .run_incremental(&state, &history_id, Some("gap_checking"), Some("gap_sync_complete"))
            .await?
        {
            IncrementalOutcome::FellBack => self.full_resync(connection_id).await,
            IncrementalOutcome::Applied => {
                // same stale-write hazard as delta_sync: re-fetch before the
                // status write so the advanced history_id survives.
                let mut fresh = self.store.get(connection_id).await?.unwrap_or(state);
                fresh.status = SyncStatus::Idle;
                self.store.upsert(fresh).await?;
                Ok(())
            }
        }
    }

    async fn run_incremental(
        &self,
        state: &SyncState,
        history_id: &str,
        _start_event: Option<&str>,
        complete_event: Option<&str>,
    ) -> Result<IncrementalOutcome> {
        let mut token = history_id.to_string();
        loop {
            let outcome = match self.provider.incremental_sync(&state.connection_id, &token).await {
                Ok(outcome) => outcome,
                Err(WorkerError::Credential(reason)) => {
                    let mut owned = state.clone();
                    let user_id = owned.user_id.clone();
                    let connection_id = owned.connection_id.clone();
                    return self
                        .handle_credential_failure(&user_id, &connection_id, &mut owned, reason)
                        .await
                        .map(|_| IncrementalOutcome::Applied);
                }
                Err(err) => return Err(err),
            };

            match outcome {
                IncrementalSyncOutcome::SyncRequired | IncrementalSyncOutcome::NotFound => {
                    return Ok(IncrementalOutcome::FellBack);
                }
                IncrementalSyncOutcome::Delta { messages, deleted_external_ids, next_history_id, has_more } => {
                    for external_id in deleted_external_ids {
                        self.mailbox.delete_by_external_id(&state.connection_id, &external_id).await?;
                    }
                    for message in messages {
                        let external_id = message.external_id.clone();
                        self.persist_and_classify(&state.connection_id, &state.user_id, message).await?;
                        let body = self.provider.fetch_full_body(&state.connection_id, &external_id).await?;
                        self.realtime
                            .publish(&state.user_id, RealtimeEvent::new("new_email", json!({ "external_id": external_id, "body": body })))
                            .await;
                    }
                    self.store.advance_history_id(&state.connection_id, &next_history_id).await?;
                    token = next_history_id;
                    if !has_more {
                        if let Some(event) = complete_event {
                            self.realtime.publish(&state.user_id, RealtimeEvent::new(event, json!({}))).await;
                        }
                        return Ok(IncrementalOutcome::Applied);
                    }
                }
            }
        }
    }

    /// Last-resort re-page of the sync window; existing rows identified via
    /// a batched lookup to avoid N+1 (spec §4.5).
    pub async fn full_resync(&self, connection_id: &str) -> Result<()> {
        let Some(mut state) = self.store.get(connection_id).await? else {
            return Err(WorkerError::Validation(format!("unknown connection {connection_id}")));
        };
        state.phase = SyncPhase::FullResync;
        state.status = SyncStatus::Syncing;
        self.store.upsert(state.clone()).await?;

        let mut page_token: Option<String> = None;
        loop {
            let page = self.provider.initial_sync(connection_id, page_token.as_deref(), FIRST_BATCH_MONTHS_BACK).await?;
            let external_ids: Vec<String> = page.messages.iter().map(|m| m.external_id.clone()).collect();
            let _existing = self.provider.lookup_existing(connection_id, &external_ids).await?;

            for message in page.messages {
                self.persist_and_classify(connection_id, &state.user_id, message).await?;
            }
            if let Some(hid) = page.history_id {
                state.advance_history_id(&hid);
                self.store.upsert(state.clone()).await?;
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        match self.provider.install_watch(connection_id).await {
            Ok(watch) => {
                state.watch_expires_at = Some(watch.expires_at);
                state.watch_channel_id = Some(watch.channel_id);
                state.status = SyncStatus::Idle;
            }
            Err(_) => {
                state.status = SyncStatus::WatchExpired;
            }
        }
        state.first_sync_complete = true;
        state.phase = SyncPhase::Delta;
        self.store.upsert(state.clone()).await?;

        self.spawn_background_rescan(connection_id.to_string(), state.user_id.clone());
        Ok(())
    }

    /// Hourly sweep: renews any watch expiring within 24h (spec §4.6 WatchRenew).
    pub async fn renew_expired_watches(&self) -> Result<()> {
        let cutoff = Utc::now() + chrono::Duration::hours(24);
        for mut state in self.store.get_expired_watches(cutoff).await? {
            if let Some(channel_id) = state.watch_channel_id.clone() {
                let _ = self.provider.stop_watch(&state.connection_id, &channel_id).await;
            }
            match self.provider.install_watch(&state.connection_id).await {
                Ok(watch) => {
                    state.watch_expires_at = Some(watch.expires_at);
                    state.watch_channel_id = Some(watch.channel_id);
                    state.status = SyncStatus::Idle;
                }
                Err(err) => {
                    warn!(connection_id = %state.connection_id, error = %err, "watch renewal failed, retrying next tick");
                    state.status = SyncStatus::WatchExpired;
                }
            }
            self.store.upsert(state).await?;
        }
        Ok(())
    }

    async fn handle_credential_failure(&self, user_id: &str, connection_id: &str, state: &mut SyncState, reason: String) -> Result<()> {
        state.status = SyncStatus::Error;
        state.error_message = Some("reconnection required".to_string());
        state.next_retry_at = None;
        self.store.upsert(state.clone()).await?;
        self.realtime.publish(user_id, RealtimeEvent::new("token_expired", json!({ "connection_id": connection_id }))).await;
        Err(WorkerError::Credential(reason))
    }

    /// Retry policy for sync errors (spec §4.5.2): schedules the next
    /// attempt via exponential backoff, or marks the state exhausted once
    /// `MAX_SYNC_RETRIES` is reached. The actual retry-count increment
    /// happens in the SyncRetry scheduler when it fires a due retry.
    async fn schedule_retry_or_fail(&self, state: &mut SyncState, reason: String) -> Result<()> {
        state.status = SyncStatus::Error;
        if state.retry_count < MAX_SYNC_RETRIES {
            let backoff_secs = 2u64.saturating_pow(state.retry_count.min(6));
            state.next_retry_at = Some(Utc::now() + chrono::Duration::seconds(backoff_secs as i64));
            state.error_message = Some(reason);
        } else {
            state.next_retry_at = None;
            state.error_message = Some(format!("max retries exceeded: {reason}"));
        }
        self.store.upsert(state.clone()).await?;
        Ok(())
    }
}

enum IncrementalOutcome {
    Applied,
    FellBack,
}

fn classify_job(email_id: &str, user_id: &str) -> Job {
    let mut payload = HashMap::new();
    payload.insert("email_id".to_string(), json!(email_id));
    payload.insert("user_id".to_string(), json!(user_id));
    Job::new(JobType::AiClassify, payload)
}

fn rag_index_job(email_id: &str, user_id: &str) -> Job {
    let mut payload = HashMap::new();
    payload.insert("email_id".to_string(), json!(email_id));
    payload.insert("user_id".to_string(), json!(user_id));
    Job::new(JobType::RagIndex, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::{MockMailProvider, MockMailboxStore};
    use crate::realtime::StreamHub;
    use crate::sync::store::InMemorySyncStateStore;
    use std::collections::HashMap as StdHashMap;

    fn raw_message(external_id: &str) -> RawMessage {
        RawMessage {
            external_id: external_id.to_string(),
            subject: "hi".into(),
            from: "friend@example.com".into(),
            to: vec![],
            cc: vec![],
            snippet: "".into(),
            is_read: false,
            has_attachments: false,
            folder: "inbox".into(),
            labels: vec![],
            received_at: Utc::now(),
            headers: StdHashMap::new(),
        }
    }

    #[tokio::test]
    async fn scenario_s4_progressive_initial_sync_event_order() {
        let provider = Arc::new(MockMailProvider::default());
        {
            let mut pages = provider.pages.lock().unwrap();
            pages.push(PagedSyncResultStub::page(50, Some("P2"), None));
            pages.push(PagedSyncResultStub::page(30, None, Some("H100")));
        }
        let store = InMemorySyncStateStore::new();
        let mailbox = Arc::new(MockMailboxStore::default());
        let realtime = Arc::new(StreamHub::new());
        let mut rx = realtime.subscribe("user-1").await;

        let machine = MailSyncStateMachine::new(provider, store.clone(), mailbox, realtime);
        machine.initial_sync("user-1", "conn-1", "gmail").await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event.event_type);
        }
        assert_eq!(events, vec!["sync_started", "sync_first_batch", "sync_progress", "sync_completed"]);

        let state = store.get("conn-1").await.unwrap().unwrap();
        assert!(!state.has_checkpoint());
        assert_eq!(state.history_id.as_deref(), Some("H100"));
        assert!(state.watch_channel_id.is_some());
    }

    #[tokio::test]
    async fn checkpoint_resumes_initial_remaining_without_refetching() {
        let provider = Arc::new(MockMailProvider::default());
        {
            let mut pages = provider.pages.lock().unwrap();
            pages.push(PagedSyncResultStub::page(20, None, Some("H1")));
        }
        let store = InMemorySyncStateStore::new();
        let mut state = SyncState::new("user-1", "conn-1", "gmail");
        state.checkpoint_page_token = Some("P2".into());
        state.checkpoint_synced_count = 50;
        store.upsert(state).await.unwrap();

        let mailbox = Arc::new(MockMailboxStore::default());
        let realtime = Arc::new(StreamHub::new());
        let machine = MailSyncStateMachine::new(provider.clone(), store.clone(), mailbox, realtime);
        machine.initial_sync("user-1", "conn-1", "gmail").await.unwrap();

        // Resuming from a checkpoint must not re-emit sync_started or re-page from scratch.
        let final_state = store.get("conn-1").await.unwrap().unwrap();
        assert_eq!(final_state.checkpoint_synced_count, 0);
        assert!(final_state.first_sync_complete);
    }

    #[tokio::test]
    async fn scenario_s5_token_expiry_marks_error_no_retry() {
        let provider = Arc::new(MockMailProvider::default());
        *provider.credential_failure.lock().unwrap() = Some("invalid_grant".into());
        let store = InMemorySyncStateStore::new();
        let mailbox = Arc::new(MockMailboxStore::default());
        let realtime = Arc::new(StreamHub::new());
        let mut rx = realtime.subscribe("user-1").await;

        let machine = MailSyncStateMachine::new(provider, store.clone(), mailbox, realtime);
        let result = machine.initial_sync("user-1", "conn-1", "gmail").await;
        assert!(matches!(result, Err(WorkerError::Credential(_))));

        let state = store.get("conn-1").await.unwrap().unwrap();
        assert_eq!(state.status, SyncStatus::Error);
        assert!(state.next_retry_at.is_none());

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event.event_type);
        }
        assert!(events.contains(&"token_expired".to_string()));
    }

    #[tokio::test]
    async fn invariant_8_duplicate_delta_sync_is_idempotent() {
        let provider = Arc::new(MockMailProvider::default());
        let delta = || crate::provider::IncrementalSyncOutcome::Delta {
            messages: vec![raw_message("ext-dup")],
            deleted_external_ids: vec![],
            next_history_id: "H2".into(),
            has_more: false,
        };
        {
            let mut incremental = provider.incremental.lock().unwrap();
            incremental.push(delta());
            incremental.push(delta());
        }
        let store = InMemorySyncStateStore::new();
        let mut state = SyncState::new("user-1", "conn-1", "gmail");
        state.history_id = Some("H1".into());
        store.upsert(state).await.unwrap();

        let mailbox = crate::adapters::InMemoryMailboxStore::new();
        let realtime = Arc::new(StreamHub::new());
        let machine = MailSyncStateMachine::new(provider, store.clone(), mailbox.clone(), realtime);

        machine.delta_sync("conn-1", "H2").await.unwrap();
        let ids_after_first = mailbox.all_external_ids().await;
        machine.delta_sync("conn-1", "H2").await.unwrap();
        let ids_after_second = mailbox.all_external_ids().await;

        assert_eq!(ids_after_first, ids_after_second);
        assert_eq!(ids_after_second, vec!["ext-dup".to_string()]);

        let final_state = store.get("conn-1").await.unwrap().unwrap();
        assert_eq!(final_state.history_id.as_deref(), Some("H2"));
    }

    #[tokio::test]
    async fn delta_sync_persists_advanced_history_id_without_regressing() {
        let provider = Arc::new(MockMailProvider::default());
        {
            let mut incremental = provider.incremental.lock().unwrap();
            incremental.push(crate::provider::IncrementalSyncOutcome::Delta {
                messages: vec![raw_message("ext-1")],
                deleted_external_ids: vec![],
                next_history_id: "H2".into(),
                has_more: false,
            });
        }
        let store = InMemorySyncStateStore::new();
        let mut state = SyncState::new("user-1", "conn-1", "gmail");
        state.history_id = Some("H1".into());
        store.upsert(state).await.unwrap();

        let mailbox = Arc::new(MockMailboxStore::default());
        let realtime = Arc::new(StreamHub::new());
        let machine = MailSyncStateMachine::new(provider, store.clone(), mailbox, realtime);

        machine.delta_sync("conn-1", "H2").await.unwrap();

        let final_state = store.get("conn-1").await.unwrap().unwrap();
        assert_eq!(final_state.history_id.as_deref(), Some("H2"));
        assert_eq!(final_state.status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn scenario_s6_gap_sync_required_falls_back_to_full_resync() {
        let provider = Arc::new(MockMailProvider::default());
        {
            let mut incremental = provider.incremental.lock().unwrap();
            incremental.push(crate::provider::IncrementalSyncOutcome::SyncRequired);
        }
        {
            let mut pages = provider.pages.lock().unwrap();
            pages.push(PagedSyncResultStub::page(5, None, Some("H200")));
        }
        let store = InMemorySyncStateStore::new();
        let mut state = SyncState::new("user-1", "conn-1", "gmail");
        state.first_sync_complete = true;
        state.history_id = Some("H100".into());
        store.upsert(state).await.unwrap();

        let mailbox = Arc::new(MockMailboxStore::default());
        let realtime = Arc::new(StreamHub::new());
        let machine = MailSyncStateMachine::new(provider.clone(), store.clone(), mailbox, realtime);
        machine.gap_sync("conn-1").await.unwrap();

        let final_state = store.get("conn-1").await.unwrap().unwrap();
        assert!(final_state.first_sync_complete);
        assert_eq!(final_state.phase, SyncPhase::Delta);
        assert_eq!(provider.watch_installs.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    struct PagedSyncResultStub;
    impl PagedSyncResultStub {
        fn page(count: usize, next: Option<&str>, history_id: Option<&str>) -> crate::provider::PagedSyncResult {
            crate::provider::PagedSyncResult {
                messages: (0..count).map(|i| raw_message(&format!("ext-{i}"))).collect(),
                next_page_token: next.map(|s| s.to_string()),
                history_id: history_id.map(|s| s.to_string()),
            }
        }
    }
}
