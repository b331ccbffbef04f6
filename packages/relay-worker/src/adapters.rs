//! Local, in-process adapters for the external collaborators declared in
//! `provider`. Real Gmail/Outlook/LLM/calendar/RAG clients live outside this
//! crate; these exist so the binary has something to wire by default.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Result, WorkerError};
use crate::provider::{
    CalendarProvider, ClassifyResult, IncrementalSyncOutcome, LlmService, MailProvider, MailboxStore, OAuthTokenSource,
    PagedSyncResult, RagIndexer, RawMessage, SentMessage, SummarizeResult, WatchHandle,
};

/// Stands in for a real provider SDK until one is configured; every call
/// reports the connection as requiring a fresh OAuth grant.
pub struct UnconfiguredMailProvider;

#[async_trait]
impl MailProvider for UnconfiguredMailProvider {
    async fn initial_sync(&self, _connection_id: &str, _page_token: Option<&str>, _months_back: u32) -> Result<PagedSyncResult> {
        Err(WorkerError::Credential("no mail provider configured".into()))
    }

    async fn incremental_sync(&self, _connection_id: &str, _history_id: &str) -> Result<IncrementalSyncOutcome> {
        Ok(IncrementalSyncOutcome::SyncRequired)
    }

    async fn install_watch(&self, _connection_id: &str) -> Result<WatchHandle> {
        Err(WorkerError::Credential("no mail provider configured".into()))
    }

    async fn stop_watch(&self, _connection_id: &str, _channel_id: &str) -> Result<()> {
        Ok(())
    }

    async fn send(&self, _connection_id: &str, _to: &[String], _subject: &str, _body: &str, _is_html: bool) -> Result<SentMessage> {
        Err(WorkerError::Credential("no mail provider configured".into()))
    }

    async fn batch_modify(&self, _connection_id: &str, _external_ids: &[String], _add_labels: &[String], _remove_labels: &[String]) -> Result<()> {
        Err(WorkerError::Credential("no mail provider configured".into()))
    }

    async fn lookup_existing(&self, _connection_id: &str, _external_ids: &[String]) -> Result<Vec<String>> {
        Ok(vec![])
    }

    async fn fetch_full_body(&self, _connection_id: &str, _external_id: &str) -> Result<String> {
        Err(WorkerError::Credential("no mail provider configured".into()))
    }
}

pub struct UnconfiguredLlmService;

#[async_trait]
impl LlmService for UnconfiguredLlmService {
    async fn classify_batch(&self, _email_ids: &[String]) -> Result<Vec<ClassifyResult>> {
        Err(WorkerError::ProviderProtocol("no LLM service configured".into()))
    }

    async fn summarize_batch(&self, _email_ids: &[String]) -> Result<Vec<SummarizeResult>> {
        Err(WorkerError::ProviderProtocol("no LLM service configured".into()))
    }

    async fn generate_reply(&self, _email_id: &str, _instructions: Option<&str>) -> Result<String> {
        Err(WorkerError::ProviderProtocol("no LLM service configured".into()))
    }
}

pub struct UnconfiguredCalendarProvider;

#[async_trait]
impl CalendarProvider for UnconfiguredCalendarProvider {
    async fn sync(&self, _connection_id: &str, _calendar_id: Option<&str>, _sync_token: Option<&str>, _full_sync: bool) -> Result<()> {
        Err(WorkerError::Credential("no calendar provider configured".into()))
    }
}

pub struct UnconfiguredRagIndexer;

#[async_trait]
impl RagIndexer for UnconfiguredRagIndexer {
    async fn index(&self, _email_id: &str) -> Result<()> {
        Err(WorkerError::ProviderProtocol("no RAG indexer configured".into()))
    }

    async fn index_batch(&self, _email_ids: &[String]) -> Result<()> {
        Err(WorkerError::ProviderProtocol("no RAG indexer configured".into()))
    }
}

pub struct UnconfiguredOAuthTokenSource;

#[async_trait]
impl OAuthTokenSource for UnconfiguredOAuthTokenSource {
    async fn refresh(&self, _connection_id: &str) -> Result<()> {
        Err(WorkerError::Credential("no OAuth token source configured".into()))
    }

    async fn mark_disconnected(&self, _connection_id: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MailboxRow {
    owner: String,
    category: Option<String>,
    summary: Option<String>,
}

/// Process-local mailbox store, useful for local runs and tests that need a
/// real (not scripted) `MailboxStore` without a database.
#[derive(Default)]
pub struct InMemoryMailboxStore {
    rows: Mutex<HashMap<String, MailboxRow>>,
}

impl InMemoryMailboxStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[cfg(test)]
    pub async fn all_external_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rows.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl MailboxStore for InMemoryMailboxStore {
    async fn upsert(&self, connection_id: &str, message: RawMessage) -> Result<String> {
        let mut rows = self.rows.lock().unwrap();
        rows.entry(message.external_id.clone()).or_insert_with(|| MailboxRow {
            owner: connection_id.to_string(),
            category: None,
            summary: None,
        });
        Ok(message.external_id)
    }

    async fn delete_by_external_id(&self, _connection_id: &str, external_id: &str) -> Result<()> {
        self.rows.lock().unwrap().remove(external_id);
        Ok(())
    }

    async fn owner_of(&self, email_id: &str) -> Result<Option<String>> {
        Ok(self.rows.lock().unwrap().get(email_id).map(|r| r.owner.clone()))
    }

    async fn mark_classified(&self, email_id: &str, category: &str) -> Result<()> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(email_id) {
            row.category = Some(category.to_string());
        }
        Ok(())
    }

    async fn mark_summarized(&self, email_id: &str, summary: &str) -> Result<()> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(email_id) {
            row.summary = Some(summary.to_string());
        }
        Ok(())
    }

    async fn unclassified_ids(&self, connection_id: &str, limit: usize) -> Result<Vec<String>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|(_, row)| row.owner == connection_id && row.category.is_none())
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect())
    }
}
