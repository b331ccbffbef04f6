//! Port interfaces for external collaborators (spec §1 out-of-scope list,
//! §4.8). Only contracts are specified here; real implementations (Gmail,
//! Outlook, an LLM client, a relational mailbox store) live outside this
//! crate. Each trait ships an in-memory test double for unit tests.
//!
//! Naming follows the teacher's `Base*` convention for infrastructure seams
//! (`kernel/traits.rs`: `BaseAI`, `BaseEmbeddingService`, …).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub external_id: String,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub snippet: String,
    pub is_read: bool,
    pub has_attachments: bool,
    pub folder: String,
    pub labels: Vec<String>,
    pub received_at: DateTime<Utc>,
    /// Raw header map, consulted by the header-based classification shortcut
    /// (spec §4.5.1) before any row is persisted.
    pub headers: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct PagedSyncResult {
    pub messages: Vec<RawMessage>,
    pub next_page_token: Option<String>,
    /// Present on the final page: the provider's current history id, to be
    /// persisted as the sync baseline once initial/full sync completes.
    pub history_id: Option<String>,
}

/// Returned from `incremental_sync`; `SyncRequired` is surfaced as the
/// `WorkerError::ProviderProtocol` terminal-but-semantic case (spec §7).
#[derive(Debug, Clone)]
pub enum IncrementalSyncOutcome {
    Delta {
        messages: Vec<RawMessage>,
        deleted_external_ids: Vec<String>,
        next_history_id: String,
        has_more: bool,
    },
    SyncRequired,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct WatchHandle {
    pub expires_at: DateTime<Utc>,
    pub channel_id: String,
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub external_id: String,
    pub sent_at: DateTime<Utc>,
}

/// A mail/calendar provider SDK contract (Gmail, Outlook, …) — spec §6
/// "Provider contract".
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn initial_sync(
        &self,
        connection_id: &str,
        page_token: Option<&str>,
        months_back: u32,
    ) -> Result<PagedSyncResult>;

    async fn incremental_sync(
        &self,
        connection_id: &str,
        history_id: &str,
    ) -> Result<IncrementalSyncOutcome>;

    async fn install_watch(&self, connection_id: &str) -> Result<WatchHandle>;

    /// Best-effort: failures here never block a fresh `install_watch` call.
    async fn stop_watch(&self, connection_id: &str, channel_id: &str) -> Result<()>;

    async fn send(
        &self,
        connection_id: &str,
        to: &[String],
        subject: &str,
        body: &str,
        is_html: bool,
    ) -> Result<SentMessage>;

    async fn batch_modify(
        &self,
        connection_id: &str,
        external_ids: &[String],
        add_labels: &[String],
        remove_labels: &[String],
    ) -> Result<()>;

    /// Batched lookup by external id, used by FullResync to avoid N+1 (spec §4.5).
    async fn lookup_existing(&self, connection_id: &str, external_ids: &[String]) -> Result<Vec<String>>;

    /// Fetches a message's full body, used by DeltaSync to push one complete
    /// realtime event for push-triggered arrivals (spec §4.5, freshness
    /// over latency design choice).
    async fn fetch_full_body(&self, connection_id: &str, external_id: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct ClassifyResult {
    pub email_id: String,
    pub category: String,
}

#[derive(Debug, Clone)]
pub struct SummarizeResult {
    pub email_id: String,
    pub summary: String,
}

/// The LLM classify/summarize client contract, consumed only by the AI
/// Batch Processor and the AI processor family (spec §4.4).
#[async_trait]
pub trait LlmService: Send + Sync {
    async fn classify_batch(&self, email_ids: &[String]) -> Result<Vec<ClassifyResult>>;
    async fn summarize_batch(&self, email_ids: &[String]) -> Result<Vec<SummarizeResult>>;

    /// On-demand reply drafting; not coalesced through the batch processor
    /// since `ai.reply` jobs are not affinity-grouped (spec §6).
    async fn generate_reply(&self, email_id: &str, instructions: Option<&str>) -> Result<String>;
}

/// The calendar provider SDK contract (spec §1 out-of-scope external collaborator).
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    async fn sync(&self, connection_id: &str, calendar_id: Option<&str>, sync_token: Option<&str>, full_sync: bool) -> Result<()>;
}

/// The RAG indexer contract (spec §1 out-of-scope external collaborator).
#[async_trait]
pub trait RagIndexer: Send + Sync {
    async fn index(&self, email_id: &str) -> Result<()>;
    async fn index_batch(&self, email_ids: &[String]) -> Result<()>;
}

/// Observes credential failures from OAuth refresh (spec §7 Credential taxonomy entry).
#[async_trait]
pub trait OAuthTokenSource: Send + Sync {
    async fn refresh(&self, connection_id: &str) -> Result<()>;
    async fn mark_disconnected(&self, connection_id: &str) -> Result<()>;
}

/// Persistence of mail rows (spec §6 persisted state layout, mailbox half).
#[async_trait]
pub trait MailboxStore: Send + Sync {
    async fn upsert(&self, connection_id: &str, message: RawMessage) -> Result<String>;
    async fn delete_by_external_id(&self, connection_id: &str, external_id: &str) -> Result<()>;
    async fn owner_of(&self, email_id: &str) -> Result<Option<String>>;
    async fn mark_classified(&self, email_id: &str, category: &str) -> Result<()>;
    async fn mark_summarized(&self, email_id: &str, summary: &str) -> Result<()>;
    async fn unclassified_ids(&self, connection_id: &str, limit: usize) -> Result<Vec<String>>;
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory `MailProvider` double: returns scripted pages/deltas set up
    /// by the test, mirroring the teacher's `TestDependencies` mocks
    /// (`kernel/test_dependencies.rs`).
    #[derive(Default)]
    pub struct MockMailProvider {
        pub pages: Mutex<Vec<PagedSyncResult>>,
        pub incremental: Mutex<Vec<IncrementalSyncOutcome>>,
        pub watch_installs: std::sync::atomic::AtomicUsize,
        /// When set, `initial_sync` fails once with `WorkerError::Credential`
        /// instead of returning a page, then clears itself — for scripting a
        /// token-expiry scenario.
        pub credential_failure: Mutex<Option<String>>,
    }

    #[async_trait]
    impl MailProvider for MockMailProvider {
        async fn initial_sync(&self, _connection_id: &str, _page_token: Option<&str>, _months_back: u32) -> Result<PagedSyncResult> {
            if let Some(reason) = self.credential_failure.lock().unwrap().take() {
                return Err(crate::error::WorkerError::Credential(reason));
            }
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                return Ok(PagedSyncResult { messages: vec![], next_page_token: None, history_id: None });
            }
            Ok(pages.remove(0))
        }

        async fn incremental_sync(&self, _connection_id: &str, _history_id: &str) -> Result<IncrementalSyncOutcome> {
            let mut outcomes = self.incremental.lock().unwrap();
            if outcomes.is_empty() {
                return Ok(IncrementalSyncOutcome::Delta {
                    messages: vec![],
                    deleted_external_ids: vec![],
                    next_history_id: "0".into(),
                    has_more: false,
                });
            }
            Ok(outcomes.remove(0))
        }

        async fn install_watch(&self, _connection_id: &str) -> Result<WatchHandle> {
            self.watch_installs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(WatchHandle {
                expires_at: Utc::now() + chrono::Duration::hours(24),
                channel_id: "chan-1".into(),
            })
        }

        async fn stop_watch(&self, _connection_id: &str, _channel_id: &str) -> Result<()> {
            Ok(())
        }

        async fn send(&self, _connection_id: &str, _to: &[String], _subject: &str, _body: &str, _is_html: bool) -> Result<SentMessage> {
            Ok(SentMessage { external_id: "sent-1".into(), sent_at: Utc::now() })
        }

        async fn batch_modify(&self, _connection_id: &str, _external_ids: &[String], _add_labels: &[String], _remove_labels: &[String]) -> Result<()> {
            Ok(())
        }

        async fn lookup_existing(&self, _connection_id: &str, _external_ids: &[String]) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn fetch_full_body(&self, _connection_id: &str, _external_id: &str) -> Result<String> {
            Ok("full body".into())
        }
    }

    #[derive(Default)]
    pub struct MockLlmService {
        pub classify_calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl LlmService for MockLlmService {
        async fn classify_batch(&self, email_ids: &[String]) -> Result<Vec<ClassifyResult>> {
            self.classify_calls.lock().unwrap().push(email_ids.to_vec());
            Ok(email_ids
                .iter()
                .map(|id| ClassifyResult { email_id: id.clone(), category: "primary".into() })
                .collect())
        }

        async fn summarize_batch(&self, email_ids: &[String]) -> Result<Vec<SummarizeResult>> {
            Ok(email_ids
                .iter()
                .map(|id| SummarizeResult { email_id: id.clone(), summary: "summary".into() })
                .collect())
        }

        async fn generate_reply(&self, _email_id: &str, _instructions: Option<&str>) -> Result<String> {
            Ok("drafted reply".into())
        }
    }

    #[derive(Default)]
    pub struct MockCalendarProvider;

    #[async_trait]
    impl CalendarProvider for MockCalendarProvider {
        async fn sync(&self, _connection_id: &str, _calendar_id: Option<&str>, _sync_token: Option<&str>, _full_sync: bool) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockRagIndexer {
        pub indexed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RagIndexer for MockRagIndexer {
        async fn index(&self, email_id: &str) -> Result<()> {
            self.indexed.lock().unwrap().push(email_id.to_string());
            Ok(())
        }

        async fn index_batch(&self, email_ids: &[String]) -> Result<()> {
            self.indexed.lock().unwrap().extend(email_ids.iter().cloned());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockMailboxStore {
        pub owners: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl MailboxStore for MockMailboxStore {
        async fn upsert(&self, _connection_id: &str, message: RawMessage) -> Result<String> {
            Ok(message.external_id)
        }

        async fn delete_by_external_id(&self, _connection_id: &str, _external_id: &str) -> Result<()> {
            Ok(())
        }

        async fn owner_of(&self, email_id: &str) -> Result<Option<String>> {
            Ok(self.owners.lock().unwrap().get(email_id).cloned())
        }

        async fn mark_classified(&self, _email_id: &str, _category: &str) -> Result<()> {
            Ok(())
        }

        async fn mark_summarized(&self, _email_id: &str, _summary: &str) -> Result<()> {
            Ok(())
        }

        async fn unclassified_ids(&self, _connection_id: &str, _limit: usize) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }
}
