//! Sync state persistence port (spec §4.8, §6 persisted state layout).
//!
//! Grounded on the teacher's `TestJobManager` in-memory backing
//! (`kernel/jobs/manager.rs`), generalized from jobs to sync state rows.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::state::{SyncState, SyncStatus};
use crate::error::Result;

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn upsert(&self, state: SyncState) -> Result<()>;
    async fn get(&self, connection_id: &str) -> Result<Option<SyncState>>;
    async fn get_by_status(&self, status: SyncStatus) -> Result<Vec<SyncState>>;
    async fn get_pending_retries(&self, now: DateTime<Utc>) -> Result<Vec<SyncState>>;
    async fn get_stale_connections(&self, max_age: chrono::Duration) -> Result<Vec<SyncState>>;
    async fn get_all_with_checkpoint(&self) -> Result<Vec<SyncState>>;
    async fn get_expired_watches(&self, before: DateTime<Utc>) -> Result<Vec<SyncState>>;

    /// Advances `history_id` only if the candidate is greater than the
    /// stored value (spec §3, §8 invariant 5).
    async fn advance_history_id(&self, connection_id: &str, candidate: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemorySyncStateStore {
    rows: RwLock<HashMap<String, SyncState>>,
}

impl InMemorySyncStateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SyncStateStore for InMemorySyncStateStore {
    async fn upsert(&self, state: SyncState) -> Result<()> {
        self.rows.write().await.insert(state.connection_id.clone(), state);
        Ok(())
    }

    async fn get(&self, connection_id: &str) -> Result<Option<SyncState>> {
        Ok(self.rows.read().await.get(connection_id).cloned())
    }

    async fn get_by_status(&self, status: SyncStatus) -> Result<Vec<SyncState>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn get_pending_retries(&self, now: DateTime<Utc>) -> Result<Vec<SyncState>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|s| matches!(s.next_retry_at, Some(at) if at <= now))
            .cloned()
            .collect())
    }

    async fn get_stale_connections(&self, max_age: chrono::Duration) -> Result<Vec<SyncState>> {
        let cutoff = Utc::now() - max_age;
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|s| {
                let watch_expired = matches!(s.watch_expires_at, Some(at) if at <= Utc::now());
                watch_expired || s.last_updated_at <= cutoff
            })
            .cloned()
            .collect())
    }

    async fn get_all_with_checkpoint(&self) -> Result<Vec<SyncState>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|s| s.has_checkpoint() && !s.first_sync_complete)
            .cloned()
            .collect())
    }

    async fn get_expired_watches(&self, before: DateTime<Utc>) -> Result<Vec<SyncState>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|s| matches!(s.watch_expires_at, Some(at) if at <= before))
            .cloned()
            .collect())
    }

    async fn advance_history_id(&self, connection_id: &str, candidate: &str) -> Result<()> {
        let mut rows = self.rows.write().await;
        if let Some(state) = rows.get_mut(connection_id) {
            state.advance_history_id(candidate);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_by_status_filters_correctly() {
        let store = InMemorySyncStateStore::new();
        let mut idle = SyncState::new("u1", "c1", "gmail");
        idle.status = SyncStatus::Idle;
        let mut pending = SyncState::new("u1", "c2", "gmail");
        pending.status = SyncStatus::Pending;
        store.upsert(idle).await.unwrap();
        store.upsert(pending).await.unwrap();

        let idle_rows = store.get_by_status(SyncStatus::Idle).await.unwrap();
        assert_eq!(idle_rows.len(), 1);
        assert_eq!(idle_rows[0].connection_id, "c1");
    }

    #[tokio::test]
    async fn advance_history_id_is_monotonic_through_store() {
        let store = InMemorySyncStateStore::new();
        store.upsert(SyncState::new("u1", "c1", "gmail")).await.unwrap();
        store.advance_history_id("c1", "100").await.unwrap();
        store.advance_history_id("c1", "50").await.unwrap();
        let state = store.get("c1").await.unwrap().unwrap();
        assert_eq!(state.history_id.as_deref(), Some("100"));
    }

    #[tokio::test]
    async fn expired_watches_are_found() {
        let store = InMemorySyncStateStore::new();
        let mut state = SyncState::new("u1", "c1", "gmail");
        state.watch_expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.upsert(state).await.unwrap();

        let expired = store.get_expired_watches(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
    }
}
