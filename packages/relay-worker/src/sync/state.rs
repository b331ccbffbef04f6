//! Sync state data model (spec §3 "Sync State").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Pending,
    Syncing,
    Idle,
    Error,
    WatchExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    InitialFirstBatch,
    InitialRemaining,
    Gap,
    FullResync,
    Delta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub user_id: String,
    pub connection_id: String,
    pub provider: String,
    pub status: SyncStatus,
    pub phase: SyncPhase,
    pub history_id: Option<String>,
    pub checkpoint_page_token: Option<String>,
    pub checkpoint_synced_count: u64,
    pub watch_expires_at: Option<DateTime<Utc>>,
    pub watch_channel_id: Option<String>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub first_sync_complete: bool,
    pub last_updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl SyncState {
    pub fn new(user_id: impl Into<String>, connection_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            connection_id: connection_id.into(),
            provider: provider.into(),
            status: SyncStatus::Pending,
            phase: SyncPhase::InitialFirstBatch,
            history_id: None,
            checkpoint_page_token: None,
            checkpoint_synced_count: 0,
            watch_expires_at: None,
            watch_channel_id: None,
            retry_count: 0,
            next_retry_at: None,
            first_sync_complete: false,
            last_updated_at: Utc::now(),
            error_message: None,
        }
    }

    pub fn has_checkpoint(&self) -> bool {
        self.checkpoint_page_token.is_some()
    }

    /// Monotonic write: only advances `history_id`, never regresses it
    /// (spec §3 invariant, §8 invariant 5). History ids are opaque per the
    /// provider contract, but in practice are decimal counters, so numeric
    /// comparison is tried first with a lexical fallback for ids that don't
    /// parse (e.g. a provider using opaque tokens instead).
    pub fn advance_history_id(&mut self, candidate: &str) {
        let should_advance = match &self.history_id {
            None => true,
            Some(current) => match (candidate.parse::<u64>(), current.parse::<u64>()) {
                (Ok(c), Ok(cur)) => c > cur,
                _ => candidate > current.as_str(),
            },
        };
        if should_advance {
            self.history_id = Some(candidate.to_string());
        }
    }

    pub fn clear_checkpoint(&mut self) {
        self.checkpoint_page_token = None;
        self.checkpoint_synced_count = 0;
    }

    pub fn reset_retries(&mut self) {
        self.retry_count = 0;
        self.next_retry_at = None;
        self.error_message = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_id_never_regresses() {
        let mut state = SyncState::new("u1", "c1", "gmail");
        state.advance_history_id("100");
        state.advance_history_id("50");
        assert_eq!(state.history_id.as_deref(), Some("100"));
        state.advance_history_id("200");
        assert_eq!(state.history_id.as_deref(), Some("200"));
    }

    #[test]
    fn checkpoint_presence_tracks_page_token() {
        let mut state = SyncState::new("u1", "c1", "gmail");
        assert!(!state.has_checkpoint());
        state.checkpoint_page_token = Some("P2".into());
        assert!(state.has_checkpoint());
        state.clear_checkpoint();
        assert!(!state.has_checkpoint());
    }
}
