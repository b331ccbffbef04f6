//! Session & Proposal stores: in-process, TTL-swept maps with background
//! sweepers (spec §4.7, §3 "Action Proposal" / "Session").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const MAX_SESSION_MESSAGES: usize = 20;
const PROPOSAL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionProposal {
    pub id: String,
    pub action: String,
    pub data: Value,
    pub expires_at: DateTime<Utc>,
}

impl ActionProposal {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub messages: Vec<SessionMessage>,
    pub last_used_at: DateTime<Utc>,
}

/// Proposals keyed by `(user_id, proposal_id)`, with a periodic sweeper.
pub struct ProposalStore {
    rows: RwLock<HashMap<(String, String), ActionProposal>>,
    stop_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
}

impl ProposalStore {
    pub fn start() -> Arc<Self> {
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let store = Arc::new(Self { rows: RwLock::new(HashMap::new()), stop_tx, cancel: cancel.clone() });

        let sweep_target = store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROPOSAL_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => sweep_target.sweep().await,
                }
            }
        });

        store
    }

    pub async fn store(&self, user_id: &str, proposal: ActionProposal) {
        self.rows.write().await.insert((user_id.to_string(), proposal.id.clone()), proposal);
    }

    pub async fn get(&self, user_id: &str, id: &str) -> Option<ActionProposal> {
        let rows = self.rows.read().await;
        rows.get(&(user_id.to_string(), id.to_string()))
            .filter(|p| !p.is_expired())
            .cloned()
    }

    pub async fn list(&self, user_id: &str) -> Vec<ActionProposal> {
        self.rows
            .read()
            .await
            .iter()
            .filter(|((owner, _), p)| owner == user_id && !p.is_expired())
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub async fn remove(&self, user_id: &str, id: &str) {
        self.rows.write().await.remove(&(user_id.to_string(), id.to_string()));
    }

    async fn sweep(&self) {
        self.rows.write().await.retain(|_, p| !p.is_expired());
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let _ = self.stop_tx.send(()).await;
    }
}

/// Conversation memory: sliding window of at most `MAX_SESSION_MESSAGES`,
/// TTL-swept (spec §4.7, §3 invariant).
pub struct SessionStore {
    rows: RwLock<HashMap<String, Session>>,
    ttl: Duration,
    stop_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
}

impl SessionStore {
    pub fn start(ttl: Duration) -> Arc<Self> {
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let store = Arc::new(Self { rows: RwLock::new(HashMap::new()), ttl, stop_tx, cancel: cancel.clone() });

        let sweep_target = store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => sweep_target.sweep().await,
                }
            }
        });

        store
    }

    pub async fn get_or_create(&self, id: Option<&str>, user_id: &str) -> Session {
        let mut rows = self.rows.write().await;
        let id = id.map(|s| s.to_string()).unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = rows.entry(id.clone()).or_insert_with(|| Session {
            id: id.clone(),
            user_id: user_id.to_string(),
            messages: Vec::new(),
            last_used_at: Utc::now(),
        });
        session.last_used_at = Utc::now();
        session.clone()
    }

    pub async fn append(&self, id: &str, message: SessionMessage) {
        let mut rows = self.rows.write().await;
        if let Some(session) = rows.get_mut(id) {
            session.messages.push(message);
            if session.messages.len() > MAX_SESSION_MESSAGES {
                let overflow = session.messages.len() - MAX_SESSION_MESSAGES;
                session.messages.drain(0..overflow);
            }
            session.last_used_at = Utc::now();
        }
    }

    async fn sweep(&self) {
        let ttl = self.ttl;
        self.rows.write().await.retain(|_, s| Utc::now().signed_duration_since(s.last_used_at) < chrono::Duration::from_std(ttl).unwrap());
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let _ = self.stop_tx.send(()).await;
    }
}
