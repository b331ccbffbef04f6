//! BackgroundSync scheduler: after a 30s warmup, every minute publishes a
//! `mail.sync` job (marked `background=true`) for connections whose initial
//! sync is incomplete and not currently running (spec §4.6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::jobs::job::{Job, JobType};
use crate::jobs::pool::JobPublisher;
use crate::sync::state::SyncStatus;
use crate::sync::store::SyncStateStore;

const WARMUP: Duration = Duration::from_secs(30);
const CHECK_INTERVAL: Duration = Duration::from_secs(60);

pub struct BackgroundSyncScheduler {
    cancel: CancellationToken,
}

impl BackgroundSyncScheduler {
    pub fn start(store: Arc<dyn SyncStateStore>, publisher: Arc<dyn JobPublisher>) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let scheduler = Arc::new(Self { cancel: cancel.clone() });

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(WARMUP) => {}
            }

            let mut interval = tokio::time::interval(CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => tick(&store, &publisher).await,
                }
            }
        });

        (scheduler, handle)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn tick(store: &Arc<dyn SyncStateStore>, publisher: &Arc<dyn JobPublisher>) {
    let incomplete = match store.get_all_with_checkpoint().await {
        Ok(rows) => rows,
        Err(err) => {
            error!(error = %err, "background sync lookup failed");
            return;
        }
    };
    let candidates: Vec<_> = incomplete.into_iter().filter(|s| s.status != SyncStatus::Syncing).collect();
    if candidates.is_empty() {
        return;
    }
    info!(count = candidates.len(), "background sync publishing resume jobs");
    for state in candidates {
        let mut payload = HashMap::new();
        payload.insert("connection_id".to_string(), json!(state.connection_id));
        payload.insert("user_id".to_string(), json!(state.user_id));
        payload.insert("provider".to_string(), json!(state.provider));
        payload.insert("full_sync".to_string(), json!(false));
        payload.insert("background".to_string(), json!(true));
        publisher.publish(Job::new(JobType::MailSync, payload)).await;
    }
}
