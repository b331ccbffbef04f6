//! SyncRetry scheduler: every 30s, resumes connections whose backoff has
//! elapsed (spec §4.6, §4.5.2).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::sync::machine::MailSyncStateMachine;
use crate::sync::store::SyncStateStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub struct SyncRetryScheduler {
    cancel: CancellationToken,
}

impl SyncRetryScheduler {
    pub fn start(machine: Arc<MailSyncStateMachine>, store: Arc<dyn SyncStateStore>) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let scheduler = Arc::new(Self { cancel: cancel.clone() });

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => tick(&machine, &store).await,
                }
            }
        });

        (scheduler, handle)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn tick(machine: &Arc<MailSyncStateMachine>, store: &Arc<dyn SyncStateStore>) {
    let due = match store.get_pending_retries(chrono::Utc::now()).await {
        Ok(rows) => rows,
        Err(err) => {
            error!(error = %err, "sync retry lookup failed");
            return;
        }
    };
    if due.is_empty() {
        return;
    }
    info!(count = due.len(), "resuming due sync retries");
    for mut state in due {
        state.retry_count += 1;
        if let Err(err) = store.upsert(state.clone()).await {
            error!(connection_id = %state.connection_id, error = %err, "failed to persist retry counter");
            continue;
        }
        // InitialSync naturally resumes from checkpoint when one is present.
        if let Err(err) = machine.initial_sync(&state.user_id, &state.connection_id, &state.provider).await {
            error!(connection_id = %state.connection_id, error = %err, "sync retry attempt failed");
        }
    }
}
