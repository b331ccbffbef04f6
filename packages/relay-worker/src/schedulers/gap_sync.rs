//! GapSync scheduler: startup fan-out across stuck connections, then a
//! periodic stale-connection sweep (spec §4.6).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::sync::machine::MailSyncStateMachine;
use crate::sync::store::SyncStateStore;
use crate::sync::state::SyncStatus;

const CHECK_INTERVAL: Duration = Duration::from_secs(300);
const STALE_AGE: Duration = Duration::from_secs(1800);
const MAX_CONCURRENT: usize = 5;

pub struct GapSyncScheduler {
    cancel: CancellationToken,
}

impl GapSyncScheduler {
    pub fn start(machine: Arc<MailSyncStateMachine>, store: Arc<dyn SyncStateStore>) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let scheduler = Arc::new(Self { cancel: cancel.clone() });

        let handle = tokio::spawn(async move {
            run_startup_fanout(&machine, &store).await;

            let mut interval = tokio::time::interval(CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => run_stale_sweep(&machine, &store).await,
                }
            }
        });

        (scheduler, handle)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn run_startup_fanout(machine: &Arc<MailSyncStateMachine>, store: &Arc<dyn SyncStateStore>) {
    let mut connections = Vec::new();
    for status in [SyncStatus::Idle, SyncStatus::Pending, SyncStatus::Error] {
        match store.get_by_status(status).await {
            Ok(rows) => connections.extend(rows),
            Err(err) => error!(error = %err, "gap sync startup lookup failed"),
        }
    }
    info!(count = connections.len(), "gap sync startup fan-out");
    fan_out(machine, connections.into_iter().map(|c| c.connection_id).collect()).await;
}

async fn run_stale_sweep(machine: &Arc<MailSyncStateMachine>, store: &Arc<dyn SyncStateStore>) {
    let stale = match store.get_stale_connections(chrono::Duration::from_std(STALE_AGE).unwrap()).await {
        Ok(rows) => rows,
        Err(err) => {
            error!(error = %err, "gap sync stale lookup failed");
            return;
        }
    };
    fan_out(machine, stale.into_iter().map(|c| c.connection_id).collect()).await;
}

async fn fan_out(machine: &Arc<MailSyncStateMachine>, connection_ids: Vec<String>) {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT));
    let mut handles = Vec::with_capacity(connection_ids.len());
    for connection_id in connection_ids {
        let machine = machine.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            if let Err(err) = machine.gap_sync(&connection_id).await {
                error!(connection_id = %connection_id, error = %err, "gap sync failed");
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}
