//! WatchRenew scheduler: hourly sweep of expiring watches (spec §4.6).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::sync::machine::MailSyncStateMachine;

const CHECK_INTERVAL: Duration = Duration::from_secs(3600);

pub struct WatchRenewScheduler {
    cancel: CancellationToken,
}

impl WatchRenewScheduler {
    pub fn start(machine: Arc<MailSyncStateMachine>) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let scheduler = Arc::new(Self { cancel: cancel.clone() });

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        info!("watch renew tick");
                        if let Err(err) = machine.renew_expired_watches().await {
                            error!(error = %err, "watch renewal sweep failed");
                        }
                    }
                }
            }
        });

        (scheduler, handle)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
