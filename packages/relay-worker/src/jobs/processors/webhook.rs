//! Webhook processor: `webhook.renew` (spec §6 job catalogue). This is the
//! job-triggered counterpart to the WatchRenew scheduler (spec §4.6) — both
//! end up calling the same sync-machine entry point.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, WorkerError};
use crate::jobs::dispatcher::Processor;
use crate::jobs::job::Job;
use crate::sync::machine::MailSyncStateMachine;

pub struct WebhookProcessor {
    machine: Arc<MailSyncStateMachine>,
}

impl WebhookProcessor {
    pub fn new(machine: Arc<MailSyncStateMachine>) -> Self {
        Self { machine }
    }
}

#[async_trait]
impl Processor for WebhookProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        match job.job_type.as_str() {
            "webhook.renew" => self.machine.renew_expired_watches().await,
            other => Err(WorkerError::UnknownJobType(other.to_string())),
        }
    }
}
