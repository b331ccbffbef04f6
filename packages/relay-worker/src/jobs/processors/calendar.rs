//! Calendar processor: `calendar.sync` (spec §6 job catalogue).

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, WorkerError};
use crate::jobs::dispatcher::Processor;
use crate::jobs::job::Job;
use crate::provider::CalendarProvider;

pub struct CalendarProcessor {
    provider: Arc<dyn CalendarProvider>,
}

impl CalendarProcessor {
    pub fn new(provider: Arc<dyn CalendarProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Processor for CalendarProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        match job.job_type.as_str() {
            "calendar.sync" => {
                let connection_id: String = job.require("connection_id")?;
                let calendar_id: Option<String> = job.get("calendar_id");
                let sync_token: Option<String> = job.get("sync_token");
                let full_sync: bool = job.get("full_sync").unwrap_or(false);
                self.provider.sync(&connection_id, calendar_id.as_deref(), sync_token.as_deref(), full_sync).await
            }
            other => Err(WorkerError::UnknownJobType(other.to_string())),
        }
    }
}
