//! Job dispatcher: fan-out from job type to processor (spec §4.3).
//!
//! Grounded on the teacher's `JobRegistry` (`kernel/jobs/registry.rs`), which
//! maps job-type strings to boxed async handlers; here the map is keyed by
//! the enumerated [`JobType`] plus a graceful-degradation path for
//! `JobType::Other`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use super::job::{Job, JobType};
use crate::error::Result;

/// A processor handles exactly one job type (or a small related family).
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<()>;
}

#[derive(Default)]
pub struct Dispatcher {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: JobType, processor: Arc<dyn Processor>) {
        self.processors.insert(job_type.as_str().to_string(), processor);
    }

    /// Dispatch a job to its processor. Unknown job types are logged at Warn
    /// and treated as success (no DLQ) — graceful degradation for rolling
    /// deploys where newer types may appear mid-transition (spec §4.3).
    pub async fn dispatch(&self, job: &Job) -> Result<()> {
        match self.processors.get(job.job_type.as_str()) {
            Some(processor) => processor.process(job).await,
            None => {
                warn!(job_id = %job.id, job_type = %job.job_type.as_str(), "unknown job type, skipping");
                Ok(())
            }
        }
    }
}
