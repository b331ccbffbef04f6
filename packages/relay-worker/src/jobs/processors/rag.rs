//! RAG processor: `rag.index`, `rag.batch_index` (spec §6 job catalogue).

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, WorkerError};
use crate::jobs::dispatcher::Processor;
use crate::jobs::job::Job;
use crate::provider::RagIndexer;

pub struct RagProcessor {
    indexer: Arc<dyn RagIndexer>,
}

impl RagProcessor {
    pub fn new(indexer: Arc<dyn RagIndexer>) -> Self {
        Self { indexer }
    }
}

#[async_trait]
impl Processor for RagProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        match job.job_type.as_str() {
            "rag.index" => {
                let email_id: String = job.require("email_id")?;
                self.indexer.index(&email_id).await
            }
            "rag.batch_index" => {
                let email_ids: Vec<String> = job.require("email_ids")?;
                self.indexer.index_batch(&email_ids).await
            }
            other => Err(WorkerError::UnknownJobType(other.to_string())),
        }
    }
}
