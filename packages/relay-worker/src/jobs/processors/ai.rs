//! AI processor: `ai.classify`, `ai.classify_batch`, `ai.summarize`,
//! `ai.reply` (spec §6 job catalogue). Single-item classify/summarize route
//! through the batch accumulator; the rest call the LLM service directly.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::error::{Result, WorkerError};
use crate::jobs::ai_batch::AiBatchProcessor;
use crate::jobs::dispatcher::Processor;
use crate::jobs::job::Job;
use crate::provider::{LlmService, MailboxStore};
use crate::realtime::{RealtimeChannel, RealtimeEvent};

pub struct AiProcessor {
    batcher: Arc<AiBatchProcessor>,
    llm: Arc<dyn LlmService>,
    mailbox: Arc<dyn MailboxStore>,
    realtime: Arc<dyn RealtimeChannel>,
}

impl AiProcessor {
    pub fn new(batcher: Arc<AiBatchProcessor>, llm: Arc<dyn LlmService>, mailbox: Arc<dyn MailboxStore>, realtime: Arc<dyn RealtimeChannel>) -> Self {
        Self { batcher, llm, mailbox, realtime }
    }
}

#[async_trait]
impl Processor for AiProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        match job.job_type.as_str() {
            "ai.classify" => {
                let email_id: String = job.require("email_id")?;
                self.batcher.process_classify(email_id).await
            }
            "ai.summarize" => {
                let email_id: String = job.require("email_id")?;
                self.batcher.process_summarize(email_id).await
            }
            "ai.classify_batch" => {
                let email_ids: Vec<String> = job.require("email_ids")?;
                let user_id: String = job.require("user_id")?;
                let results = self.llm.classify_batch(&email_ids).await?;
                for result in results {
                    self.mailbox.mark_classified(&result.email_id, &result.category).await?;
                    let event = RealtimeEvent::new("email.classified", json!({ "email_id": result.email_id, "category": result.category }));
                    self.realtime.publish(&user_id, event).await;
                }
                Ok(())
            }
            "ai.reply" => {
                let email_id: String = job.require("email_id")?;
                let instructions: Option<String> = job.get("instructions");
                let reply = self.llm.generate_reply(&email_id, instructions.as_deref()).await?;
                if let Some(user_id) = self.mailbox.owner_of(&email_id).await? {
                    let event = RealtimeEvent::new("email.reply_sent", json!({ "email_id": email_id, "reply": reply }));
                    self.realtime.publish(&user_id, event).await;
                }
                Ok(())
            }
            other => Err(WorkerError::UnknownJobType(other.to_string())),
        }
    }
}
