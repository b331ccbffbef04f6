//! Mail processor: `mail.sync`, `mail.delta_sync`, `mail.send`, `mail.reply`,
//! `mail.save`, `mail.modify` (spec §6 job catalogue).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Result, WorkerError};
use crate::jobs::dispatcher::Processor;
use crate::jobs::job::Job;
use crate::provider::{MailProvider, MailboxStore, RawMessage};
use crate::sync::machine::MailSyncStateMachine;

pub struct MailProcessor {
    machine: Arc<MailSyncStateMachine>,
    provider: Arc<dyn MailProvider>,
    mailbox: Arc<dyn MailboxStore>,
}

impl MailProcessor {
    pub fn new(machine: Arc<MailSyncStateMachine>, provider: Arc<dyn MailProvider>, mailbox: Arc<dyn MailboxStore>) -> Self {
        Self { machine, provider, mailbox }
    }
}

#[derive(Debug, Deserialize)]
struct SavedEmail {
    external_id: String,
    subject: String,
    from: String,
    #[serde(default)]
    to: Vec<String>,
    #[serde(default)]
    cc: Vec<String>,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    has_attach: bool,
    #[serde(default)]
    folder: String,
    #[serde(default)]
    labels: Vec<String>,
    received_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
impl Processor for MailProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        match job.job_type.as_str() {
            "mail.sync" => {
                let connection_id: String = job.require("connection_id")?;
                let user_id: String = job.require("user_id")?;
                let provider: String = job.require("provider")?;
                self.machine.initial_sync(&user_id, &connection_id, &provider).await
            }
            "mail.delta_sync" => {
                let connection_id: String = job.require("connection_id")?;
                let history_id: String = job.require("history_id")?;
                self.machine.delta_sync(&connection_id, &history_id).await
            }
            "mail.send" => {
                let connection_id: String = job.require("connection_id")?;
                let to: Vec<String> = job.require("to")?;
                let subject: String = job.require("subject")?;
                let body: String = job.require("body")?;
                let is_html: bool = job.get("is_html").unwrap_or(false);
                self.provider.send(&connection_id, &to, &subject, &body, is_html).await?;
                Ok(())
            }
            "mail.reply" => {
                let connection_id: String = job.require("connection_id")?;
                let to: Vec<String> = job.require("to")?;
                let subject: String = job.require("subject")?;
                let body: String = job.require("body")?;
                let is_html: bool = job.get("is_html").unwrap_or(false);
                self.provider.send(&connection_id, &to, &subject, &body, is_html).await?;
                Ok(())
            }
            "mail.save" => {
                let connection_id: String = job.require("connection_id")?;
                let emails: Vec<SavedEmail> = job.require("emails")?;
                for email in emails {
                    let message = RawMessage {
                        external_id: email.external_id,
                        subject: email.subject,
                        from: email.from,
                        to: email.to,
                        cc: email.cc,
                        snippet: email.snippet,
                        is_read: email.is_read,
                        has_attachments: email.has_attach,
                        folder: email.folder,
                        labels: email.labels,
                        received_at: email.received_at,
                        headers: Default::default(),
                    };
                    self.mailbox.upsert(&connection_id, message).await?;
                }
                Ok(())
            }
            "mail.modify" => {
                let connection_id: String = job.require("connection_id")?;
                let external_ids: Vec<String> = job.get("external_ids").unwrap_or_default();
                let add_labels: Vec<String> = job.get("add_labels").unwrap_or_default();
                let remove_labels: Vec<String> = job.get("remove_labels").unwrap_or_default();
                self.provider.batch_modify(&connection_id, &external_ids, &add_labels, &remove_labels).await
            }
            other => Err(WorkerError::UnknownJobType(other.to_string())),
        }
    }
}
