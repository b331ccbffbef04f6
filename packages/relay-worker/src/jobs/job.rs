//! Job model: the unit of deferred work (spec §3, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Priority enum — higher variants are serviced by the priority pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl JobPriority {
    pub fn is_priority(&self) -> bool {
        matches!(self, JobPriority::High | JobPriority::Critical)
    }
}

/// Job type tags from the catalogue in spec §6.
///
/// `Other` is a catch-all for type tags outside the enumerated set: the
/// dispatcher logs these at Warn and returns success rather than erroring,
/// so a rolling deploy can introduce new types without the older worker
/// generation dead-lettering them (spec §4.3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobType {
    MailSync,
    MailDeltaSync,
    MailSend,
    MailReply,
    MailSave,
    MailModify,
    AiClassify,
    AiClassifyBatch,
    AiSummarize,
    AiReply,
    RagIndex,
    RagBatchIndex,
    CalendarSync,
    WebhookRenew,
    Other(String),
}

impl JobType {
    pub fn as_str(&self) -> &str {
        match self {
            JobType::MailSync => "mail.sync",
            JobType::MailDeltaSync => "mail.delta_sync",
            JobType::MailSend => "mail.send",
            JobType::MailReply => "mail.reply",
            JobType::MailSave => "mail.save",
            JobType::MailModify => "mail.modify",
            JobType::AiClassify => "ai.classify",
            JobType::AiClassifyBatch => "ai.classify_batch",
            JobType::AiSummarize => "ai.summarize",
            JobType::AiReply => "ai.reply",
            JobType::RagIndex => "rag.index",
            JobType::RagBatchIndex => "rag.batch_index",
            JobType::CalendarSync => "calendar.sync",
            JobType::WebhookRenew => "webhook.renew",
            JobType::Other(s) => s,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, JobType::Other(_))
    }
}

impl From<&str> for JobType {
    fn from(s: &str) -> Self {
        match s {
            "mail.sync" => JobType::MailSync,
            "mail.delta_sync" => JobType::MailDeltaSync,
            "mail.send" => JobType::MailSend,
            "mail.reply" => JobType::MailReply,
            "mail.save" => JobType::MailSave,
            "mail.modify" => JobType::MailModify,
            "ai.classify" => JobType::AiClassify,
            "ai.classify_batch" => JobType::AiClassifyBatch,
            "ai.summarize" => JobType::AiSummarize,
            "ai.reply" => JobType::AiReply,
            "rag.index" => JobType::RagIndex,
            "rag.batch_index" => JobType::RagBatchIndex,
            "calendar.sync" => JobType::CalendarSync,
            "webhook.renew" => JobType::WebhookRenew,
            other => JobType::Other(other.to_string()),
        }
    }
}

impl Serialize for JobType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(JobType::from(s.as_str()))
    }
}

/// A typed, payload-bearing unit of deferred work.
///
/// `id` is preserved across retries so downstream writes can be made
/// idempotent; `retry_count` is monotonically non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub payload: HashMap<String, serde_json::Value>,
    pub priority: JobPriority,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl Job {
    pub fn new(job_type: JobType, payload: HashMap<String, serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_type,
            payload,
            priority: JobPriority::Normal,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Typed, structural decode of a payload field, per spec §9's
    /// "dynamic payloads -> tagged variants" design note.
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.payload
            .get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn require<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T, crate::error::WorkerError> {
        self.get(key)
            .ok_or_else(|| crate::error::WorkerError::Validation(format!("missing field `{key}`")))
    }

    /// Increment the retry counter, preserving id/type/payload (spec §3 invariant).
    pub fn into_retry(mut self) -> Self {
        self.retry_count += 1;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retry_preserves_id_and_increments_counter() {
        let job = Job::new(JobType::MailSync, HashMap::new());
        let id = job.id.clone();
        let retried = job.into_retry();
        assert_eq!(retried.id, id);
        assert_eq!(retried.retry_count, 1);
    }

    #[test]
    fn typed_field_roundtrips() {
        let mut payload = HashMap::new();
        payload.insert("connection_id".to_string(), json!("conn-1"));
        let job = Job::new(JobType::MailSync, payload);
        let conn: String = job.require("connection_id").unwrap();
        assert_eq!(conn, "conn-1");
        assert!(job.require::<String>("missing").is_err());
    }

    #[test]
    fn job_type_serializes_to_catalogue_string() {
        let s = serde_json::to_string(&JobType::AiClassifyBatch).unwrap();
        assert_eq!(s, "\"ai.classify_batch\"");
    }
}
