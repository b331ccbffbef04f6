//! Error taxonomy for the worker execution core.
//!
//! Handlers return `WorkerError`; the pool pattern-matches on the variant to
//! decide retry vs. dead-letter vs. pass-through, rather than sniffing error
//! message strings (see spec §7).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    /// Payload parse failure or missing required field. Terminal for the job.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Storage timeout, provider 5xx, stream blip. Retried up to 3 times.
    #[error("transient infrastructure error: {0}")]
    Transient(#[from] anyhow::Error),

    /// Sync-token expired / history id too old. Not a failure, triggers a
    /// semantic fallback (InitialSync / FullResync) rather than retry/DLQ.
    #[error("provider protocol fallback required: {0}")]
    ProviderProtocol(String),

    /// OAuth refresh returned `invalid_grant` or similar. Terminal, no retry.
    #[error("credential error: {0}")]
    Credential(String),

    /// Per-type deadline exceeded. Treated like transient infra: retry then DLQ.
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    /// Handler panicked. The pool isolates the task and records a failure.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Unknown job type tag. Logged at Warn, not an error (no DLQ).
    #[error("unknown job type: {0}")]
    UnknownJobType(String),
}

impl WorkerError {
    /// Whether the pool should retry this job (vs. routing straight to the DLQ).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkerError::Transient(_) | WorkerError::DeadlineExceeded(_) | WorkerError::Panicked(_)
        )
    }

    /// Whether this error is terminal and should never retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerError::Validation(_) | WorkerError::Credential(_))
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
