//! Job type -> timeout mapping (spec §3 "Job Type -> Timeout Table").
//!
//! Read-mostly; mutable only at startup. Unknown types fall back to the
//! configured default (60s unless overridden).

use std::collections::HashMap;
use std::time::Duration;

use super::job::JobType;

#[derive(Debug, Clone)]
pub struct TimeoutTable {
    default: Duration,
    overrides: HashMap<String, Duration>,
}

impl TimeoutTable {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, job_type: JobType, timeout: Duration) -> Self {
        self.overrides.insert(job_type.as_str().to_string(), timeout);
        self
    }

    pub fn timeout_for(&self, job_type: &JobType) -> Duration {
        self.overrides
            .get(job_type.as_str())
            .copied()
            .unwrap_or(self.default)
    }
}

impl Default for TimeoutTable {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
