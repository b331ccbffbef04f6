//! Application configuration loaded from environment variables.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Worker pool + scheduler configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub worker_batch_size: usize,
    pub channel_buffer_size: usize,
    pub default_job_timeout: Duration,
    pub rate_limit_max_tokens: u64,
    pub rate_limit_refill_per_interval: u64,
    pub rate_limit_interval: Duration,
    pub dlq_capacity: usize,
    pub ai_batch_size: usize,
    pub ai_batch_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults spec.md's Pool Config section names.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            max_workers: env_or("WORKER_MAX_WORKERS", 16)?,
            queue_capacity: env_or("WORKER_QUEUE_CAPACITY", 1000)?,
            worker_batch_size: env_or("WORKER_BATCH_SIZE", 1)?,
            channel_buffer_size: env_or("WORKER_CHANNEL_BUFFER", 1000)?,
            default_job_timeout: Duration::from_secs(env_or("WORKER_DEFAULT_TIMEOUT_SECS", 60)?),
            rate_limit_max_tokens: env_or("WORKER_RATE_LIMIT_MAX_TOKENS", 100)?,
            rate_limit_refill_per_interval: env_or("WORKER_RATE_LIMIT_REFILL", 100)?,
            rate_limit_interval: Duration::from_secs(env_or("WORKER_RATE_LIMIT_INTERVAL_SECS", 1)?),
            dlq_capacity: env_or("WORKER_DLQ_CAPACITY", 100)?,
            ai_batch_size: env_or("AI_BATCH_SIZE", 10)?,
            ai_batch_timeout: Duration::from_secs(env_or("AI_BATCH_TIMEOUT_SECS", 3)?),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 16,
            queue_capacity: 1000,
            worker_batch_size: 1,
            channel_buffer_size: 1000,
            default_job_timeout: Duration::from_secs(60),
            rate_limit_max_tokens: 100,
            rate_limit_refill_per_interval: 100,
            rate_limit_interval: Duration::from_secs(1),
            dlq_capacity: 100,
            ai_batch_size: 10,
            ai_batch_timeout: Duration::from_secs(3),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{key} must be valid: {e}")),
        Err(_) => Ok(default),
    }
    .context(format!("failed to load {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.max_workers, 16);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.default_job_timeout, Duration::from_secs(60));
        assert_eq!(config.dlq_capacity, 100);
        assert_eq!(config.ai_batch_size, 10);
        assert_eq!(config.ai_batch_timeout, Duration::from_secs(3));
    }
}
