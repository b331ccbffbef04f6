//! Worker execution core: rate limiting, a worker pool with retry/DLQ
//! routing, an AI batch accumulator, a mail sync state machine, a scheduler
//! family, and the stream consumer tying a durable stream to the pool.

pub mod adapters;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod provider;
pub mod rate_limiter;
pub mod realtime;
pub mod schedulers;
pub mod stores;
pub mod stream;
pub mod sync;
pub mod telemetry;
