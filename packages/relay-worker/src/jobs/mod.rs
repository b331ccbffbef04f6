pub mod ai_batch;
pub mod dispatcher;
pub mod dlq;
pub mod job;
pub mod pool;
pub mod processors;
pub mod timeout_table;

pub use ai_batch::AiBatchProcessor;
pub use dispatcher::{Dispatcher, Processor};
pub use dlq::{DeadLetterEntry, DeadLetterQueue};
pub use job::{Job, JobPriority, JobType};
pub use pool::{JobCompletion, JobPublisher, PoolConfig, WorkerPool};
pub use timeout_table::TimeoutTable;
