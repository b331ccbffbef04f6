pub mod classifier;
pub mod machine;
pub mod state;
pub mod store;

pub use machine::MailSyncStateMachine;
pub use state::{SyncPhase, SyncState, SyncStatus};
pub use store::{InMemorySyncStateStore, SyncStateStore};
