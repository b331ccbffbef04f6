pub mod background_sync;
pub mod gap_sync;
pub mod sync_retry;
pub mod watch_renew;

pub use background_sync::BackgroundSyncScheduler;
pub use gap_sync::GapSyncScheduler;
pub use sync_retry::SyncRetryScheduler;
pub use watch_renew::WatchRenewScheduler;
