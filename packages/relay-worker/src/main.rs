//! Composition root: wires every collaborator and runs the worker core
//! under one of three modes (spec §6 "CLI surface").

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};

use relay_core::adapters::{
    InMemoryMailboxStore, UnconfiguredCalendarProvider, UnconfiguredLlmService, UnconfiguredMailProvider,
    UnconfiguredRagIndexer,
};
use relay_core::config::Config;
use relay_core::jobs::{AiBatchProcessor, DeadLetterQueue, Dispatcher, JobType, PoolConfig, TimeoutTable, WorkerPool};
use relay_core::jobs::processors::{AiProcessor, CalendarProcessor, MailProcessor, RagProcessor, WebhookProcessor};
use relay_core::metrics::Metrics;
use relay_core::rate_limiter::RateLimiter;
use relay_core::realtime;
use relay_core::schedulers::{BackgroundSyncScheduler, GapSyncScheduler, SyncRetryScheduler, WatchRenewScheduler};
use relay_core::stores::{ProposalStore, SessionStore};
use relay_core::sync::{InMemorySyncStateStore, MailSyncStateMachine};
use relay_core::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Api,
    Worker,
    All,
}

#[derive(Parser, Debug)]
#[command(name = "relay", about = "Mail/calendar/AI automation worker core")]
struct Cli {
    #[arg(long, value_enum, default_value = "all")]
    mode: Mode,
}

const SESSION_TTL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    tracing::info!(mode = ?cli.mode, "starting relay worker core");

    let metrics = Arc::new(Metrics::new());
    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_max_tokens,
        config.rate_limit_refill_per_interval,
        config.rate_limit_interval,
    ));
    let (dlq, dlq_handle) = DeadLetterQueue::start(config.dlq_capacity);
    let timeout_table = Arc::new(TimeoutTable::default());

    let mail_provider = Arc::new(UnconfiguredMailProvider);
    let llm_service = Arc::new(UnconfiguredLlmService);
    let calendar_provider = Arc::new(UnconfiguredCalendarProvider);
    let rag_indexer = Arc::new(UnconfiguredRagIndexer);
    let mailbox_store = InMemoryMailboxStore::new();
    let sync_store = InMemorySyncStateStore::new();
    let realtime = realtime::shared();

    let sync_machine = MailSyncStateMachine::new(mail_provider.clone(), sync_store.clone(), mailbox_store.clone(), realtime.clone());

    let ai_batcher = AiBatchProcessor::new(
        config.ai_batch_size,
        config.ai_batch_timeout,
        llm_service.clone(),
        mailbox_store.clone(),
        realtime.clone(),
    );
    let ticker_handle = ai_batcher.spawn_ticker();

    let mut dispatcher = Dispatcher::new();
    dispatcher.register(JobType::MailSync, Arc::new(MailProcessor::new(sync_machine.clone(), mail_provider.clone(), mailbox_store.clone())));
    dispatcher.register(JobType::MailDeltaSync, Arc::new(MailProcessor::new(sync_machine.clone(), mail_provider.clone(), mailbox_store.clone())));
    dispatcher.register(JobType::MailSend, Arc::new(MailProcessor::new(sync_machine.clone(), mail_provider.clone(), mailbox_store.clone())));
    dispatcher.register(JobType::MailReply, Arc::new(MailProcessor::new(sync_machine.clone(), mail_provider.clone(), mailbox_store.clone())));
    dispatcher.register(JobType::MailSave, Arc::new(MailProcessor::new(sync_machine.clone(), mail_provider.clone(), mailbox_store.clone())));
    dispatcher.register(JobType::MailModify, Arc::new(MailProcessor::new(sync_machine.clone(), mail_provider.clone(), mailbox_store.clone())));
    dispatcher.register(
        JobType::AiClassify,
        Arc::new(AiProcessor::new(ai_batcher.clone(), llm_service.clone(), mailbox_store.clone(), realtime.clone())),
    );
    dispatcher.register(
        JobType::AiClassifyBatch,
        Arc::new(AiProcessor::new(ai_batcher.clone(), llm_service.clone(), mailbox_store.clone(), realtime.clone())),
    );
    dispatcher.register(
        JobType::AiSummarize,
        Arc::new(AiProcessor::new(ai_batcher.clone(), llm_service.clone(), mailbox_store.clone(), realtime.clone())),
    );
    dispatcher.register(
        JobType::AiReply,
        Arc::new(AiProcessor::new(ai_batcher.clone(), llm_service.clone(), mailbox_store.clone(), realtime.clone())),
    );
    dispatcher.register(JobType::RagIndex, Arc::new(RagProcessor::new(rag_indexer.clone())));
    dispatcher.register(JobType::RagBatchIndex, Arc::new(RagProcessor::new(rag_indexer.clone())));
    dispatcher.register(JobType::CalendarSync, Arc::new(CalendarProcessor::new(calendar_provider.clone())));
    dispatcher.register(JobType::WebhookRenew, Arc::new(WebhookProcessor::new(sync_machine.clone())));

    let pool_config = PoolConfig {
        max_workers: config.max_workers,
        queue_capacity: config.queue_capacity,
        worker_batch_size: config.worker_batch_size,
        channel_buffer_size: config.channel_buffer_size,
        default_job_timeout: config.default_job_timeout,
        dlq_capacity: config.dlq_capacity,
    };
    let pool = WorkerPool::new(pool_config, Arc::new(dispatcher), timeout_table, rate_limiter, metrics, dlq);
    pool.set_ai_batcher(ai_batcher).await;
    sync_machine.set_publisher(pool.clone()).await;
    pool.start().await;

    let proposal_store = ProposalStore::start();
    let session_store = SessionStore::start(SESSION_TTL);

    let (watch_renew, watch_renew_handle) = WatchRenewScheduler::start(sync_machine.clone());
    let (gap_sync, gap_sync_handle) = GapSyncScheduler::start(sync_machine.clone(), sync_store.clone());
    let (sync_retry, sync_retry_handle) = SyncRetryScheduler::start(sync_machine.clone(), sync_store.clone());
    let (background_sync, background_sync_handle) = BackgroundSyncScheduler::start(sync_store.clone(), pool.clone());

    if cli.mode == Mode::Api {
        tracing::warn!("api-only mode has no HTTP surface in this core; running schedulers and pool only");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    watch_renew.stop();
    gap_sync.stop();
    sync_retry.stop();
    background_sync.stop();
    let _ = tokio::join!(watch_renew_handle, gap_sync_handle, sync_retry_handle, background_sync_handle);

    proposal_store.stop().await;
    session_store.stop().await;
    ticker_handle.abort();

    pool.wait().await;
    pool.stop().await;
    let _ = dlq_handle.await;

    Ok(())
}
