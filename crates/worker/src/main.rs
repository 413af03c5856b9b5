//! ReleaseBeacon worker: runs the poll loop and the notify loop until Ctrl+C.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use beacon_common::config::AppConfig;
use beacon_common::db;
use beacon_common::redis_pool::connect_redis;
use beacon_common::telemetry::init_tracing;
use beacon_engine::idempotency::RedisIdempotencyStore;
use beacon_engine::pg_store::PgStore;
use beacon_engine::ports::Store;
use beacon_engine::{ClaimPolicy, IdempotencyGuard, RequeuePolicy, RetryPolicy};
use beacon_notifier::{Notifier, TelegramChannel};
use beacon_poller::{GitHubReleaseSource, ReleasePoller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("beacon_worker=info,beacon_poller=info,beacon_notifier=info,beacon_engine=info");

    tracing::info!("ReleaseBeacon worker starting...");

    let config = AppConfig::from_env()?;
    let bot_token = config
        .telegram_bot_token
        .clone()
        .ok_or_else(|| anyhow::anyhow!("TELEGRAM_BOT_TOKEN environment variable is required"))?;

    let pool = db::connect_postgres(&config.database_url, config.db_max_connections).await?;
    let redis = connect_redis(&config.redis_url).await?;

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let retry = RetryPolicy::new(config.retry_attempts, config.retry_base_delay())
        .with_call_timeout(config.outbound_timeout());

    let source = GitHubReleaseSource::new(
        config.github_api_url.clone(),
        config.github_token.clone(),
        config.outbound_timeout(),
    )?;
    if config.github_token.is_none() {
        tracing::warn!("GITHUB_TOKEN not set, using the unauthenticated rate limit");
    }
    let poller = Arc::new(
        ReleasePoller::new(store.clone(), Arc::new(source), retry, config.poll_interval())
            .with_concurrency(config.poll_concurrency),
    );

    let claim_policy = if config.idempotency_release_on_failure {
        ClaimPolicy::ReleaseOnFailure
    } else {
        ClaimPolicy::HoldUntilExpiry
    };
    let guard = IdempotencyGuard::new(Arc::new(RedisIdempotencyStore::new(redis)), claim_policy);
    let channel = TelegramChannel::new(
        config.telegram_api_url.clone(),
        bot_token,
        config.outbound_timeout(),
    )?;
    let notifier = Arc::new(
        Notifier::new(store, Arc::new(channel), guard, retry)
            .with_requeue(RequeuePolicy::new(
                config.requeue_max_attempts,
                config.requeue_base_backoff(),
            ))
            .with_guard_ttl(config.idempotency_ttl())
            .with_batch_size(config.notify_batch_size),
    );

    let shutdown = CancellationToken::new();

    let poll_task = tokio::spawn({
        let poller = poller.clone();
        let shutdown = shutdown.clone();
        let tick = config.poll_tick();
        async move { poller.run(tick, shutdown).await }
    });
    let notify_task = tokio::spawn({
        let notifier = notifier.clone();
        let shutdown = shutdown.clone();
        let interval = config.notify_interval();
        async move { notifier.run(interval, shutdown).await }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    shutdown.cancel();

    let (poll_result, notify_result) = tokio::join!(poll_task, notify_task);
    if let Err(e) = poll_result {
        tracing::error!(error = %e, "Poll loop panicked");
    }
    if let Err(e) = notify_result {
        tracing::error!(error = %e, "Notify loop panicked");
    }

    tracing::info!("ReleaseBeacon worker stopped.");
    Ok(())
}
