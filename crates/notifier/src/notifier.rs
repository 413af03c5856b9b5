use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use beacon_common::error::AppError;
use beacon_common::types::{Delivery, DeliveryStatus};
use beacon_engine::ports::{
    DeliveryStore, NotificationChannel, ReleaseStore, RepoStore, Store, UserStore,
};
use beacon_engine::{GuardOutcome, IdempotencyGuard, RequeuePolicy, RetryPolicy};

use crate::message::format_release_message;

/// Terminal result of handling one delivery inside the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    Sent,
    Failed,
    /// Release, user or repository no longer exists; nothing was sent.
    Skipped,
}

/// Counters for one notification cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifySummary {
    pub requeued: usize,
    pub dead_lettered: usize,
    pub pending: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    pub already_claimed: usize,
    pub errors: usize,
}

/// Drains pending deliveries.
///
/// Every delivery runs under an idempotency claim keyed on
/// `(release, user, channel)`, so two overlapping cycles (or two replicas)
/// never send the same notification twice within the claim TTL.
pub struct Notifier {
    store: Arc<dyn Store>,
    channel: Arc<dyn NotificationChannel>,
    guard: IdempotencyGuard,
    retry: RetryPolicy,
    requeue: RequeuePolicy,
    guard_ttl: Duration,
    batch_size: i64,
}

impl Notifier {
    pub fn new(
        store: Arc<dyn Store>,
        channel: Arc<dyn NotificationChannel>,
        guard: IdempotencyGuard,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            channel,
            guard,
            retry,
            requeue: RequeuePolicy::default(),
            guard_ttl: Duration::from_secs(600),
            batch_size: 100,
        }
    }

    pub fn with_requeue(mut self, requeue: RequeuePolicy) -> Self {
        self.requeue = requeue;
        self
    }

    pub fn with_guard_ttl(mut self, ttl: Duration) -> Self {
        self.guard_ttl = ttl;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run notification cycles every `interval` until `shutdown` is cancelled.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            channel = self.channel.name(),
            interval_secs = interval.as_secs(),
            batch_size = self.batch_size,
            "Notifier started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.notify_cycle(&shutdown).await {
                        Ok(summary) if summary.pending > 0 || summary.requeued > 0 => {
                            tracing::info!(
                                pending = summary.pending,
                                sent = summary.sent,
                                failed = summary.failed,
                                skipped = summary.skipped,
                                already_claimed = summary.already_claimed,
                                errors = summary.errors,
                                requeued = summary.requeued,
                                dead_lettered = summary.dead_lettered,
                                "Notification cycle complete"
                            );
                        }
                        Ok(_) => tracing::debug!("No pending deliveries"),
                        Err(e) => tracing::error!(error = %e, "Notification cycle failed"),
                    }
                }
            }
        }

        tracing::info!("Notifier stopped");
    }

    /// Requeue eligible failed deliveries, then handle one batch of pending ones.
    ///
    /// Only listing the pending batch can fail the cycle. Errors on a single
    /// delivery are logged, counted, and leave that delivery for a later cycle.
    pub async fn notify_cycle(&self, shutdown: &CancellationToken) -> anyhow::Result<NotifySummary> {
        let mut summary = NotifySummary::default();

        match self
            .requeue
            .apply(&*self.store, Utc::now(), self.batch_size)
            .await
        {
            Ok(report) => {
                // The failed attempt's claim would otherwise outlive the backoff
                for delivery in &report.requeued {
                    if let Err(e) = self.guard.release(&delivery.idempotency_key()).await {
                        tracing::warn!(
                            delivery_id = %delivery.id,
                            error = %e,
                            "Failed to release claim of requeued delivery"
                        );
                    }
                }
                summary.requeued = report.requeued.len();
                summary.dead_lettered = report.dead_lettered;
            }
            Err(e) => tracing::warn!(error = %e, "Requeue of failed deliveries failed"),
        }

        let pending = self.store.list_pending_deliveries(self.batch_size).await?;
        summary.pending = pending.len();

        for delivery in &pending {
            if shutdown.is_cancelled() {
                tracing::info!("Shutdown requested, leaving remaining deliveries pending");
                break;
            }

            match self.notify_one(delivery).await {
                Ok(GuardOutcome::Executed(DeliveryResult::Sent)) => summary.sent += 1,
                Ok(GuardOutcome::Executed(DeliveryResult::Failed)) => summary.failed += 1,
                Ok(GuardOutcome::Executed(DeliveryResult::Skipped)) => summary.skipped += 1,
                Ok(GuardOutcome::AlreadyClaimed) => summary.already_claimed += 1,
                Err(e) if e.is_guard() => {
                    summary.errors += 1;
                    tracing::warn!(
                        delivery_id = %delivery.id,
                        error = %e,
                        "Claim store unavailable, delivery left pending"
                    );
                }
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(
                        delivery_id = %delivery.id,
                        error = %e,
                        "Failed to process delivery"
                    );
                }
            }
        }

        Ok(summary)
    }

    /// Handle one delivery under its idempotency claim.
    pub async fn notify_one(
        &self,
        delivery: &Delivery,
    ) -> Result<GuardOutcome<DeliveryResult>, AppError> {
        let key = delivery.idempotency_key();
        self.guard
            .run(&key, self.guard_ttl, || self.deliver(delivery))
            .await
    }

    async fn deliver(&self, delivery: &Delivery) -> Result<DeliveryResult, AppError> {
        let attempt = delivery.attempt + 1;

        let Some(release) = self.store.get_release(delivery.release_id).await? else {
            return self.skip(delivery, "release not found").await;
        };
        if self.store.get_user(delivery.user_id).await?.is_none() {
            return self.skip(delivery, "user not found").await;
        }
        let Some(repo) = self.store.get_repo(release.repo_id).await? else {
            return self.skip(delivery, "repository not found").await;
        };

        let text = format_release_message(&repo, &release);
        let sent = self
            .retry
            .retry("send notification", || {
                self.channel.send(&delivery.channel, &text)
            })
            .await;

        match sent {
            Ok(()) => {
                self.store
                    .update_delivery_status(delivery.id, DeliveryStatus::Sent, None, attempt)
                    .await?;
                tracing::info!(
                    delivery_id = %delivery.id,
                    release_id = %release.id,
                    repo = %repo.full_name(),
                    tag = %release.tag,
                    channel = self.channel.name(),
                    "Notification sent"
                );
                Ok(DeliveryResult::Sent)
            }
            Err(e) => {
                let reason = e.to_string();
                self.store
                    .update_delivery_status(
                        delivery.id,
                        DeliveryStatus::Failed,
                        Some(&reason),
                        attempt,
                    )
                    .await?;
                tracing::warn!(
                    delivery_id = %delivery.id,
                    attempt,
                    error = %reason,
                    "Notification failed"
                );
                Ok(DeliveryResult::Failed)
            }
        }
    }

    async fn skip(&self, delivery: &Delivery, reason: &str) -> Result<DeliveryResult, AppError> {
        tracing::warn!(delivery_id = %delivery.id, reason, "Skipping delivery");
        self.store
            .update_delivery_status(
                delivery.id,
                DeliveryStatus::Skipped,
                Some(reason),
                delivery.attempt + 1,
            )
            .await?;
        Ok(DeliveryResult::Skipped)
    }
}
