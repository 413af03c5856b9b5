//! Requeue policy for failed deliveries.
//!
//! A failed delivery goes back to `pending` once its backoff has elapsed,
//! and is dead-lettered once it has used up its attempts:
//!
//! - `attempt >= max_attempts` → `dead_lettered`
//! - `updated_at + base_backoff * 2^(attempt - 1) <= now` → `pending`
//! - otherwise left alone until a later cycle
//!
//! Transitions are compare-and-set on the status, so two notifier replicas
//! applying the policy at once cannot both move the same row. The requeued
//! rows are reported back so the caller can drop the idempotency claims the
//! failed attempt left behind; otherwise the claim would hold the row until
//! its TTL regardless of the backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};

use beacon_common::error::AppError;
use beacon_common::types::{Delivery, DeliveryStatus};

use crate::ports::DeliveryStore;

/// Cap on the backoff exponent; the delay stops growing after this many doublings.
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeuePolicy {
    pub max_attempts: i32,
    pub base_backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueDecision {
    Wait,
    Requeue,
    DeadLetter,
}

#[derive(Debug, Clone, Default)]
pub struct RequeueReport {
    /// Deliveries moved back to `pending`, as they were before the move.
    pub requeued: Vec<Delivery>,
    pub dead_lettered: usize,
    pub waiting: usize,
}

impl RequeuePolicy {
    pub fn new(max_attempts: i32, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
        }
    }

    /// Backoff that must elapse after the `attempt`-th failure.
    pub fn backoff_for(&self, attempt: i32) -> Duration {
        let exponent = (attempt.max(1) as u32 - 1).min(MAX_BACKOFF_EXPONENT);
        self.base_backoff.saturating_mul(1 << exponent)
    }

    pub fn decide(&self, delivery: &Delivery, now: DateTime<Utc>) -> RequeueDecision {
        if delivery.attempt >= self.max_attempts {
            return RequeueDecision::DeadLetter;
        }

        let backoff = chrono::Duration::from_std(self.backoff_for(delivery.attempt))
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        match delivery.updated_at.checked_add_signed(backoff) {
            Some(ready_at) if ready_at <= now => RequeueDecision::Requeue,
            _ => RequeueDecision::Wait,
        }
    }

    /// Apply the policy to up to `limit` failed deliveries.
    pub async fn apply<S>(
        &self,
        store: &S,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<RequeueReport, AppError>
    where
        S: DeliveryStore + ?Sized,
    {
        let failed = store.list_failed_deliveries(limit).await?;
        let mut report = RequeueReport::default();

        for delivery in failed {
            match self.decide(&delivery, now) {
                RequeueDecision::Wait => report.waiting += 1,
                RequeueDecision::Requeue => {
                    if store
                        .transition_delivery_status(
                            delivery.id,
                            DeliveryStatus::Failed,
                            DeliveryStatus::Pending,
                        )
                        .await?
                    {
                        report.requeued.push(delivery);
                    }
                }
                RequeueDecision::DeadLetter => {
                    if store
                        .transition_delivery_status(
                            delivery.id,
                            DeliveryStatus::Failed,
                            DeliveryStatus::DeadLettered,
                        )
                        .await?
                    {
                        tracing::warn!(
                            delivery_id = %delivery.id,
                            attempt = delivery.attempt,
                            last_error = delivery.last_error.as_deref().unwrap_or(""),
                            "Delivery dead-lettered"
                        );
                        report.dead_lettered += 1;
                    }
                }
            }
        }

        if !report.requeued.is_empty() || report.dead_lettered > 0 {
            tracing::info!(
                requeued = report.requeued.len(),
                dead_lettered = report.dead_lettered,
                waiting = report.waiting,
                "Failed deliveries processed"
            );
        }

        Ok(report)
    }
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use uuid::Uuid;

    fn failed(attempt: i32, updated_secs_ago: i64, now: DateTime<Utc>) -> Delivery {
        let mut d = Delivery::pending(Uuid::new_v4(), Uuid::new_v4(), "chat");
        d.status = DeliveryStatus::Failed;
        d.attempt = attempt;
        d.updated_at = now - chrono::Duration::seconds(updated_secs_ago);
        d
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RequeuePolicy::new(5, Duration::from_secs(60));
        assert_eq!(policy.backoff_for(1), Duration::from_secs(60));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(120));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(240));
        assert_eq!(policy.backoff_for(0), Duration::from_secs(60));
    }

    #[test]
    fn test_decide() {
        let now = Utc::now();
        let policy = RequeuePolicy::new(3, Duration::from_secs(60));

        assert_eq!(policy.decide(&failed(1, 30, now), now), RequeueDecision::Wait);
        assert_eq!(policy.decide(&failed(1, 60, now), now), RequeueDecision::Requeue);
        assert_eq!(policy.decide(&failed(2, 100, now), now), RequeueDecision::Wait);
        assert_eq!(policy.decide(&failed(2, 120, now), now), RequeueDecision::Requeue);
        assert_eq!(policy.decide(&failed(3, 0, now), now), RequeueDecision::DeadLetter);
    }

    #[tokio::test]
    async fn test_apply_reports_requeued_rows() {
        let now = Utc::now();
        let store = MemoryStore::new();
        let ready = failed(1, 120, now);
        let waiting = failed(2, 10, now);
        let exhausted = failed(3, 0, now);
        for d in [&ready, &waiting, &exhausted] {
            store.insert_delivery(d.clone());
        }

        let report = RequeuePolicy::new(3, Duration::from_secs(60))
            .apply(&store, now, 10)
            .await
            .unwrap();

        let requeued: Vec<_> = report.requeued.iter().map(|d| d.id).collect();
        assert_eq!(requeued, vec![ready.id]);
        assert_eq!(report.waiting, 1);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(store.delivery(ready.id).unwrap().status, DeliveryStatus::Pending);
        assert_eq!(
            store.delivery(exhausted.id).unwrap().status,
            DeliveryStatus::DeadLettered
        );
    }
}
