//! Delivery fan-out for newly detected releases.

use beacon_common::error::AppError;
use beacon_common::types::{Delivery, Release};

use crate::ports::{DeliveryStore, SubscriptionStore};

/// Creates one pending delivery per subscription of a release's repository.
///
/// Creation is keyed by `(release, user, channel)` and never overwrites an
/// existing row, so re-running after a crash (or racing another replica)
/// neither duplicates nor resets deliveries.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryEnqueuer;

impl DeliveryEnqueuer {
    pub fn new() -> Self {
        Self
    }

    /// Returns the number of deliveries actually created.
    ///
    /// `store` may be a plain store or an open transaction.
    pub async fn enqueue<S>(&self, store: &S, release: &Release) -> Result<usize, AppError>
    where
        S: SubscriptionStore + DeliveryStore + ?Sized,
    {
        let subscriptions = store.list_subscriptions_by_repo(release.repo_id).await?;
        let mut created = 0;

        for sub in &subscriptions {
            let delivery = Delivery::pending(release.id, sub.user_id, sub.channel.clone());
            if store.create_delivery_if_absent(&delivery).await? {
                created += 1;
                tracing::debug!(
                    delivery_id = %delivery.id,
                    release_id = %release.id,
                    user_id = %sub.user_id,
                    channel = %sub.channel,
                    "Delivery enqueued"
                );
            } else {
                tracing::debug!(
                    release_id = %release.id,
                    user_id = %sub.user_id,
                    channel = %sub.channel,
                    "Delivery already exists"
                );
            }
        }

        tracing::info!(
            release_id = %release.id,
            tag = %release.tag,
            subscriptions = subscriptions.len(),
            created,
            "Deliveries enqueued"
        );

        Ok(created)
    }
}
