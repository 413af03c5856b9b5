//! Ports consumed by the detection-and-delivery pipeline.
//!
//! Every collaborator the pipeline talks to is a trait here and is injected at
//! construction time. `pg_store` and `memory` implement the repository ports;
//! the poller and notifier crates implement the release source and the
//! notification channel.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{Delivery, DeliveryStatus, Release, Subscription, TrackedRepo, User};

#[async_trait]
pub trait RepoStore: Send + Sync {
    async fn create_repo(&self, repo: &TrackedRepo) -> Result<(), AppError>;

    async fn get_repo(&self, id: Uuid) -> Result<Option<TrackedRepo>, AppError>;

    async fn get_repo_by_owner_name(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Option<TrackedRepo>, AppError>;

    /// Store the validator and poll timestamp after a poll.
    async fn update_poll_state(
        &self,
        id: Uuid,
        etag: Option<&str>,
        checked_at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// Repositories never polled, or last polled at least `poll_interval` before `now`.
    async fn list_due_for_poll(
        &self,
        now: DateTime<Utc>,
        poll_interval: Duration,
    ) -> Result<Vec<TrackedRepo>, AppError>;
}

#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Insert a release. Returns `false` when a row with the same
    /// `(repo_id, tag, hash)` already exists.
    async fn create_release(&self, release: &Release) -> Result<bool, AppError>;

    async fn get_release(&self, id: Uuid) -> Result<Option<Release>, AppError>;

    /// Most recently stored release for `(repo_id, tag)`.
    async fn latest_release_for_tag(
        &self,
        repo_id: Uuid,
        tag: &str,
    ) -> Result<Option<Release>, AppError>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn list_subscriptions_by_repo(&self, repo_id: Uuid) -> Result<Vec<Subscription>, AppError>;
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert a delivery unless one exists for `(release_id, user_id, channel)`.
    /// An existing row is left untouched. Returns whether a row was created.
    async fn create_delivery_if_absent(&self, delivery: &Delivery) -> Result<bool, AppError>;

    async fn update_delivery_status(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        last_error: Option<&str>,
        attempt: i32,
    ) -> Result<(), AppError>;

    /// Oldest pending deliveries first.
    async fn list_pending_deliveries(&self, limit: i64) -> Result<Vec<Delivery>, AppError>;

    async fn list_failed_deliveries(&self, limit: i64) -> Result<Vec<Delivery>, AppError>;

    /// Compare-and-set on the status column. Returns `false` if the delivery
    /// was no longer in `from`.
    async fn transition_delivery_status(
        &self,
        id: Uuid,
        from: DeliveryStatus,
        to: DeliveryStatus,
    ) -> Result<bool, AppError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, AppError>;
}

/// An open transaction exposing every repository.
///
/// Writes become visible to others only after `commit`. Dropping the
/// transaction without committing rolls it back.
#[async_trait]
pub trait StoreTransaction:
    RepoStore + ReleaseStore + SubscriptionStore + DeliveryStore + UserStore
{
    async fn commit(self: Box<Self>) -> Result<(), AppError>;
}

#[async_trait]
pub trait Transactor: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, AppError>;
}

/// The full persistent store.
pub trait Store:
    RepoStore + ReleaseStore + SubscriptionStore + DeliveryStore + UserStore + Transactor
{
}

/// Release data as reported by the upstream source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRelease {
    pub tag: String,
    pub title: String,
    pub url: String,
    pub body: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Result of a conditional fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceResponse {
    /// `None` when the validator matched ("not modified") or nothing is published.
    pub release: Option<UpstreamRelease>,
    /// Validator to present on the next fetch, when the source returned one.
    pub validator: Option<String>,
}

impl SourceResponse {
    pub fn not_modified() -> Self {
        Self::default()
    }

    pub fn modified(release: UpstreamRelease, validator: Option<String>) -> Self {
        Self {
            release: Some(release),
            validator,
        }
    }
}

/// Upstream release source supporting conditional fetches.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn latest_release(
        &self,
        owner: &str,
        name: &str,
        validator: Option<&str>,
    ) -> Result<SourceResponse, AppError>;
}

/// Messaging channel that delivers notifications to users.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name for identification and logging
    fn name(&self) -> &'static str;

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), AppError>;
}
