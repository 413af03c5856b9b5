use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notification delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    /// The release, user or repository behind the delivery no longer exists.
    Skipped,
    /// Gave up after the configured number of failed attempts.
    DeadLettered,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Skipped => write!(f, "skipped"),
            DeliveryStatus::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

/// A user in the system.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An upstream repository watched for new releases.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrackedRepo {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    /// Validator returned by the last conditional fetch (an HTTP `ETag`).
    pub etag: Option<String>,
    /// `None` until the first successful poll.
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedRepo {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            name: name.into(),
            etag: None,
            last_checked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `owner/name`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Whether the repository should be polled at `now`.
    pub fn is_due(&self, now: DateTime<Utc>, poll_interval: chrono::Duration) -> bool {
        match self.last_checked_at {
            Some(checked) => checked + poll_interval <= now,
            None => true,
        }
    }
}

/// A release observed upstream.
///
/// A new row is recorded every time the content hash for a `(repo, tag)` pair
/// changes, so one tag may own several rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Release {
    pub id: Uuid,
    pub repo_id: Uuid,
    pub tag: String,
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Hex SHA-256 over body, tag, title and url.
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// A user's subscription to a repository on one channel.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub repo_id: Uuid,
    pub user_id: Uuid,
    /// Channel-specific destination, e.g. a Telegram chat id.
    pub channel: String,
    pub created_at: DateTime<Utc>,
}

/// One obligation to notify one user, on one channel, about one release.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Delivery {
    pub id: Uuid,
    pub release_id: Uuid,
    pub user_id: Uuid,
    pub channel: String,
    pub status: DeliveryStatus,
    pub attempt: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    /// A fresh pending delivery of `release_id` for a subscription.
    pub fn pending(release_id: Uuid, user_id: Uuid, channel: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            release_id,
            user_id,
            channel: channel.into(),
            status: DeliveryStatus::Pending,
            attempt: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deterministic key identifying the logical notification.
    pub fn idempotency_key(&self) -> String {
        format!("notify:{}:{}:{}", self.release_id, self.user_id, self.channel)
    }
}
