//! PostgreSQL implementation of the repository ports.
//!
//! Uniqueness is enforced by the schema (`migrations/0001_init.sql`) and every
//! insert uses `ON CONFLICT DO NOTHING`, so concurrent pollers and notifiers
//! never create duplicate releases or deliveries.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool, Postgres};
use tokio::sync::Mutex;
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{Delivery, DeliveryStatus, Release, Subscription, TrackedRepo, User};

use crate::ports::{
    DeliveryStore, ReleaseStore, RepoStore, Store, StoreTransaction, SubscriptionStore,
    Transactor, UserStore,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// A transaction opened by [`PgStore::begin`]. Rolled back on drop unless committed.
pub struct PgTransaction {
    tx: Mutex<sqlx::Transaction<'static, Postgres>>,
}

mod queries {
    use super::*;

    const REPO_COLUMNS: &str =
        "id, owner, name, etag, last_checked_at, created_at, updated_at";
    const RELEASE_COLUMNS: &str =
        "id, repo_id, tag, title, url, published_at, hash, created_at";
    const DELIVERY_COLUMNS: &str =
        "id, release_id, user_id, channel, status, attempt, last_error, created_at, updated_at";

    pub async fn create_repo<'e, E: PgExecutor<'e>>(
        ex: E,
        repo: &TrackedRepo,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO tracked_repos (id, owner, name, etag, last_checked_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(repo.id)
        .bind(&repo.owner)
        .bind(&repo.name)
        .bind(&repo.etag)
        .bind(repo.last_checked_at)
        .bind(repo.created_at)
        .bind(repo.updated_at)
        .execute(ex)
        .await?;
        Ok(())
    }

    pub async fn get_repo<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
    ) -> Result<Option<TrackedRepo>, AppError> {
        let repo = sqlx::query_as::<_, TrackedRepo>(&format!(
            "SELECT {} FROM tracked_repos WHERE id = $1",
            REPO_COLUMNS
        ))
        .bind(id)
        .fetch_optional(ex)
        .await?;
        Ok(repo)
    }

    pub async fn get_repo_by_owner_name<'e, E: PgExecutor<'e>>(
        ex: E,
        owner: &str,
        name: &str,
    ) -> Result<Option<TrackedRepo>, AppError> {
        let repo = sqlx::query_as::<_, TrackedRepo>(&format!(
            "SELECT {} FROM tracked_repos WHERE owner = $1 AND name = $2",
            REPO_COLUMNS
        ))
        .bind(owner)
        .bind(name)
        .fetch_optional(ex)
        .await?;
        Ok(repo)
    }

    pub async fn update_poll_state<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
        etag: Option<&str>,
        checked_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE tracked_repos SET etag = $2, last_checked_at = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(etag)
        .bind(checked_at)
        .execute(ex)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("tracked repo {}", id)));
        }
        Ok(())
    }

    pub async fn list_due_for_poll<'e, E: PgExecutor<'e>>(
        ex: E,
        now: DateTime<Utc>,
        poll_interval: Duration,
    ) -> Result<Vec<TrackedRepo>, AppError> {
        let interval = chrono::Duration::from_std(poll_interval)
            .map_err(|e| AppError::Config(format!("poll interval out of range: {}", e)))?;
        let cutoff = now - interval;

        let repos = sqlx::query_as::<_, TrackedRepo>(&format!(
            r#"
            SELECT {} FROM tracked_repos
            WHERE last_checked_at IS NULL OR last_checked_at <= $1
            ORDER BY last_checked_at ASC NULLS FIRST
            "#,
            REPO_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(ex)
        .await?;
        Ok(repos)
    }

    pub async fn create_release<'e, E: PgExecutor<'e>>(
        ex: E,
        release: &Release,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO releases (id, repo_id, tag, title, url, published_at, hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (repo_id, tag, hash) DO NOTHING
            "#,
        )
        .bind(release.id)
        .bind(release.repo_id)
        .bind(&release.tag)
        .bind(&release.title)
        .bind(&release.url)
        .bind(release.published_at)
        .bind(&release.hash)
        .bind(release.created_at)
        .execute(ex)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_release<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
    ) -> Result<Option<Release>, AppError> {
        let release = sqlx::query_as::<_, Release>(&format!(
            "SELECT {} FROM releases WHERE id = $1",
            RELEASE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(ex)
        .await?;
        Ok(release)
    }

    pub async fn latest_release_for_tag<'e, E: PgExecutor<'e>>(
        ex: E,
        repo_id: Uuid,
        tag: &str,
    ) -> Result<Option<Release>, AppError> {
        let release = sqlx::query_as::<_, Release>(&format!(
            r#"
            SELECT {} FROM releases
            WHERE repo_id = $1 AND tag = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            RELEASE_COLUMNS
        ))
        .bind(repo_id)
        .bind(tag)
        .fetch_optional(ex)
        .await?;
        Ok(release)
    }

    pub async fn list_subscriptions_by_repo<'e, E: PgExecutor<'e>>(
        ex: E,
        repo_id: Uuid,
    ) -> Result<Vec<Subscription>, AppError> {
        let subs = sqlx::query_as::<_, Subscription>(
            "SELECT id, repo_id, user_id, channel, created_at FROM subscriptions WHERE repo_id = $1",
        )
        .bind(repo_id)
        .fetch_all(ex)
        .await?;
        Ok(subs)
    }

    pub async fn create_delivery_if_absent<'e, E: PgExecutor<'e>>(
        ex: E,
        delivery: &Delivery,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO deliveries (id, release_id, user_id, channel, status, attempt, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (release_id, user_id, channel) DO NOTHING
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.release_id)
        .bind(delivery.user_id)
        .bind(&delivery.channel)
        .bind(delivery.status.to_string())
        .bind(delivery.attempt)
        .bind(&delivery.last_error)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .execute(ex)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_delivery_status<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
        status: DeliveryStatus,
        last_error: Option<&str>,
        attempt: i32,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE deliveries
            SET status = $2, last_error = $3, attempt = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(last_error)
        .bind(attempt)
        .execute(ex)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("delivery {}", id)));
        }
        Ok(())
    }

    pub async fn list_deliveries_with_status<'e, E: PgExecutor<'e>>(
        ex: E,
        status: DeliveryStatus,
        limit: i64,
    ) -> Result<Vec<Delivery>, AppError> {
        let deliveries = sqlx::query_as::<_, Delivery>(&format!(
            r#"
            SELECT {} FROM deliveries
            WHERE status = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(status.to_string())
        .bind(limit)
        .fetch_all(ex)
        .await?;
        Ok(deliveries)
    }

    pub async fn transition_delivery_status<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
        from: DeliveryStatus,
        to: DeliveryStatus,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE deliveries SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .execute(ex)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_user<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, email, created_at, updated_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(ex)
        .await?;
        Ok(user)
    }
}

#[async_trait]
impl RepoStore for PgStore {
    async fn create_repo(&self, repo: &TrackedRepo) -> Result<(), AppError> {
        queries::create_repo(&self.pool, repo).await
    }

    async fn get_repo(&self, id: Uuid) -> Result<Option<TrackedRepo>, AppError> {
        queries::get_repo(&self.pool, id).await
    }

    async fn get_repo_by_owner_name(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Option<TrackedRepo>, AppError> {
        queries::get_repo_by_owner_name(&self.pool, owner, name).await
    }

    async fn update_poll_state(
        &self,
        id: Uuid,
        etag: Option<&str>,
        checked_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        queries::update_poll_state(&self.pool, id, etag, checked_at).await
    }

    async fn list_due_for_poll(
        &self,
        now: DateTime<Utc>,
        poll_interval: Duration,
    ) -> Result<Vec<TrackedRepo>, AppError> {
        queries::list_due_for_poll(&self.pool, now, poll_interval).await
    }
}

#[async_trait]
impl ReleaseStore for PgStore {
    async fn create_release(&self, release: &Release) -> Result<bool, AppError> {
        queries::create_release(&self.pool, release).await
    }

    async fn get_release(&self, id: Uuid) -> Result<Option<Release>, AppError> {
        queries::get_release(&self.pool, id).await
    }

    async fn latest_release_for_tag(
        &self,
        repo_id: Uuid,
        tag: &str,
    ) -> Result<Option<Release>, AppError> {
        queries::latest_release_for_tag(&self.pool, repo_id, tag).await
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn list_subscriptions_by_repo(&self, repo_id: Uuid) -> Result<Vec<Subscription>, AppError> {
        queries::list_subscriptions_by_repo(&self.pool, repo_id).await
    }
}

#[async_trait]
impl DeliveryStore for PgStore {
    async fn create_delivery_if_absent(&self, delivery: &Delivery) -> Result<bool, AppError> {
        queries::create_delivery_if_absent(&self.pool, delivery).await
    }

    async fn update_delivery_status(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        last_error: Option<&str>,
        attempt: i32,
    ) -> Result<(), AppError> {
        queries::update_delivery_status(&self.pool, id, status, last_error, attempt).await
    }

    async fn list_pending_deliveries(&self, limit: i64) -> Result<Vec<Delivery>, AppError> {
        queries::list_deliveries_with_status(&self.pool, DeliveryStatus::Pending, limit).await
    }

    async fn list_failed_deliveries(&self, limit: i64) -> Result<Vec<Delivery>, AppError> {
        queries::list_deliveries_with_status(&self.pool, DeliveryStatus::Failed, limit).await
    }

    async fn transition_delivery_status(
        &self,
        id: Uuid,
        from: DeliveryStatus,
        to: DeliveryStatus,
    ) -> Result<bool, AppError> {
        queries::transition_delivery_status(&self.pool, id, from, to).await
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, AppError> {
        queries::get_user(&self.pool, id).await
    }
}

#[async_trait]
impl Transactor for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, AppError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx: Mutex::new(tx) }))
    }
}

impl Store for PgStore {}

#[async_trait]
impl RepoStore for PgTransaction {
    async fn create_repo(&self, repo: &TrackedRepo) -> Result<(), AppError> {
        let mut tx = self.tx.lock().await;
        queries::create_repo(&mut **tx, repo).await
    }

    async fn get_repo(&self, id: Uuid) -> Result<Option<TrackedRepo>, AppError> {
        let mut tx = self.tx.lock().await;
        queries::get_repo(&mut **tx, id).await
    }

    async fn get_repo_by_owner_name(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Option<TrackedRepo>, AppError> {
        let mut tx = self.tx.lock().await;
        queries::get_repo_by_owner_name(&mut **tx, owner, name).await
    }

    async fn update_poll_state(
        &self,
        id: Uuid,
        etag: Option<&str>,
        checked_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut tx = self.tx.lock().await;
        queries::update_poll_state(&mut **tx, id, etag, checked_at).await
    }

    async fn list_due_for_poll(
        &self,
        now: DateTime<Utc>,
        poll_interval: Duration,
    ) -> Result<Vec<TrackedRepo>, AppError> {
        let mut tx = self.tx.lock().await;
        queries::list_due_for_poll(&mut **tx, now, poll_interval).await
    }
}

#[async_trait]
impl ReleaseStore for PgTransaction {
    async fn create_release(&self, release: &Release) -> Result<bool, AppError> {
        let mut tx = self.tx.lock().await;
        queries::create_release(&mut **tx, release).await
    }

    async fn get_release(&self, id: Uuid) -> Result<Option<Release>, AppError> {
        let mut tx = self.tx.lock().await;
        queries::get_release(&mut **tx, id).await
    }

    async fn latest_release_for_tag(
        &self,
        repo_id: Uuid,
        tag: &str,
    ) -> Result<Option<Release>, AppError> {
        let mut tx = self.tx.lock().await;
        queries::latest_release_for_tag(&mut **tx, repo_id, tag).await
    }
}

#[async_trait]
impl SubscriptionStore for PgTransaction {
    async fn list_subscriptions_by_repo(&self, repo_id: Uuid) -> Result<Vec<Subscription>, AppError> {
        let mut tx = self.tx.lock().await;
        queries::list_subscriptions_by_repo(&mut **tx, repo_id).await
    }
}

#[async_trait]
impl DeliveryStore for PgTransaction {
    async fn create_delivery_if_absent(&self, delivery: &Delivery) -> Result<bool, AppError> {
        let mut tx = self.tx.lock().await;
        queries::create_delivery_if_absent(&mut **tx, delivery).await
    }

    async fn update_delivery_status(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        last_error: Option<&str>,
        attempt: i32,
    ) -> Result<(), AppError> {
        let mut tx = self.tx.lock().await;
        queries::update_delivery_status(&mut **tx, id, status, last_error, attempt).await
    }

    async fn list_pending_deliveries(&self, limit: i64) -> Result<Vec<Delivery>, AppError> {
        let mut tx = self.tx.lock().await;
        queries::list_deliveries_with_status(&mut **tx, DeliveryStatus::Pending, limit).await
    }

    async fn list_failed_deliveries(&self, limit: i64) -> Result<Vec<Delivery>, AppError> {
        let mut tx = self.tx.lock().await;
        queries::list_deliveries_with_status(&mut **tx, DeliveryStatus::Failed, limit).await
    }

    async fn transition_delivery_status(
        &self,
        id: Uuid,
        from: DeliveryStatus,
        to: DeliveryStatus,
    ) -> Result<bool, AppError> {
        let mut tx = self.tx.lock().await;
        queries::transition_delivery_status(&mut **tx, id, from, to).await
    }
}

#[async_trait]
impl UserStore for PgTransaction {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, AppError> {
        let mut tx = self.tx.lock().await;
        queries::get_user(&mut **tx, id).await
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.tx.into_inner().commit().await?;
        Ok(())
    }
}
