//! In-memory implementation of the repository ports.
//!
//! Enforces the same uniqueness rules as the Postgres schema. A transaction
//! works on a private copy of the state and records its writes; `commit`
//! replays the writes onto the shared state, so transactions committed from
//! concurrent tasks do not overwrite each other.
//!
//! Fault injection and direct row surgery (`set_fail_writes`,
//! `set_fail_reads`, `replace_delivery`, `remove_release`, `remove_user`) are
//! test support only and exist under `cfg(test)` or the `test-util` feature.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{Delivery, DeliveryStatus, Release, Subscription, TrackedRepo, User};

use crate::ports::{
    DeliveryStore, ReleaseStore, RepoStore, Store, StoreTransaction, SubscriptionStore,
    Transactor, UserStore,
};

#[derive(Debug, Clone)]
enum Write {
    CreateRepo(TrackedRepo),
    UpdatePollState {
        id: Uuid,
        etag: Option<String>,
        checked_at: DateTime<Utc>,
    },
    CreateRelease(Release),
    CreateDelivery(Delivery),
    UpdateDeliveryStatus {
        id: Uuid,
        status: DeliveryStatus,
        last_error: Option<String>,
        attempt: i32,
    },
    TransitionDelivery {
        id: Uuid,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    users: Vec<User>,
    repos: Vec<TrackedRepo>,
    releases: Vec<Release>,
    subscriptions: Vec<Subscription>,
    deliveries: Vec<Delivery>,
}

impl MemoryState {
    /// Apply a write. Returns `false` when a uniqueness rule or a missing row
    /// turned the write into a no-op.
    fn apply(&mut self, write: &Write) -> bool {
        let now = Utc::now();
        match write {
            Write::CreateRepo(repo) => {
                if self
                    .repos
                    .iter()
                    .any(|r| r.id == repo.id || (r.owner == repo.owner && r.name == repo.name))
                {
                    return false;
                }
                self.repos.push(repo.clone());
                true
            }
            Write::UpdatePollState {
                id,
                etag,
                checked_at,
            } => match self.repos.iter_mut().find(|r| r.id == *id) {
                Some(repo) => {
                    repo.etag = etag.clone();
                    repo.last_checked_at = Some(*checked_at);
                    repo.updated_at = now;
                    true
                }
                None => false,
            },
            Write::CreateRelease(release) => {
                if self.releases.iter().any(|r| {
                    r.repo_id == release.repo_id && r.tag == release.tag && r.hash == release.hash
                }) {
                    return false;
                }
                self.releases.push(release.clone());
                true
            }
            Write::CreateDelivery(delivery) => {
                if self.deliveries.iter().any(|d| {
                    d.release_id == delivery.release_id
                        && d.user_id == delivery.user_id
                        && d.channel == delivery.channel
                }) {
                    return false;
                }
                self.deliveries.push(delivery.clone());
                true
            }
            Write::UpdateDeliveryStatus {
                id,
                status,
                last_error,
                attempt,
            } => match self.deliveries.iter_mut().find(|d| d.id == *id) {
                Some(delivery) => {
                    delivery.status = *status;
                    delivery.last_error = last_error.clone();
                    delivery.attempt = *attempt;
                    delivery.updated_at = now;
                    true
                }
                None => false,
            },
            Write::TransitionDelivery { id, from, to } => {
                match self
                    .deliveries
                    .iter_mut()
                    .find(|d| d.id == *id && d.status == *from)
                {
                    Some(delivery) => {
                        delivery.status = *to;
                        delivery.updated_at = now;
                        true
                    }
                    None => false,
                }
            }
        }
    }

    fn get_repo(&self, id: Uuid) -> Option<TrackedRepo> {
        self.repos.iter().find(|r| r.id == id).cloned()
    }

    fn get_repo_by_owner_name(&self, owner: &str, name: &str) -> Option<TrackedRepo> {
        self.repos
            .iter()
            .find(|r| r.owner == owner && r.name == name)
            .cloned()
    }

    fn list_due_for_poll(&self, now: DateTime<Utc>, poll_interval: Duration) -> Vec<TrackedRepo> {
        let interval =
            chrono::Duration::from_std(poll_interval).unwrap_or_else(|_| chrono::Duration::zero());
        let mut due: Vec<_> = self
            .repos
            .iter()
            .filter(|r| r.is_due(now, interval))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.last_checked_at);
        due
    }

    fn get_release(&self, id: Uuid) -> Option<Release> {
        self.releases.iter().find(|r| r.id == id).cloned()
    }

    fn latest_release_for_tag(&self, repo_id: Uuid, tag: &str) -> Option<Release> {
        // Later pushes win ties on created_at
        self.releases
            .iter()
            .filter(|r| r.repo_id == repo_id && r.tag == tag)
            .max_by_key(|r| r.created_at)
            .cloned()
    }

    fn list_subscriptions_by_repo(&self, repo_id: Uuid) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .filter(|s| s.repo_id == repo_id)
            .cloned()
            .collect()
    }

    fn list_deliveries_with_status(&self, status: DeliveryStatus, limit: i64) -> Vec<Delivery> {
        let mut deliveries: Vec<_> = self
            .deliveries
            .iter()
            .filter(|d| d.status == status)
            .cloned()
            .collect();
        deliveries.sort_by_key(|d| d.created_at);
        deliveries.truncate(limit.max(0) as usize);
        deliveries
    }

    fn get_user(&self, id: Uuid) -> Option<User> {
        self.users.iter().find(|u| u.id == id).cloned()
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared in-memory store. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write (including commits) fail with a persistence error.
    #[cfg(any(test, feature = "test-util"))]
    pub fn set_fail_writes(&self, fail: bool) {
        self.faults.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent read fail with a persistence error.
    #[cfg(any(test, feature = "test-util"))]
    pub fn set_fail_reads(&self, fail: bool) {
        self.faults.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn insert_user(&self, user: User) {
        lock(&self.state).users.push(user);
    }

    /// Delete a user row without touching its deliveries.
    #[cfg(any(test, feature = "test-util"))]
    pub fn remove_user(&self, id: Uuid) {
        lock(&self.state).users.retain(|u| u.id != id);
    }

    pub fn insert_repo(&self, repo: TrackedRepo) {
        lock(&self.state).apply(&Write::CreateRepo(repo));
    }

    pub fn insert_subscription(&self, subscription: Subscription) {
        let mut state = lock(&self.state);
        let duplicate = state.subscriptions.iter().any(|s| {
            s.repo_id == subscription.repo_id
                && s.user_id == subscription.user_id
                && s.channel == subscription.channel
        });
        if !duplicate {
            state.subscriptions.push(subscription);
        }
    }

    pub fn insert_release(&self, release: Release) {
        lock(&self.state).apply(&Write::CreateRelease(release));
    }

    /// Delete a release row without touching its deliveries.
    #[cfg(any(test, feature = "test-util"))]
    pub fn remove_release(&self, id: Uuid) {
        lock(&self.state).releases.retain(|r| r.id != id);
    }

    pub fn insert_delivery(&self, delivery: Delivery) {
        lock(&self.state).apply(&Write::CreateDelivery(delivery));
    }

    /// Overwrite a delivery's row as-is, for setting up timestamps in tests.
    #[cfg(any(test, feature = "test-util"))]
    pub fn replace_delivery(&self, delivery: Delivery) {
        let mut state = lock(&self.state);
        if let Some(existing) = state.deliveries.iter_mut().find(|d| d.id == delivery.id) {
            *existing = delivery;
        }
    }

    pub fn repo(&self, id: Uuid) -> Option<TrackedRepo> {
        lock(&self.state).get_repo(id)
    }

    pub fn releases(&self) -> Vec<Release> {
        lock(&self.state).releases.clone()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        lock(&self.state).deliveries.clone()
    }

    pub fn delivery(&self, id: Uuid) -> Option<Delivery> {
        lock(&self.state)
            .deliveries
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }

    fn check_read(&self) -> Result<(), AppError> {
        check(&self.faults.fail_reads, "read")
    }

    fn write(&self, write: Write) -> Result<bool, AppError> {
        check(&self.faults.fail_writes, "write")?;
        Ok(lock(&self.state).apply(&write))
    }
}

fn check(flag: &AtomicBool, what: &str) -> Result<(), AppError> {
    if flag.load(Ordering::SeqCst) {
        return Err(AppError::Persistence(format!("injected {} failure", what)));
    }
    Ok(())
}

/// Transaction over a [`MemoryStore`]. Discarded on drop unless committed.
pub struct MemoryTransaction {
    base: Arc<Mutex<MemoryState>>,
    view: Mutex<MemoryState>,
    writes: Mutex<Vec<Write>>,
    faults: Arc<Faults>,
}

impl MemoryTransaction {
    fn check_read(&self) -> Result<(), AppError> {
        check(&self.faults.fail_reads, "read")
    }

    fn write(&self, write: Write) -> Result<bool, AppError> {
        check(&self.faults.fail_writes, "write")?;
        let applied = lock(&self.view).apply(&write);
        if applied {
            self.writes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(write);
        }
        Ok(applied)
    }
}

#[async_trait]
impl Transactor for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, AppError> {
        let view = lock(&self.state).clone();
        Ok(Box::new(MemoryTransaction {
            base: self.state.clone(),
            view: Mutex::new(view),
            writes: Mutex::new(Vec::new()),
            faults: self.faults.clone(),
        }))
    }
}

impl Store for MemoryStore {}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        check(&self.faults.fail_writes, "commit")?;
        let this = *self;
        let writes = this
            .writes
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        let mut base = lock(&this.base);
        for write in &writes {
            base.apply(write);
        }
        Ok(())
    }
}

// Both handles expose the same repository surface; only where state lives differs.
macro_rules! memory_repositories {
    ($ty:ty, $state:ident) => {
        #[async_trait]
        impl RepoStore for $ty {
            async fn create_repo(&self, repo: &TrackedRepo) -> Result<(), AppError> {
                if self.write(Write::CreateRepo(repo.clone()))? {
                    Ok(())
                } else {
                    Err(AppError::Persistence(format!(
                        "repo {} already exists",
                        repo.full_name()
                    )))
                }
            }

            async fn get_repo(&self, id: Uuid) -> Result<Option<TrackedRepo>, AppError> {
                self.check_read()?;
                Ok(lock(&self.$state).get_repo(id))
            }

            async fn get_repo_by_owner_name(
                &self,
                owner: &str,
                name: &str,
            ) -> Result<Option<TrackedRepo>, AppError> {
                self.check_read()?;
                Ok(lock(&self.$state).get_repo_by_owner_name(owner, name))
            }

            async fn update_poll_state(
                &self,
                id: Uuid,
                etag: Option<&str>,
                checked_at: DateTime<Utc>,
            ) -> Result<(), AppError> {
                let write = Write::UpdatePollState {
                    id,
                    etag: etag.map(str::to_string),
                    checked_at,
                };
                if self.write(write)? {
                    Ok(())
                } else {
                    Err(AppError::NotFound(format!("tracked repo {}", id)))
                }
            }

            async fn list_due_for_poll(
                &self,
                now: DateTime<Utc>,
                poll_interval: Duration,
            ) -> Result<Vec<TrackedRepo>, AppError> {
                self.check_read()?;
                Ok(lock(&self.$state).list_due_for_poll(now, poll_interval))
            }
        }

        #[async_trait]
        impl ReleaseStore for $ty {
            async fn create_release(&self, release: &Release) -> Result<bool, AppError> {
                self.write(Write::CreateRelease(release.clone()))
            }

            async fn get_release(&self, id: Uuid) -> Result<Option<Release>, AppError> {
                self.check_read()?;
                Ok(lock(&self.$state).get_release(id))
            }

            async fn latest_release_for_tag(
                &self,
                repo_id: Uuid,
                tag: &str,
            ) -> Result<Option<Release>, AppError> {
                self.check_read()?;
                Ok(lock(&self.$state).latest_release_for_tag(repo_id, tag))
            }
        }

        #[async_trait]
        impl SubscriptionStore for $ty {
            async fn list_subscriptions_by_repo(
                &self,
                repo_id: Uuid,
            ) -> Result<Vec<Subscription>, AppError> {
                self.check_read()?;
                Ok(lock(&self.$state).list_subscriptions_by_repo(repo_id))
            }
        }

        #[async_trait]
        impl DeliveryStore for $ty {
            async fn create_delivery_if_absent(&self, delivery: &Delivery) -> Result<bool, AppError> {
                self.write(Write::CreateDelivery(delivery.clone()))
            }

            async fn update_delivery_status(
                &self,
                id: Uuid,
                status: DeliveryStatus,
                last_error: Option<&str>,
                attempt: i32,
            ) -> Result<(), AppError> {
                let write = Write::UpdateDeliveryStatus {
                    id,
                    status,
                    last_error: last_error.map(str::to_string),
                    attempt,
                };
                if self.write(write)? {
                    Ok(())
                } else {
                    Err(AppError::NotFound(format!("delivery {}", id)))
                }
            }

            async fn list_pending_deliveries(&self, limit: i64) -> Result<Vec<Delivery>, AppError> {
                self.check_read()?;
                Ok(lock(&self.$state).list_deliveries_with_status(DeliveryStatus::Pending, limit))
            }

            async fn list_failed_deliveries(&self, limit: i64) -> Result<Vec<Delivery>, AppError> {
                self.check_read()?;
                Ok(lock(&self.$state).list_deliveries_with_status(DeliveryStatus::Failed, limit))
            }

            async fn transition_delivery_status(
                &self,
                id: Uuid,
                from: DeliveryStatus,
                to: DeliveryStatus,
            ) -> Result<bool, AppError> {
                self.write(Write::TransitionDelivery { id, from, to })
            }
        }

        #[async_trait]
        impl UserStore for $ty {
            async fn get_user(&self, id: Uuid) -> Result<Option<User>, AppError> {
                self.check_read()?;
                Ok(lock(&self.$state).get_user(id))
            }
        }
    };
}

memory_repositories!(MemoryStore, state);
memory_repositories!(MemoryTransaction, view);
