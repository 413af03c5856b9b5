//! Notification cycles against the in-memory store and idempotency store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{Delivery, DeliveryStatus, Release, TrackedRepo, User};
use beacon_engine::idempotency::MemoryIdempotencyStore;
use beacon_engine::memory::MemoryStore;
use beacon_engine::ports::NotificationChannel;
use beacon_engine::{
    ClaimPolicy, GuardOutcome, IdempotencyGuard, IdempotencyStore, RequeuePolicy, RetryPolicy,
};
use beacon_notifier::{DeliveryResult, Notifier, NotifySummary};

// ============================================================
// Test doubles
// ============================================================

/// Records sent messages; fails the first `failures` calls.
#[derive(Default)]
struct RecordingChannel {
    failures: AtomicU32,
    calls: AtomicU32,
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingChannel {
    fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(AppError::Send("Bad Request: chat not found".into()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((channel_id.to_string(), text.to_string()));
        Ok(())
    }
}

/// Idempotency store that is unreachable for keys containing `poisoned`.
struct FlakyClaims {
    inner: MemoryIdempotencyStore,
    poisoned: String,
}

#[async_trait]
impl IdempotencyStore for FlakyClaims {
    async fn claim_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        if key.contains(&self.poisoned) {
            return Err(AppError::Guard("connection refused".into()));
        }
        self.inner.claim_if_absent(key, ttl).await
    }

    async fn release(&self, key: &str) -> Result<(), AppError> {
        self.inner.release(key).await
    }
}

// ============================================================
// Helpers
// ============================================================

struct World {
    store: MemoryStore,
    release: Release,
}

fn world() -> World {
    let store = MemoryStore::new();
    let repo = TrackedRepo::new("acme", "widget");
    store.insert_repo(repo.clone());
    let release = Release {
        id: Uuid::new_v4(),
        repo_id: repo.id,
        tag: "2.0.0".to_string(),
        title: "Widget 2.0".to_string(),
        url: "https://github.com/acme/widget/releases/tag/2.0.0".to_string(),
        published_at: Some(Utc::now()),
        hash: "abc".to_string(),
        created_at: Utc::now(),
    };
    store.insert_release(release.clone());
    World { store, release }
}

impl World {
    fn user(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.store.insert_user(User {
            id,
            email: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        id
    }

    fn pending(&self, user_id: Uuid, channel: &str) -> Delivery {
        let delivery = Delivery::pending(self.release.id, user_id, channel);
        self.store.insert_delivery(delivery.clone());
        delivery
    }

    /// Pretend the delivery was last touched `secs` seconds ago.
    fn age(&self, id: Uuid, secs: i64) {
        let mut delivery = self.store.delivery(id).unwrap();
        delivery.updated_at = Utc::now() - chrono::Duration::seconds(secs);
        self.store.replace_delivery(delivery);
    }

    fn notifier(
        &self,
        channel: Arc<RecordingChannel>,
        claims: Arc<dyn IdempotencyStore>,
    ) -> Notifier {
        Notifier::new(
            Arc::new(self.store.clone()),
            channel,
            IdempotencyGuard::new(claims, ClaimPolicy::HoldUntilExpiry),
            RetryPolicy::new(3, Duration::ZERO),
        )
    }
}

async fn cycle(notifier: &Notifier) -> NotifySummary {
    notifier
        .notify_cycle(&CancellationToken::new())
        .await
        .unwrap()
}

// ============================================================
// Delivery outcomes
// ============================================================

#[tokio::test]
async fn test_pending_delivery_is_sent() {
    let world = world();
    let user = world.user();
    let delivery = world.pending(user, "100");
    let channel = Arc::new(RecordingChannel::default());
    let notifier = world.notifier(channel.clone(), Arc::new(MemoryIdempotencyStore::new()));

    let summary = cycle(&notifier).await;

    assert_eq!(summary.pending, 1);
    assert_eq!(summary.sent, 1);
    assert_eq!(
        channel.sent(),
        vec![(
            "100".to_string(),
            "New release for acme/widget: <b>Widget 2.0</b> (2.0.0)\nhttps://github.com/acme/widget/releases/tag/2.0.0".to_string()
        )]
    );
    let stored = world.store.delivery(delivery.id).unwrap();
    assert_eq!(stored.status, DeliveryStatus::Sent);
    assert_eq!(stored.attempt, 1);
    assert!(stored.last_error.is_none());

    // Nothing left to do on the next cycle
    let again = cycle(&notifier).await;
    assert_eq!(again.pending, 0);
    assert_eq!(channel.sent().len(), 1);
}

#[tokio::test]
async fn test_missing_release_is_skipped_without_sending() {
    let world = world();
    let delivery = world.pending(world.user(), "100");
    world.store.remove_release(world.release.id);
    let channel = Arc::new(RecordingChannel::default());
    let notifier = world.notifier(channel.clone(), Arc::new(MemoryIdempotencyStore::new()));

    let summary = cycle(&notifier).await;

    assert_eq!(summary.skipped, 1);
    assert_eq!(channel.calls.load(Ordering::SeqCst), 0);
    let stored = world.store.delivery(delivery.id).unwrap();
    assert_eq!(stored.status, DeliveryStatus::Skipped);
    assert_eq!(stored.attempt, 1);
    assert_eq!(stored.last_error.as_deref(), Some("release not found"));
}

#[tokio::test]
async fn test_missing_user_is_skipped_without_sending() {
    let world = world();
    let user = world.user();
    let delivery = world.pending(user, "100");
    world.store.remove_user(user);
    let channel = Arc::new(RecordingChannel::default());
    let notifier = world.notifier(channel.clone(), Arc::new(MemoryIdempotencyStore::new()));

    let summary = cycle(&notifier).await;

    assert_eq!(summary.skipped, 1);
    assert_eq!(channel.calls.load(Ordering::SeqCst), 0);
    let stored = world.store.delivery(delivery.id).unwrap();
    assert_eq!(stored.status, DeliveryStatus::Skipped);
    assert_eq!(stored.last_error.as_deref(), Some("user not found"));
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_marks_failed_after_retries() {
    let world = world();
    let delivery = world.pending(world.user(), "100");
    let channel = Arc::new(RecordingChannel::failing(u32::MAX));
    let notifier = Notifier::new(
        Arc::new(world.store.clone()),
        channel.clone(),
        IdempotencyGuard::new(
            Arc::new(MemoryIdempotencyStore::new()),
            ClaimPolicy::HoldUntilExpiry,
        ),
        RetryPolicy::new(3, Duration::from_secs(2)),
    );

    let started = tokio::time::Instant::now();
    let summary = cycle(&notifier).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(channel.calls.load(Ordering::SeqCst), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(6));
    let stored = world.store.delivery(delivery.id).unwrap();
    assert_eq!(stored.status, DeliveryStatus::Failed);
    assert_eq!(stored.attempt, 1);
    assert!(stored.last_error.unwrap().contains("chat not found"));
}

#[tokio::test]
async fn test_transient_send_failure_is_retried_within_the_cycle() {
    let world = world();
    let delivery = world.pending(world.user(), "100");
    let channel = Arc::new(RecordingChannel::failing(1));
    let notifier = world.notifier(channel.clone(), Arc::new(MemoryIdempotencyStore::new()));

    let outcome = notifier.notify_one(&delivery).await.unwrap();

    assert_eq!(outcome, GuardOutcome::Executed(DeliveryResult::Sent));
    assert_eq!(channel.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        world.store.delivery(delivery.id).unwrap().status,
        DeliveryStatus::Sent
    );
}

// ============================================================
// Idempotency guard
// ============================================================

#[tokio::test]
async fn test_claimed_delivery_is_left_alone() {
    let world = world();
    let delivery = world.pending(world.user(), "100");
    let claims = Arc::new(MemoryIdempotencyStore::new());
    claims
        .claim_if_absent(&delivery.idempotency_key(), Duration::from_secs(600))
        .await
        .unwrap();
    let channel = Arc::new(RecordingChannel::default());
    let notifier = world.notifier(channel.clone(), claims);

    let summary = cycle(&notifier).await;

    assert_eq!(summary.already_claimed, 1);
    assert!(channel.sent().is_empty());
    assert_eq!(
        world.store.delivery(delivery.id).unwrap().status,
        DeliveryStatus::Pending
    );
}

#[tokio::test]
async fn test_overlapping_cycles_send_once() {
    let world = world();
    world.pending(world.user(), "100");
    world.pending(world.user(), "200");
    let claims: Arc<dyn IdempotencyStore> = Arc::new(MemoryIdempotencyStore::new());
    let channel = Arc::new(RecordingChannel::default());
    let first = world.notifier(channel.clone(), claims.clone());
    let second = world.notifier(channel.clone(), claims);

    let (a, b) = tokio::join!(cycle(&first), cycle(&second));

    assert_eq!(a.sent + b.sent, 2);
    assert_eq!(channel.sent().len(), 2);
}

#[tokio::test]
async fn test_guard_failure_leaves_delivery_pending_and_cycle_continues() {
    let world = world();
    let broken = world.pending(world.user(), "broken-chat");
    let healthy = world.pending(world.user(), "200");
    let claims = Arc::new(FlakyClaims {
        inner: MemoryIdempotencyStore::new(),
        poisoned: "broken-chat".to_string(),
    });
    let channel = Arc::new(RecordingChannel::default());
    let notifier = world.notifier(channel.clone(), claims);

    let summary = cycle(&notifier).await;

    assert_eq!(summary.errors, 1);
    assert_eq!(summary.sent, 1);
    let recipients: Vec<_> = channel.sent().into_iter().map(|(chat, _)| chat).collect();
    assert_eq!(recipients, vec!["200".to_string()]);
    let stored = world.store.delivery(broken.id).unwrap();
    assert_eq!(stored.status, DeliveryStatus::Pending);
    assert_eq!(stored.attempt, 0);
    assert_eq!(
        world.store.delivery(healthy.id).unwrap().status,
        DeliveryStatus::Sent
    );
}

// ============================================================
// Requeue and shutdown
// ============================================================

#[tokio::test]
async fn test_failed_delivery_is_requeued_and_sent() {
    let world = world();
    let delivery = world.pending(world.user(), "100");
    let channel = Arc::new(RecordingChannel::failing(3));
    let notifier = world
        .notifier(channel.clone(), Arc::new(MemoryIdempotencyStore::new()))
        .with_requeue(RequeuePolicy::new(5, Duration::from_secs(60)));

    let first = cycle(&notifier).await;
    assert_eq!(first.failed, 1);
    assert_eq!(world.store.delivery(delivery.id).unwrap().attempt, 1);

    // Still inside the backoff: nothing to requeue, nothing pending
    let waiting = cycle(&notifier).await;
    assert_eq!(waiting.requeued, 0);
    assert_eq!(waiting.pending, 0);

    world.age(delivery.id, 61);
    let summary = cycle(&notifier).await;

    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.sent, 1);
    assert_eq!(summary.already_claimed, 0);
    assert_eq!(channel.sent().len(), 1);
    let stored = world.store.delivery(delivery.id).unwrap();
    assert_eq!(stored.status, DeliveryStatus::Sent);
    assert_eq!(stored.attempt, 2);
    assert!(stored.last_error.is_none());
}

#[tokio::test]
async fn test_requeued_deliveries_do_not_starve_fresh_ones() {
    let world = world();
    let down_a = world.pending(world.user(), "100");
    let down_b = world.pending(world.user(), "200");
    // Both deliveries exhaust their three send attempts during the outage
    let channel = Arc::new(RecordingChannel::failing(6));
    let notifier = world
        .notifier(channel.clone(), Arc::new(MemoryIdempotencyStore::new()))
        .with_requeue(RequeuePolicy::new(5, Duration::from_secs(60)))
        .with_batch_size(2);

    let outage = cycle(&notifier).await;
    assert_eq!(outage.failed, 2);

    world.age(down_a.id, 61);
    world.age(down_b.id, 61);
    let fresh = world.pending(world.user(), "300");

    let mut already_claimed = 0;
    for _ in 0..2 {
        already_claimed += cycle(&notifier).await.already_claimed;
    }

    assert_eq!(already_claimed, 0);
    for id in [down_a.id, down_b.id, fresh.id] {
        assert_eq!(world.store.delivery(id).unwrap().status, DeliveryStatus::Sent);
    }
    assert_eq!(channel.sent().len(), 3);
}

#[tokio::test]
async fn test_exhausted_delivery_is_dead_lettered() {
    let world = world();
    let mut delivery = world.pending(world.user(), "100");
    delivery.status = DeliveryStatus::Failed;
    delivery.attempt = 5;
    world.store.replace_delivery(delivery.clone());

    let channel = Arc::new(RecordingChannel::default());
    let notifier = world
        .notifier(channel.clone(), Arc::new(MemoryIdempotencyStore::new()))
        .with_requeue(RequeuePolicy::new(5, Duration::from_secs(60)));

    let summary = cycle(&notifier).await;

    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(summary.pending, 0);
    assert!(channel.sent().is_empty());
    assert_eq!(
        world.store.delivery(delivery.id).unwrap().status,
        DeliveryStatus::DeadLettered
    );
}

#[tokio::test]
async fn test_shutdown_stops_before_next_delivery() {
    let world = world();
    let delivery = world.pending(world.user(), "100");
    let channel = Arc::new(RecordingChannel::default());
    let notifier = world.notifier(channel.clone(), Arc::new(MemoryIdempotencyStore::new()));

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let summary = notifier.notify_cycle(&shutdown).await.unwrap();

    assert_eq!(summary.pending, 1);
    assert_eq!(summary.sent, 0);
    assert!(channel.sent().is_empty());
    assert_eq!(
        world.store.delivery(delivery.id).unwrap().status,
        DeliveryStatus::Pending
    );
}

#[tokio::test]
async fn test_listing_failure_fails_the_cycle() {
    let world = world();
    world.pending(world.user(), "100");
    let notifier = world.notifier(
        Arc::new(RecordingChannel::default()),
        Arc::new(MemoryIdempotencyStore::new()),
    );

    world.store.set_fail_reads(true);
    assert!(notifier.notify_cycle(&CancellationToken::new()).await.is_err());
}
