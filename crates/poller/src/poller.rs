use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{StreamExt, future, stream};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{Release, TrackedRepo};
use beacon_engine::hash::release_hash;
use beacon_engine::ports::{
    ReleaseSource, ReleaseStore, RepoStore, Store, StoreTransaction, Transactor,
};
use beacon_engine::{DeliveryEnqueuer, RetryPolicy};

/// Counters for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub polled: usize,
    pub not_modified: usize,
    pub unchanged: usize,
    pub releases_created: usize,
    pub deliveries_enqueued: usize,
    pub failures: usize,
}

/// What happened to a single repository during a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoOutcome {
    /// Upstream reported nothing new (validator matched, or nothing published).
    NotModified,
    /// A release came back but its content was already stored.
    Unchanged,
    Created { release_id: Uuid, deliveries: usize },
}

/// Periodically checks tracked repositories for new or changed releases.
///
/// A repository is processed in one transaction: the new release row, its
/// pending deliveries and the updated validator/timestamp either all land or
/// none do. A failed fetch leaves the repository untouched so the next cycle
/// retries it.
pub struct ReleasePoller {
    store: Arc<dyn Store>,
    source: Arc<dyn ReleaseSource>,
    retry: RetryPolicy,
    enqueuer: DeliveryEnqueuer,
    poll_interval: Duration,
    concurrency: usize,
}

impl ReleasePoller {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn ReleaseSource>,
        retry: RetryPolicy,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            source,
            retry,
            enqueuer: DeliveryEnqueuer::new(),
            poll_interval,
            concurrency: 4,
        }
    }

    /// Number of repositories polled at once within a cycle.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run poll cycles every `tick` until `shutdown` is cancelled.
    pub async fn run(&self, tick: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            tick_secs = tick.as_secs(),
            poll_interval_secs = self.poll_interval.as_secs(),
            concurrency = self.concurrency,
            "Release poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_cycle(&shutdown).await {
                        Ok(summary) if summary.polled > 0 => {
                            tracing::info!(
                                polled = summary.polled,
                                not_modified = summary.not_modified,
                                unchanged = summary.unchanged,
                                releases_created = summary.releases_created,
                                deliveries_enqueued = summary.deliveries_enqueued,
                                failures = summary.failures,
                                "Poll cycle complete"
                            );
                        }
                        Ok(_) => tracing::debug!("No repositories due"),
                        Err(e) => tracing::error!(error = %e, "Poll cycle failed"),
                    }
                }
            }
        }

        tracing::info!("Release poller stopped");
    }

    /// Poll every due repository once.
    ///
    /// Only listing the due repositories can fail the cycle. Per-repository
    /// errors are logged and counted in `failures`; the remaining
    /// repositories are still processed. Once `shutdown` is cancelled no new
    /// repository is started.
    pub async fn poll_cycle(&self, shutdown: &CancellationToken) -> anyhow::Result<PollSummary> {
        let due = self
            .store
            .list_due_for_poll(Utc::now(), self.poll_interval)
            .await?;

        let outcomes: Vec<_> = stream::iter(due)
            .take_while(|_| future::ready(!shutdown.is_cancelled()))
            .map(|repo| async move {
                let outcome = self.poll_repo(&repo).await;
                (repo, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = PollSummary::default();
        for (repo, outcome) in outcomes {
            summary.polled += 1;
            match outcome {
                Ok(RepoOutcome::NotModified) => summary.not_modified += 1,
                Ok(RepoOutcome::Unchanged) => summary.unchanged += 1,
                Ok(RepoOutcome::Created { deliveries, .. }) => {
                    summary.releases_created += 1;
                    summary.deliveries_enqueued += deliveries;
                }
                Err(e) => {
                    summary.failures += 1;
                    tracing::warn!(repo = %repo.full_name(), error = %e, "Repository poll failed");
                }
            }
        }

        Ok(summary)
    }

    /// Fetch, compare and persist the latest release of one repository.
    pub async fn poll_repo(&self, repo: &TrackedRepo) -> Result<RepoOutcome, AppError> {
        let response = self
            .retry
            .retry("fetch latest release", || {
                self.source
                    .latest_release(&repo.owner, &repo.name, repo.etag.as_deref())
            })
            .await?;

        let checked_at = Utc::now();
        // Keep the stored validator when the source did not hand out a new one
        let etag = response
            .validator
            .as_deref()
            .filter(|v| !v.is_empty())
            .or(repo.etag.as_deref());

        let tx = self.store.begin().await?;

        let outcome = match response.release {
            None => RepoOutcome::NotModified,
            Some(upstream) => {
                let hash = release_hash(&upstream);
                let latest = tx.latest_release_for_tag(repo.id, &upstream.tag).await?;

                if latest.is_some_and(|r| r.hash == hash) {
                    RepoOutcome::Unchanged
                } else {
                    let release = Release {
                        id: Uuid::new_v4(),
                        repo_id: repo.id,
                        tag: upstream.tag,
                        title: upstream.title,
                        url: upstream.url,
                        published_at: upstream.published_at,
                        hash,
                        created_at: checked_at,
                    };

                    if tx.create_release(&release).await? {
                        let deliveries = self.enqueuer.enqueue(&*tx, &release).await?;
                        tracing::info!(
                            repo = %repo.full_name(),
                            tag = %release.tag,
                            release_id = %release.id,
                            deliveries,
                            "New release detected"
                        );
                        RepoOutcome::Created {
                            release_id: release.id,
                            deliveries,
                        }
                    } else {
                        // Content reverted to an earlier version of this tag
                        RepoOutcome::Unchanged
                    }
                }
            }
        };

        tx.update_poll_state(repo.id, etag, checked_at).await?;
        tx.commit().await?;

        tracing::debug!(repo = %repo.full_name(), outcome = ?outcome, "Repository polled");
        Ok(outcome)
    }
}
