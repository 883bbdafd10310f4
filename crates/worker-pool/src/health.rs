//! Outcome-driven health state machine and the ban sweeper
//!
//! Every finished request is reported here. Failures accumulate in the
//! worker's consecutive-error counter until the threshold raises an error
//! ban; an upstream rate-limit signal raises a time-boxed rate-limit ban.
//!
//! Rate-limit deadlines are kept in a min-heap. The sweeper task sleeps until
//! the earliest deadline (never longer than the sweep interval) and is woken
//! early whenever a new ban is raised.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use upstream::{Kind, Outcome};

use crate::error::{Error, Result};
use crate::store::WorkerStore;
use crate::worker::{Health, WorkerId, day_of};

pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;
pub const DEFAULT_RATE_LIMIT_BAN: Duration = Duration::from_secs(3600);
pub const MAX_ERROR_THRESHOLD: u32 = 1000;

/// Health of one worker as reported to the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub worker_id: WorkerId,
    pub enabled: bool,
    #[serde(flatten)]
    pub health: Health,
    pub consecutive_errors: u32,
    pub error_threshold: u32,
    /// Milliseconds until a rate-limit ban may be swept.
    pub ban_remaining_ms: Option<u64>,
}

pub struct HealthTracker {
    store: Arc<WorkerStore>,
    error_threshold: AtomicU32,
    rate_limit_ban: Duration,
    deadlines: Mutex<BinaryHeap<Reverse<(u64, WorkerId)>>>,
    wake: Notify,
}

impl HealthTracker {
    pub fn new(store: Arc<WorkerStore>, error_threshold: u32, rate_limit_ban: Duration) -> Self {
        let tracker = Self {
            store,
            error_threshold: AtomicU32::new(error_threshold.clamp(1, MAX_ERROR_THRESHOLD)),
            rate_limit_ban,
            deadlines: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
        };
        tracker.rebuild();
        tracker
    }

    /// Seed the deadline heap from bans that survived a restart.
    fn rebuild(&self) {
        let mut heap = self.heap();
        for record in self.store.list() {
            if let Health::RateLimited { until, .. } = record.health {
                heap.push(Reverse((until, record.id)));
            }
        }
        if !heap.is_empty() {
            info!(bans = heap.len(), "restored rate-limit ban deadlines");
        }
    }

    fn heap(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Reverse<(u64, WorkerId)>>> {
        self.deadlines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn error_threshold(&self) -> u32 {
        self.error_threshold.load(Ordering::Relaxed)
    }

    pub fn set_error_threshold(&self, threshold: u32) -> Result<()> {
        if !(1..=MAX_ERROR_THRESHOLD).contains(&threshold) {
            return Err(Error::InvalidUpdate(format!(
                "error_ban_threshold must be 1..={MAX_ERROR_THRESHOLD}, got {threshold}"
            )));
        }
        let previous = self.error_threshold.swap(threshold, Ordering::Relaxed);
        info!(previous, threshold, "error ban threshold changed");
        Ok(())
    }

    pub fn rate_limit_ban(&self) -> Duration {
        self.rate_limit_ban
    }

    /// Apply one request outcome to worker `id` and return its new health.
    pub async fn record(&self, id: WorkerId, kind: Kind, outcome: Outcome) -> Result<Health> {
        let now = self.store.now();
        let threshold = self.error_threshold();
        let ban_until = now + self.rate_limit_ban.as_millis() as u64;

        let (record, raised) = self
            .store
            .mutate(id, |record| {
                record.usage.record(kind, outcome, day_of(now));
                record.last_used_at = Some(now);
                match outcome {
                    Outcome::Success => {
                        record.consecutive_errors = 0;
                        None
                    }
                    Outcome::Failure => {
                        record.consecutive_errors = record.consecutive_errors.saturating_add(1);
                        if record.health == Health::Healthy && record.consecutive_errors >= threshold
                        {
                            record.health = Health::ErrorBanned { since: now };
                            Some("errors")
                        } else {
                            None
                        }
                    }
                    Outcome::RateLimited => {
                        record.health = Health::RateLimited {
                            since: now,
                            until: ban_until,
                        };
                        Some("rate_limit")
                    }
                }
            })
            .await?;

        debug!(worker_id = id, kind = %kind, outcome = outcome.label(), "outcome recorded");
        if let Some(reason) = raised {
            metrics::counter!("pool_bans_total", "reason" => reason).increment(1);
            warn!(
                worker_id = id,
                reason,
                consecutive_errors = record.consecutive_errors,
                "worker banned"
            );
            if outcome == Outcome::RateLimited {
                self.heap().push(Reverse((ban_until, id)));
                self.wake.notify_one();
            }
        }
        Ok(record.health)
    }

    pub fn health(&self, id: WorkerId) -> Result<WorkerHealth> {
        let record = self.store.get(id)?;
        let now = self.store.now();
        let ban_remaining_ms = match record.health {
            Health::RateLimited { until, .. } => Some(until.saturating_sub(now)),
            _ => None,
        };
        Ok(WorkerHealth {
            worker_id: id,
            enabled: record.enabled,
            health: record.health,
            consecutive_errors: record.consecutive_errors,
            error_threshold: self.error_threshold(),
            ban_remaining_ms,
        })
    }

    /// Earliest pending rate-limit deadline.
    pub fn next_unban_at(&self) -> Option<u64> {
        self.heap().peek().map(|Reverse((at, _))| *at)
    }

    /// Clear every rate-limit ban whose deadline has passed.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(self.store.now()).await
    }

    pub(crate) async fn sweep_at(&self, now: u64) -> usize {
        {
            let mut heap = self.heap();
            while heap.peek().is_some_and(|Reverse((at, _))| *at <= now) {
                heap.pop();
            }
        }

        let expired: Vec<WorkerId> = self
            .store
            .list()
            .into_iter()
            .filter(|r| matches!(r.health, Health::RateLimited { until, .. } if until <= now))
            .map(|r| r.id)
            .collect();

        let mut cleared = 0;
        for id in expired {
            let result = self
                .store
                .mutate(id, |record| match record.health {
                    Health::RateLimited { until, .. } if until <= now => {
                        record.health = Health::Healthy;
                        record.consecutive_errors = 0;
                        true
                    }
                    _ => false,
                })
                .await;
            match result {
                Ok((_, true)) => {
                    cleared += 1;
                    metrics::counter!("pool_unbans_total").increment(1);
                    info!(worker_id = id, "rate-limit ban expired, worker healthy");
                }
                Ok((_, false)) | Err(Error::NotFound(_)) => {}
                Err(e) => warn!(worker_id = id, error = %e, "failed to clear rate-limit ban"),
            }
        }
        cleared
    }
}

/// Spawn the ban sweeper.
///
/// Sleeps until the earliest ban deadline, bounded by `interval`, then sweeps.
/// A newly raised ban interrupts the sleep so the deadline is recomputed.
pub fn spawn_ban_sweeper(
    tracker: Arc<HealthTracker>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = tracker.store.now();
            let wait = tracker
                .next_unban_at()
                .map(|at| Duration::from_millis(at.saturating_sub(now)).min(interval))
                .unwrap_or(interval);
            debug!(wait_ms = wait.as_millis() as u64, "ban sweeper sleeping");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let cleared = tracker.sweep().await;
                    debug!(cleared, "ban sweep finished");
                }
                _ = tracker.wake.notified() => {}
            }
        }
    })
}
