//! Worker selection
//!
//! `select` filters the pool to workers eligible for a kind and picks the best
//! ranked one. Ranking, most significant first:
//! 1. lower load ratio `in_flight / limit` (unlimited counts as 0)
//! 2. higher credit balance (unknown balance ranks below any known one)
//! 3. lower lifetime usage
//! 4. lower worker id, so the choice is deterministic
//!
//! Selection never mutates state. `acquire` pairs it with admission and
//! retries a bounded number of times when another request takes the last slot
//! between the two steps.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;
use upstream::Kind;

use crate::admission::{AdmissionController, Permit};
use crate::error::{Error, Exhaustion, Result};
use crate::store::WorkerStore;
use crate::worker::{Ineligible, WorkerRecord};

pub const DEFAULT_MAX_SELECT_ATTEMPTS: usize = 3;

/// Ordering of two eligible workers for `kind`; `Less` means `a` is preferred.
pub fn rank(a: &WorkerRecord, b: &WorkerRecord, kind: Kind) -> Ordering {
    a.capacity(kind)
        .load_ratio()
        .total_cmp(&b.capacity(kind).load_ratio())
        .then_with(|| b.credits.cmp(&a.credits))
        .then_with(|| a.usage.lifetime().cmp(&b.usage.lifetime()))
        .then_with(|| a.id.cmp(&b.id))
}

/// Count why each worker is unable to take `kind`.
pub fn exhaustion(records: &[WorkerRecord], kind: Kind) -> Exhaustion {
    let mut summary = Exhaustion {
        total: records.len(),
        ..Exhaustion::default()
    };
    for record in records {
        match record.ineligibility(kind) {
            Some(Ineligible::Disabled) => summary.disabled += 1,
            Some(Ineligible::Banned) => summary.banned += 1,
            Some(Ineligible::KindDisabled) => summary.kind_disabled += 1,
            Some(Ineligible::NoCredits) => summary.no_credits += 1,
            Some(Ineligible::AtCapacity) => summary.at_capacity += 1,
            None => {}
        }
    }
    summary
}

pub struct LoadBalancer {
    store: Arc<WorkerStore>,
    admission: Arc<AdmissionController>,
    max_attempts: usize,
}

impl LoadBalancer {
    pub fn new(
        store: Arc<WorkerStore>,
        admission: Arc<AdmissionController>,
        max_attempts: usize,
    ) -> Self {
        Self {
            store,
            admission,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Best eligible worker for `kind`, or `NoEligibleWorker`.
    pub fn select(&self, kind: Kind) -> Result<WorkerRecord> {
        let records = self.store.list();
        let best = records
            .iter()
            .filter(|r| r.is_eligible(kind))
            .min_by(|a, b| rank(a, b, kind))
            .cloned();

        match best {
            Some(record) => {
                debug!(
                    worker_id = record.id,
                    kind = %kind,
                    load = record.capacity(kind).load_ratio(),
                    "worker selected"
                );
                Ok(record)
            }
            None => Err(Error::NoEligibleWorker {
                kind,
                summary: exhaustion(&records, kind),
            }),
        }
    }

    /// Select a worker and reserve capacity on it.
    pub fn acquire(&self, kind: Kind) -> Result<(WorkerRecord, Permit)> {
        for attempt in 1..=self.max_attempts {
            let record = self.select(kind)?;
            match self.admission.acquire(record.id, kind) {
                Ok(permit) => return Ok((record, permit)),
                Err(rejected) => {
                    debug!(attempt, %rejected, "selected worker lost the race, reselecting");
                }
            }
        }
        Err(Error::NoEligibleWorker {
            kind,
            summary: exhaustion(&self.store.list(), kind),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::harness;
    use crate::worker::Health;
    use crate::worker::tests::record;

    #[test]
    fn rank_prefers_lower_load() {
        let mut a = record(1);
        let mut b = record(2);
        a.image = crate::worker::KindCapacity::new(true, 2);
        b.image = crate::worker::KindCapacity::new(true, 2);
        a.image.in_flight = 1;
        assert_eq!(rank(&a, &b, Kind::Image), Ordering::Greater);
    }

    #[test]
    fn rank_prefers_known_higher_credits_then_less_usage() {
        let mut a = record(1);
        let mut b = record(2);
        a.credits = Some(50);
        b.credits = None;
        assert_eq!(rank(&a, &b, Kind::Image), Ordering::Less);

        b.credits = Some(80);
        assert_eq!(rank(&a, &b, Kind::Image), Ordering::Greater);

        b.credits = Some(50);
        a.usage.image_total = 10;
        assert_eq!(rank(&a, &b, Kind::Image), Ordering::Greater);

        a.usage.image_total = 0;
        assert_eq!(rank(&a, &b, Kind::Image), Ordering::Less, "id breaks ties");
    }

    #[tokio::test]
    async fn select_prefers_idle_worker() {
        let h = harness().await;
        let a = h.add("a", 2, -1).await;
        let b = h.add("b", 2, -1).await;
        let admission = Arc::new(AdmissionController::new(h.store.clone()));
        let balancer = LoadBalancer::new(h.store.clone(), admission.clone(), 3);

        let _busy = admission.acquire(a, Kind::Image).unwrap();
        assert_eq!(balancer.select(Kind::Image).unwrap().id, b);
    }

    #[tokio::test]
    async fn select_excludes_error_banned_worker() {
        let h = harness().await;
        let a = h.add("a", -1, -1).await;
        let b = h.add("b", -1, -1).await;
        let admission = Arc::new(AdmissionController::new(h.store.clone()));
        let balancer = LoadBalancer::new(h.store.clone(), admission, 3);
        let tracker = crate::health::HealthTracker::new(
            h.store.clone(),
            2,
            crate::health::DEFAULT_RATE_LIMIT_BAN,
        );

        assert_eq!(balancer.select(Kind::Image).unwrap().id, a);
        for _ in 0..2 {
            tracker
                .record(a, Kind::Image, upstream::Outcome::Failure)
                .await
                .unwrap();
        }
        assert_eq!(balancer.select(Kind::Image).unwrap().id, b);
    }

    #[tokio::test]
    async fn select_skips_workers_without_credits() {
        let h = harness().await;
        let a = h.add("a", -1, -1).await;
        let b = h.add("b", -1, -1).await;
        h.store.mutate(a, |r| r.credits = Some(0)).await.unwrap();
        let admission = Arc::new(AdmissionController::new(h.store.clone()));
        let balancer = LoadBalancer::new(h.store.clone(), admission, 3);
        assert_eq!(balancer.select(Kind::Video).unwrap().id, b);
    }

    #[tokio::test]
    async fn no_eligible_worker_when_all_disabled_banned_or_full() {
        let h = harness().await;
        let disabled = h.add("a", -1, -1).await;
        let banned = h.add("b", -1, -1).await;
        let full = h.add("c", 1, -1).await;
        h.store.set_enabled(disabled, false).await.unwrap();
        h.store
            .mutate(banned, |r| {
                r.health = Health::RateLimited {
                    since: 0,
                    until: u64::MAX,
                }
            })
            .await
            .unwrap();
        let admission = Arc::new(AdmissionController::new(h.store.clone()));
        let _held = admission.acquire(full, Kind::Image).unwrap();
        let balancer = LoadBalancer::new(h.store.clone(), admission, 3);

        match balancer.select(Kind::Image) {
            Err(Error::NoEligibleWorker { kind, summary }) => {
                assert_eq!(kind, Kind::Image);
                assert_eq!(summary.total, 3);
                assert_eq!(summary.disabled, 1);
                assert_eq!(summary.banned, 1);
                assert_eq!(summary.at_capacity, 1);
            }
            other => panic!("expected NoEligibleWorker, got {other:?}"),
        }
        assert!(matches!(
            balancer.acquire(Kind::Image),
            Err(Error::NoEligibleWorker { .. })
        ));
    }

    #[tokio::test]
    async fn empty_pool_has_no_eligible_worker() {
        let h = harness().await;
        let admission = Arc::new(AdmissionController::new(h.store.clone()));
        let balancer = LoadBalancer::new(h.store.clone(), admission, 3);
        assert!(matches!(
            balancer.select(Kind::Video),
            Err(Error::NoEligibleWorker { .. })
        ));
    }

    #[tokio::test]
    async fn acquire_spreads_across_workers() {
        let h = harness().await;
        let a = h.add("a", 1, -1).await;
        let b = h.add("b", 1, -1).await;
        let admission = Arc::new(AdmissionController::new(h.store.clone()));
        let balancer = LoadBalancer::new(h.store.clone(), admission, 3);

        let (first, _p1) = balancer.acquire(Kind::Image).unwrap();
        let (second, _p2) = balancer.acquire(Kind::Image).unwrap();
        assert_eq!((first.id, second.id), (a, b));
        assert!(balancer.acquire(Kind::Image).is_err());
    }
}
