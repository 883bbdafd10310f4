//! Per-worker, per-kind concurrency gate
//!
//! `acquire` checks eligibility and capacity under the worker's slot lock and
//! either increments the in-flight count and hands out a `Permit`, or rejects
//! immediately. Nothing here awaits: a rejected caller asks the balancer for a
//! different worker instead of queueing.
//!
//! A `Permit` releases its unit when dropped, so a request that errors, times
//! out or is cancelled still gives the capacity back.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error};
use upstream::Kind;

use crate::store::{Slot, WorkerStore, lock};
use crate::worker::{Ineligible, WorkerId};

/// Why `acquire` turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotFound,
    AtCapacity,
    Ineligible(Ineligible),
}

/// Admission refusal. An ordinary result, not a failure of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub worker_id: WorkerId,
    pub kind: Kind,
    pub reason: RejectReason,
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker {} rejected {} request: {:?}",
            self.worker_id, self.kind, self.reason
        )
    }
}

impl std::error::Error for Rejected {}

/// One reserved unit of a worker's capacity for one kind.
#[must_use = "dropping a permit releases its capacity immediately"]
pub struct Permit {
    slot: Slot,
    worker_id: WorkerId,
    kind: Kind,
}

impl Permit {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Release explicitly. Equivalent to dropping the permit.
    pub fn release(self) {}
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("worker_id", &self.worker_id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut record = lock(&self.slot);
        let capacity = record.capacity_mut(self.kind);
        debug_assert!(
            capacity.in_flight > 0,
            "permit released with no request in flight"
        );
        if capacity.in_flight == 0 {
            error!(
                worker_id = self.worker_id,
                kind = %self.kind,
                "in-flight count already zero on release, clamping"
            );
            return;
        }
        capacity.in_flight -= 1;
    }
}

/// Hands out and takes back admission permits.
pub struct AdmissionController {
    store: Arc<WorkerStore>,
}

impl AdmissionController {
    pub fn new(store: Arc<WorkerStore>) -> Self {
        Self { store }
    }

    /// Reserve one unit of `kind` capacity on worker `id`, or reject at once.
    pub fn acquire(&self, id: WorkerId, kind: Kind) -> Result<Permit, Rejected> {
        let reject = |reason| {
            metrics::counter!("pool_admission_rejected_total", "kind" => kind.as_str())
                .increment(1);
            debug!(worker_id = id, kind = %kind, reason = ?reason, "admission rejected");
            Rejected {
                worker_id: id,
                kind,
                reason,
            }
        };

        let Some(slot) = self.store.slot(id) else {
            return Err(reject(RejectReason::NotFound));
        };

        {
            let mut record = lock(&slot);
            match record.ineligibility(kind) {
                None => record.capacity_mut(kind).in_flight += 1,
                Some(Ineligible::AtCapacity) => return Err(reject(RejectReason::AtCapacity)),
                Some(other) => return Err(reject(RejectReason::Ineligible(other))),
            }
        }

        Ok(Permit {
            slot,
            worker_id: id,
            kind,
        })
    }

    /// Give a permit's capacity back.
    pub fn release(&self, permit: Permit) {
        permit.release();
    }

    /// Current in-flight count for one worker and kind.
    pub fn in_flight(&self, id: WorkerId, kind: Kind) -> Option<u32> {
        self.store
            .slot(id)
            .map(|slot| lock(&slot).capacity(kind).in_flight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::harness;
    use crate::worker::Health;

    #[tokio::test]
    async fn limit_two_admits_two_then_rejects() {
        let h = harness().await;
        let id = h.add("a", 2, -1).await;
        let admission = AdmissionController::new(h.store.clone());

        let first = admission.acquire(id, Kind::Image).unwrap();
        let _second = admission.acquire(id, Kind::Image).unwrap();
        let rejected = admission.acquire(id, Kind::Image).unwrap_err();
        assert_eq!(rejected.reason, RejectReason::AtCapacity);
        assert_eq!(admission.in_flight(id, Kind::Image), Some(2));

        admission.release(first);
        let _third = admission.acquire(id, Kind::Image).unwrap();
        assert_eq!(admission.in_flight(id, Kind::Image), Some(2));
    }

    #[tokio::test]
    async fn unlimited_never_rejects() {
        let h = harness().await;
        let id = h.add("a", -1, -1).await;
        let admission = AdmissionController::new(h.store.clone());

        let permits: Vec<_> = (0..500)
            .map(|_| admission.acquire(id, Kind::Video).unwrap())
            .collect();
        assert_eq!(admission.in_flight(id, Kind::Video), Some(500));
        drop(permits);
        assert_eq!(admission.in_flight(id, Kind::Video), Some(0));
    }

    #[tokio::test]
    async fn acquire_then_release_restores_count() {
        let h = harness().await;
        let id = h.add("a", 3, -1).await;
        let admission = AdmissionController::new(h.store.clone());
        let _held = admission.acquire(id, Kind::Image).unwrap();

        let before = admission.in_flight(id, Kind::Image);
        let permit = admission.acquire(id, Kind::Image).unwrap();
        assert_eq!(permit.worker_id(), id);
        assert_eq!(permit.kind(), Kind::Image);
        admission.release(permit);
        assert_eq!(admission.in_flight(id, Kind::Image), before);
    }

    #[tokio::test]
    async fn kinds_are_counted_separately() {
        let h = harness().await;
        let id = h.add("a", 1, 1).await;
        let admission = AdmissionController::new(h.store.clone());

        let _image = admission.acquire(id, Kind::Image).unwrap();
        let _video = admission.acquire(id, Kind::Video).unwrap();
        assert!(admission.acquire(id, Kind::Image).is_err());
    }

    #[tokio::test]
    async fn ineligible_workers_are_rejected_with_reason() {
        let h = harness().await;
        let id = h.add("a", -1, 0).await;
        let admission = AdmissionController::new(h.store.clone());

        let err = admission.acquire(id, Kind::Video).unwrap_err();
        assert_eq!(err.reason, RejectReason::Ineligible(Ineligible::KindDisabled));

        h.store
            .mutate(id, |r| r.health = Health::ErrorBanned { since: 0 })
            .await
            .unwrap();
        let err = admission.acquire(id, Kind::Image).unwrap_err();
        assert_eq!(err.reason, RejectReason::Ineligible(Ineligible::Banned));

        let err = admission.acquire(99, Kind::Image).unwrap_err();
        assert_eq!(err.reason, RejectReason::NotFound);
    }

    #[tokio::test]
    async fn permit_outlives_worker_removal() {
        let h = harness().await;
        let id = h.add("a", 1, -1).await;
        let admission = AdmissionController::new(h.store.clone());

        let permit = admission.acquire(id, Kind::Image).unwrap();
        h.store.remove(id).await.unwrap();
        drop(permit);
        assert_eq!(admission.in_flight(id, Kind::Image), None);
    }

    #[tokio::test]
    async fn permit_released_when_task_is_cancelled() {
        let h = harness().await;
        let id = h.add("a", 1, -1).await;
        let admission = Arc::new(AdmissionController::new(h.store.clone()));

        let task = {
            let admission = admission.clone();
            tokio::spawn(async move {
                let _permit = admission.acquire(id, Kind::Image).unwrap();
                std::future::pending::<()>().await;
            })
        };
        while admission.in_flight(id, Kind::Image) != Some(1) {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;
        assert_eq!(admission.in_flight(id, Kind::Image), Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_never_exceed_limit() {
        let h = harness().await;
        let id = h.add("a", 3, -1).await;
        let admission = Arc::new(AdmissionController::new(h.store.clone()));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let admission = admission.clone();
                tokio::spawn(async move {
                    let mut max_seen = 0;
                    for _ in 0..200 {
                        if let Ok(permit) = admission.acquire(id, Kind::Image) {
                            let now = admission.in_flight(id, Kind::Image).unwrap();
                            max_seen = max_seen.max(now);
                            tokio::task::yield_now().await;
                            drop(permit);
                        }
                    }
                    max_seen
                })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap() <= 3);
        }
        assert_eq!(admission.in_flight(id, Kind::Image), Some(0));
    }
}
