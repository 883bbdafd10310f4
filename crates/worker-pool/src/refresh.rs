//! Proactive credential refresh
//!
//! One background loop keeps every worker's credential valid. Each pass:
//! 1. plans from the live worker set: enabled workers with a known expiry
//!    inside `buffer` are due; the rest contribute `expiry - buffer` to the
//!    next wake time
//! 2. submits due workers that have a cached browser session to the
//!    `RefreshQueue`, `stagger` apart
//! 3. sleeps until the planned wake time (floored at `min_sleep`, `fallback`
//!    when nothing has a known expiry), a pool mutation, or a job completion
//!
//! A failed, abandoned or session-less refresh suppresses the worker until
//! `fallback` has passed so a worker that needs manual login is not hammered.
//! Failures never disable or ban the worker.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use upstream::{SessionRefresher, UpstreamError};

use crate::error::{Error, Result};
use crate::store::WorkerStore;
use crate::worker::{WorkerId, WorkerRecord};

/// Refresh loop tuning.
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    /// Lead time before expiry at which a worker becomes due.
    pub buffer: Duration,
    /// Shortest sleep between passes.
    pub min_sleep: Duration,
    /// Sleep when no worker has a known expiry, and retry delay after a failure.
    pub fallback: Duration,
    /// Delay between consecutive submissions within one pass.
    pub stagger: Duration,
    /// Wall-clock budget of one refresh job.
    pub job_budget: Duration,
    /// Concurrent refresh jobs.
    pub workers: usize,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            buffer: Duration::from_secs(2 * 3600),
            min_sleep: Duration::from_secs(10),
            fallback: Duration::from_secs(3600),
            stagger: Duration::from_secs(5),
            job_budget: Duration::from_secs(300),
            workers: 2,
        }
    }
}

/// Result of planning one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub due: Vec<WorkerId>,
    /// Earliest future instant something needs attention, if any.
    pub next_wake_at: Option<u64>,
    pub sleep: Duration,
}

/// Decide which workers are due and when to look again.
pub fn plan(
    records: &[WorkerRecord],
    now: u64,
    settings: &RefreshSettings,
    suppressed: &HashMap<WorkerId, u64>,
    in_progress: &HashSet<WorkerId>,
) -> Plan {
    let buffer = settings.buffer.as_millis() as u64;
    let mut due = Vec::new();
    let mut next_wake_at: Option<u64> = None;
    let mut wake_at = |at: u64| {
        next_wake_at = Some(next_wake_at.map_or(at, |current| current.min(at)));
    };

    for record in records.iter().filter(|r| r.enabled) {
        let Some(expires) = record.access_expires_at else {
            continue;
        };
        if in_progress.contains(&record.id) {
            continue;
        }
        if let Some(&retry_at) = suppressed.get(&record.id) {
            if retry_at > now {
                wake_at(retry_at);
                continue;
            }
        }
        let refresh_at = expires.saturating_sub(buffer);
        if refresh_at <= now {
            due.push(record.id);
        } else {
            wake_at(refresh_at);
        }
    }

    let sleep = next_wake_at
        .map(|at| Duration::from_millis(at.saturating_sub(now)))
        .unwrap_or(settings.fallback)
        .max(settings.min_sleep);

    Plan {
        due,
        next_wake_at,
        sleep,
    }
}

/// How a refresh job ended.
#[derive(Debug)]
pub enum JobOutcome {
    /// New refresh credential from the browser session.
    Refreshed(String),
    Failed(UpstreamError),
    /// Exceeded its wall-clock budget and was dropped.
    Abandoned,
}

impl JobOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Refreshed(_) => "ok",
            JobOutcome::Failed(_) => "failed",
            JobOutcome::Abandoned => "abandoned",
        }
    }
}

struct Job {
    worker_id: WorkerId,
    reply: oneshot::Sender<JobOutcome>,
}

/// Fixed-size pool of tasks running browser-session refresh jobs.
///
/// Jobs wait in a bounded queue; each runs under `budget` and its outcome is
/// delivered on a oneshot channel. Dropping a timed-out job drops the
/// collaborator's future, which kills any helper process it spawned.
pub struct RefreshQueue {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl RefreshQueue {
    pub fn spawn(sessions: Arc<dyn SessionRefresher>, workers: usize, budget: Duration) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(workers * 4);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers)
            .map(|slot| {
                let rx = rx.clone();
                let sessions = sessions.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else {
                            debug!(slot, "refresh queue closed, worker exiting");
                            break;
                        };
                        let id = job.worker_id;
                        debug!(slot, worker_id = id, "refresh job started");
                        let outcome =
                            match tokio::time::timeout(budget, sessions.refresh_via_session(id))
                                .await
                            {
                                Ok(Ok(refresh)) => JobOutcome::Refreshed(refresh),
                                Ok(Err(e)) => JobOutcome::Failed(e),
                                Err(_) => {
                                    warn!(
                                        worker_id = id,
                                        budget_secs = budget.as_secs(),
                                        "refresh job exceeded its budget, abandoned"
                                    );
                                    JobOutcome::Abandoned
                                }
                            };
                        if job.reply.send(outcome).is_err() {
                            debug!(worker_id = id, "refresh result dropped, submitter gone");
                        }
                    }
                })
            })
            .collect();

        Self {
            tx,
            workers: handles,
        }
    }

    /// Queue a refresh for worker `id`; the receiver yields its outcome.
    pub async fn submit(&self, worker_id: WorkerId) -> Result<oneshot::Receiver<JobOutcome>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job { worker_id, reply })
            .await
            .map_err(|_| Error::RefreshFailed("refresh queue closed".into()))?;
        Ok(rx)
    }
}

impl Drop for RefreshQueue {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[derive(Default)]
struct Tracking {
    /// Worker → earliest instant it may be retried.
    suppressed: HashMap<WorkerId, u64>,
    in_progress: HashSet<WorkerId>,
}

/// What one pass did.
#[derive(Debug, Default)]
pub struct Pass {
    pub submitted: Vec<WorkerId>,
    /// Due but without a cached session; need manual login.
    pub needs_login: Vec<WorkerId>,
    pub sleep: Duration,
    completions: Vec<JoinHandle<()>>,
}

impl Pass {
    /// Wait for every job submitted in this pass to be applied.
    pub async fn settle(self) {
        for completion in self.completions {
            let _ = completion.await;
        }
    }
}

pub struct RefreshScheduler {
    store: Arc<WorkerStore>,
    sessions: Arc<dyn SessionRefresher>,
    queue: RefreshQueue,
    settings: RefreshSettings,
    tracking: Mutex<Tracking>,
    wake: Notify,
}

impl RefreshScheduler {
    pub fn new(
        store: Arc<WorkerStore>,
        sessions: Arc<dyn SessionRefresher>,
        settings: RefreshSettings,
    ) -> Arc<Self> {
        let queue = RefreshQueue::spawn(sessions.clone(), settings.workers, settings.job_budget);
        Arc::new(Self {
            store,
            sessions,
            queue,
            settings,
            tracking: Mutex::new(Tracking::default()),
            wake: Notify::new(),
        })
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plan against the current pool without submitting anything.
    ///
    /// Suppression entries of workers no longer in the pool are dropped.
    pub fn plan_now(&self) -> Plan {
        let records = self.store.list();
        let mut tracking = self.tracking();
        tracking
            .suppressed
            .retain(|id, _| records.iter().any(|r| r.id == *id));
        plan(
            &records,
            self.store.now(),
            &self.settings,
            &tracking.suppressed,
            &tracking.in_progress,
        )
    }

    /// Run one pass and return what it did, including how long to sleep.
    pub async fn run_once(self: &Arc<Self>) -> Pass {
        let plan = self.plan_now();
        let mut pass = Pass {
            sleep: plan.sleep,
            ..Pass::default()
        };

        for id in plan.due {
            let now = self.store.now();
            let retry_at = now + self.settings.fallback.as_millis() as u64;

            if !self.sessions.has_cached_session(id) {
                warn!(
                    worker_id = id,
                    "credential expiring and no cached browser session, manual login required"
                );
                metrics::counter!("pool_refresh_total", "result" => "no_session").increment(1);
                self.tracking().suppressed.insert(id, retry_at);
                pass.needs_login.push(id);
                continue;
            }

            if !pass.submitted.is_empty() {
                tokio::time::sleep(self.settings.stagger).await;
            }

            self.tracking().in_progress.insert(id);
            let reply = match self.queue.submit(id).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(worker_id = id, error = %e, "could not queue refresh");
                    let mut tracking = self.tracking();
                    tracking.in_progress.remove(&id);
                    tracking.suppressed.insert(id, retry_at);
                    continue;
                }
            };
            info!(worker_id = id, "credential refresh queued");
            pass.submitted.push(id);

            let scheduler = self.clone();
            pass.completions.push(tokio::spawn(async move {
                let outcome = reply.await.unwrap_or(JobOutcome::Abandoned);
                scheduler.complete(id, outcome).await;
            }));
        }
        pass
    }

    async fn complete(&self, id: WorkerId, outcome: JobOutcome) {
        let label = outcome.label();
        let succeeded = match outcome {
            JobOutcome::Refreshed(refresh) => match self.store.replace_refresh(id, refresh).await {
                Ok(record) => {
                    let remaining = record.time_until_expiry(self.store.now());
                    let buffer = self.settings.buffer.as_millis() as i64;
                    if remaining.is_some_and(|ms| ms <= buffer) {
                        debug!(
                            worker_id = id,
                            "refreshed credential is already inside the buffer"
                        );
                        false
                    } else {
                        true
                    }
                }
                Err(Error::NotFound(_)) => true,
                Err(e) => {
                    warn!(worker_id = id, error = %e, "refreshed credential rejected");
                    metrics::counter!("pool_refresh_total", "result" => "failed").increment(1);
                    self.finish(id, false);
                    return;
                }
            },
            JobOutcome::Failed(e) => {
                warn!(worker_id = id, error = %e, "credential refresh failed, will retry later");
                false
            }
            JobOutcome::Abandoned => false,
        };
        metrics::counter!("pool_refresh_total", "result" => label).increment(1);
        self.finish(id, succeeded);
    }

    fn finish(&self, id: WorkerId, succeeded: bool) {
        {
            let mut tracking = self.tracking();
            tracking.in_progress.remove(&id);
            if succeeded {
                tracking.suppressed.remove(&id);
            } else {
                let retry_at = self.store.now() + self.settings.fallback.as_millis() as u64;
                tracking.suppressed.insert(id, retry_at);
            }
        }
        self.wake.notify_one();
    }

    /// Whether worker `id` is waiting out a failed or session-less refresh.
    pub fn is_suppressed(&self, id: WorkerId) -> bool {
        let now = self.store.now();
        self.tracking()
            .suppressed
            .get(&id)
            .is_some_and(|&retry_at| retry_at > now)
    }
}

/// Spawn the refresh loop.
///
/// The sleep between passes is cut short by any pool mutation that changes
/// credentials, enablement or membership, and by refresh job completion.
pub fn spawn_refresh_task(scheduler: Arc<RefreshScheduler>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut changes = scheduler.store.subscribe();
        loop {
            let _ = changes.borrow_and_update();
            let pass = scheduler.run_once().await;
            debug!(
                submitted = pass.submitted.len(),
                needs_login = pass.needs_login.len(),
                sleep_secs = pass.sleep.as_secs(),
                "refresh pass finished"
            );

            tokio::select! {
                _ = tokio::time::sleep(pass.sleep) => {}
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = scheduler.wake.notified() => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSessions, T0, add_to, harness, timed_store};
    use crate::worker::tests::record;

    const HOUR: u64 = 3_600_000;

    fn expiring(id: WorkerId, at: u64) -> WorkerRecord {
        let mut r = record(id);
        r.access_expires_at = Some(at);
        r
    }

    fn plan_at(records: &[WorkerRecord], now: u64) -> Plan {
        plan(
            records,
            now,
            &RefreshSettings::default(),
            &HashMap::new(),
            &HashSet::new(),
        )
    }

    #[test]
    fn next_wake_is_earliest_expiry_minus_buffer() {
        let records = [expiring(1, T0 + 5 * HOUR), expiring(2, T0 + 3 * HOUR)];
        let p = plan_at(&records, T0);
        assert!(p.due.is_empty());
        assert_eq!(p.next_wake_at, Some(T0 + HOUR));
        assert_eq!(p.sleep, Duration::from_secs(3600));
    }

    #[test]
    fn sooner_worker_shortens_next_wake() {
        let mut records = vec![expiring(1, T0 + 5 * HOUR)];
        let before = plan_at(&records, T0);
        assert_eq!(before.sleep, Duration::from_secs(3 * 3600));

        records.push(expiring(2, T0 + 2 * HOUR + 60_000));
        let after = plan_at(&records, T0);
        assert_eq!(after.sleep, Duration::from_secs(60));
        assert!(after.sleep < before.sleep);
    }

    #[test]
    fn workers_inside_buffer_are_due() {
        let records = [
            expiring(1, T0 + HOUR),
            expiring(2, T0 - 1),
            expiring(3, T0 + 4 * HOUR),
        ];
        let p = plan_at(&records, T0);
        assert_eq!(p.due, vec![1, 2]);
        assert_eq!(p.next_wake_at, Some(T0 + 2 * HOUR));
    }

    #[test]
    fn unknown_expiry_and_disabled_workers_fall_back() {
        let mut disabled = expiring(2, T0 + HOUR);
        disabled.enabled = false;
        let records = [record(1), disabled];
        let p = plan_at(&records, T0);
        assert!(p.due.is_empty());
        assert_eq!(p.next_wake_at, None);
        assert_eq!(p.sleep, RefreshSettings::default().fallback);
    }

    #[test]
    fn sleep_is_floored() {
        let records = [expiring(1, T0 + 2 * HOUR + 1_000)];
        let p = plan_at(&records, T0);
        assert_eq!(p.sleep, Duration::from_secs(10));
    }

    #[test]
    fn suppressed_and_in_progress_workers_are_not_due() {
        let records = [expiring(1, T0), expiring(2, T0)];
        let suppressed = HashMap::from([(1, T0 + 30 * 60_000)]);
        let in_progress = HashSet::from([2]);
        let p = plan(
            &records,
            T0,
            &RefreshSettings::default(),
            &suppressed,
            &in_progress,
        );
        assert!(p.due.is_empty());
        assert_eq!(p.next_wake_at, Some(T0 + 30 * 60_000));

        let later = plan(
            &records,
            T0 + 30 * 60_000,
            &RefreshSettings::default(),
            &suppressed,
            &HashSet::new(),
        );
        assert_eq!(later.due, vec![1, 2]);
    }

    fn settings() -> RefreshSettings {
        RefreshSettings {
            stagger: Duration::from_millis(1),
            ..RefreshSettings::default()
        }
    }

    #[tokio::test]
    async fn worker_without_session_is_skipped_and_suppressed() {
        let h = harness().await;
        h.exchange.set_expires_in(Some(Duration::from_secs(1800)));
        let id = h.add("a", -1, -1).await;
        let sessions = Arc::new(FakeSessions::default());
        let scheduler = RefreshScheduler::new(h.store.clone(), sessions.clone(), settings());

        let pass = scheduler.run_once().await;
        assert_eq!(pass.needs_login, vec![id]);
        assert!(pass.submitted.is_empty());
        assert!(scheduler.is_suppressed(id));

        h.clock.advance(Duration::from_secs(600));
        let pass = scheduler.run_once().await;
        assert!(pass.needs_login.is_empty());
        assert!(sessions.calls().is_empty());
    }

    #[tokio::test]
    async fn due_worker_is_refreshed_through_session() {
        let h = harness().await;
        h.exchange.set_expires_in(Some(Duration::from_secs(1800)));
        let id = h.add("a", -1, -1).await;
        let sessions = Arc::new(FakeSessions::default());
        sessions.with_session(id, "a");
        let scheduler = RefreshScheduler::new(h.store.clone(), sessions.clone(), settings());

        h.exchange.set_expires_in(Some(Duration::from_secs(12 * 3600)));
        let pass = scheduler.run_once().await;
        assert_eq!(pass.submitted, vec![id]);
        pass.settle().await;

        let r = h.store.get(id).unwrap();
        assert_eq!(r.refresh, "st_a#1");
        assert_eq!(r.access_expires_at, Some(T0 + 12 * HOUR));
        assert!(!scheduler.is_suppressed(id));
        assert_eq!(scheduler.plan_now().next_wake_at, Some(T0 + 10 * HOUR));
    }

    #[tokio::test]
    async fn failed_refresh_is_retried_after_fallback_not_immediately() {
        let h = harness().await;
        h.exchange.set_expires_in(Some(Duration::from_secs(1800)));
        let id = h.add("a", -1, -1).await;
        let sessions = Arc::new(FakeSessions::default());
        sessions.with_session(id, "a");
        sessions.failing.lock().unwrap().insert(id);
        let scheduler = RefreshScheduler::new(h.store.clone(), sessions.clone(), settings());

        scheduler.run_once().await.settle().await;
        assert_eq!(sessions.calls(), vec![id]);
        assert!(scheduler.is_suppressed(id));
        let r = h.store.get(id).unwrap();
        assert!(r.enabled, "refresh failure never disables a worker");
        assert_eq!(r.refresh, "st_a");

        h.clock.advance(Duration::from_secs(60));
        let pass = scheduler.run_once().await;
        assert!(pass.submitted.is_empty());

        h.clock.advance(Duration::from_secs(3600));
        let pass = scheduler.run_once().await;
        assert_eq!(pass.submitted, vec![id]);
        pass.settle().await;
        assert_eq!(sessions.calls(), vec![id, id]);
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_job_is_abandoned_without_ban() {
        let h = harness().await;
        h.exchange.set_expires_in(Some(Duration::from_secs(60)));
        let id = h.add("a", -1, -1).await;
        let sessions = Arc::new(FakeSessions::default());
        sessions.with_session(id, "a");
        *sessions.delay.lock().unwrap() = Some(Duration::from_secs(600));
        let scheduler = RefreshScheduler::new(h.store.clone(), sessions.clone(), settings());

        let pass = scheduler.run_once().await;
        assert_eq!(pass.submitted, vec![id]);
        let again = scheduler.run_once().await;
        assert!(again.submitted.is_empty(), "in-progress workers are not resubmitted");

        let started = tokio::time::Instant::now();
        pass.settle().await;
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert!(started.elapsed() < Duration::from_secs(600));

        let r = h.store.get(id).unwrap();
        assert!(r.enabled);
        assert!(!r.health.is_banned());
        assert_eq!(r.refresh, "st_a");
        assert!(scheduler.is_suppressed(id));
    }

    #[tokio::test(start_paused = true)]
    async fn submissions_are_staggered() {
        let h = harness().await;
        h.exchange.set_expires_in(Some(Duration::from_secs(60)));
        let a = h.add("a", -1, -1).await;
        let b = h.add("b", -1, -1).await;
        let sessions = Arc::new(FakeSessions::default());
        sessions.with_session(a, "a");
        sessions.with_session(b, "b");
        let scheduler = RefreshScheduler::new(
            h.store.clone(),
            sessions,
            RefreshSettings {
                stagger: Duration::from_secs(5),
                ..RefreshSettings::default()
            },
        );

        let started = tokio::time::Instant::now();
        let pass = scheduler.run_once().await;
        assert_eq!(pass.submitted, vec![a, b]);
        assert!(started.elapsed() >= Duration::from_secs(5));
        pass.settle().await;
    }

    #[tokio::test]
    async fn removed_workers_leave_no_suppression_behind() {
        let h = harness().await;
        h.exchange.set_expires_in(Some(Duration::from_secs(1800)));
        let id = h.add("a", -1, -1).await;
        let scheduler =
            RefreshScheduler::new(h.store.clone(), Arc::new(FakeSessions::default()), settings());

        scheduler.run_once().await;
        assert!(scheduler.tracking().suppressed.contains_key(&id));

        h.store.remove(id).await.unwrap();
        scheduler.plan_now();
        assert!(scheduler.tracking().suppressed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn adding_a_sooner_worker_wakes_the_sleeping_loop() {
        let (exchange, store) = timed_store().await;
        exchange.set_expires_in(Some(Duration::from_secs(24 * 3600)));
        let far = add_to(&store, "far", -1, -1).await;
        let sessions = Arc::new(FakeSessions::default());
        sessions.with_session(far, "far");
        let scheduler = RefreshScheduler::new(store.clone(), sessions.clone(), settings());
        let task = spawn_refresh_task(scheduler);

        // The loop is now asleep until 22h from the start
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(sessions.calls().is_empty());

        exchange.set_expires_in(Some(Duration::from_secs(2 * 3600 + 120)));
        let near = add_to(&store, "near", -1, -1).await;
        sessions.with_session(near, "near");
        exchange.set_expires_in(Some(Duration::from_secs(12 * 3600)));

        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(sessions.calls(), vec![near]);
        assert_eq!(store.get(near).unwrap().refresh, "st_near#1");
        assert_eq!(store.get(far).unwrap().refresh, "st_far");
        task.abort();
    }
}
