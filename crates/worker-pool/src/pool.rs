//! Pool facade exposed to the admin and request layers
//!
//! `WorkerPool` owns the store and the components that act on it and exposes
//! the operations the outer layers consume. It is constructed once by the
//! process that runs the server and passed to handlers explicitly.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use upstream::{CreditsSource, Kind, Outcome, SessionRefresher, SessionStatus};

use crate::admission::{AdmissionController, Permit};
use crate::balancer::{DEFAULT_MAX_SELECT_ATTEMPTS, LoadBalancer};
use crate::error::{Error, Result};
use crate::health::{
    DEFAULT_ERROR_THRESHOLD, DEFAULT_RATE_LIMIT_BAN, HealthTracker, WorkerHealth,
    spawn_ban_sweeper,
};
use crate::store::{WorkerOptions, WorkerStore, WorkerUpdate, spawn_daily_reset};
use crate::worker::{Health, WorkerId, WorkerRecord, WorkerSummary, day_of};

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub error_threshold: u32,
    pub rate_limit_ban: Duration,
    pub sweep_interval: Duration,
    pub max_select_attempts: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            rate_limit_ban: DEFAULT_RATE_LIMIT_BAN,
            sweep_interval: Duration::from_secs(3600),
            max_select_attempts: DEFAULT_MAX_SELECT_ATTEMPTS,
        }
    }
}

/// A worker chosen for one request, with capacity reserved on it.
///
/// Dropping the lease releases the capacity.
#[derive(Debug)]
pub struct Lease {
    pub worker: WorkerRecord,
    pub permit: Permit,
}

impl Lease {
    pub fn worker_id(&self) -> WorkerId {
        self.worker.id
    }
}

/// Worker listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    #[serde(flatten)]
    pub worker: WorkerSummary,
    /// No cached browser session; renewal needs a manual login.
    pub needs_login: bool,
    /// Browser session details, absent when session refresh is not configured.
    #[serde(rename = "browser_session", skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionStatus>,
}

/// Aggregate counts for the admin dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub total: usize,
    pub enabled: usize,
    pub healthy: usize,
    pub error_banned: usize,
    pub rate_limited: usize,
    pub total_credits: i64,
    pub today_image: u64,
    pub today_video: u64,
    pub today_error: u64,
    pub in_flight_image: u64,
    pub in_flight_video: u64,
}

pub struct WorkerPool {
    store: Arc<WorkerStore>,
    admission: Arc<AdmissionController>,
    health: Arc<HealthTracker>,
    balancer: LoadBalancer,
    sessions: Option<Arc<dyn SessionRefresher>>,
    credits: Option<Arc<dyn CreditsSource>>,
    settings: PoolSettings,
}

impl WorkerPool {
    pub fn new(
        store: Arc<WorkerStore>,
        sessions: Option<Arc<dyn SessionRefresher>>,
        settings: PoolSettings,
    ) -> Self {
        let admission = Arc::new(AdmissionController::new(store.clone()));
        let health = Arc::new(HealthTracker::new(
            store.clone(),
            settings.error_threshold,
            settings.rate_limit_ban,
        ));
        let balancer = LoadBalancer::new(
            store.clone(),
            admission.clone(),
            settings.max_select_attempts,
        );
        info!(
            workers = store.len(),
            error_threshold = settings.error_threshold,
            rate_limit_ban_secs = settings.rate_limit_ban.as_secs(),
            "worker pool initialized"
        );
        Self {
            store,
            admission,
            health,
            balancer,
            sessions,
            credits: None,
            settings,
        }
    }

    /// Query balances from `source` on `refresh_credits`.
    pub fn with_credits_source(mut self, source: Arc<dyn CreditsSource>) -> Self {
        self.credits = Some(source);
        self
    }

    pub fn store(&self) -> &Arc<WorkerStore> {
        &self.store
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn health_tracker(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// Start the ban sweeper on the configured interval.
    pub fn spawn_ban_sweeper(&self) -> JoinHandle<()> {
        spawn_ban_sweeper(self.health.clone(), self.settings.sweep_interval)
    }

    /// Start the task that rolls usage day buckets at each UTC midnight.
    pub fn spawn_daily_reset(&self) -> JoinHandle<()> {
        spawn_daily_reset(self.store.clone())
    }

    fn view(&self, record: &WorkerRecord, now: u64) -> WorkerView {
        let session = self
            .sessions
            .as_ref()
            .map(|sessions| sessions.session_status(record.id));
        WorkerView {
            worker: WorkerSummary::at(record, now),
            needs_login: session.as_ref().is_some_and(|s| s.needs_login),
            session,
        }
    }

    pub fn list_workers(&self) -> Vec<WorkerView> {
        let now = self.store.now();
        self.store
            .list()
            .iter()
            .map(|record| self.view(record, now))
            .collect()
    }

    pub fn get_worker(&self, id: WorkerId) -> Result<WorkerView> {
        let record = self.store.get(id)?;
        Ok(self.view(&record, self.store.now()))
    }

    pub async fn add_worker(&self, refresh: String, options: WorkerOptions) -> Result<WorkerRecord> {
        self.store.add(refresh, options).await
    }

    /// Add a worker, or update the credentials of the worker that already
    /// holds the same account. Returns the record and whether it was created.
    pub async fn import_worker(
        &self,
        refresh: String,
        options: WorkerOptions,
    ) -> Result<(WorkerRecord, bool)> {
        match self.store.add(refresh.clone(), options.clone()).await {
            Ok(record) => Ok((record, true)),
            Err(Error::DuplicateAccount(email)) => {
                let existing = self
                    .store
                    .find_by_email(&email)
                    .ok_or_else(|| Error::DuplicateAccount(email.clone()))?;
                let update = WorkerUpdate {
                    refresh: Some(refresh),
                    project_id: options.project_id,
                    project_name: options.project_name,
                    remark: options.remark,
                    ..WorkerUpdate::default()
                };
                let record = self.store.update(existing.id, update).await?;
                info!(worker_id = record.id, email = %record.email, "worker credentials re-imported");
                Ok((record, false))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn update_worker(&self, id: WorkerId, update: WorkerUpdate) -> Result<WorkerRecord> {
        self.store.update(id, update).await
    }

    /// Remove a worker and forget its cached browser session.
    pub async fn remove_worker(&self, id: WorkerId) -> Result<()> {
        self.store.remove(id).await?;
        if let Some(sessions) = &self.sessions {
            if let Err(e) = sessions.discard_session(id).await {
                warn!(worker_id = id, error = %e, "failed to delete browser session of removed worker");
            }
        }
        Ok(())
    }

    pub async fn set_enabled(&self, id: WorkerId, enabled: bool) -> Result<WorkerRecord> {
        self.store.set_enabled(id, enabled).await
    }

    /// Best eligible worker for `kind`. Does not reserve capacity.
    pub fn select_worker(&self, kind: Kind) -> Result<WorkerRecord> {
        self.balancer.select(kind)
    }

    /// Select a worker and reserve capacity on it.
    pub fn acquire(&self, kind: Kind) -> Result<Lease> {
        let (worker, permit) = self.balancer.acquire(kind)?;
        Ok(Lease { worker, permit })
    }

    /// A usable access credential for `worker`, re-exchanging the refresh
    /// credential when the cached one is missing or expired.
    pub async fn access_credential(&self, worker: &WorkerRecord) -> Result<String> {
        if let Some(access) = worker.access_at(self.store.now()) {
            return Ok(access.to_string());
        }
        let refreshed = self.store.refresh_access(worker.id).await?;
        refreshed
            .access
            .ok_or_else(|| Error::RefreshFailed("exchange returned no access credential".into()))
    }

    pub async fn record_outcome(&self, id: WorkerId, kind: Kind, outcome: Outcome) -> Result<Health> {
        self.health.record(id, kind, outcome).await
    }

    pub fn get_health(&self, id: WorkerId) -> Result<WorkerHealth> {
        self.health.health(id)
    }

    /// Re-exchange the stored refresh credential for a new access credential.
    pub async fn force_refresh(&self, id: WorkerId) -> Result<WorkerRecord> {
        self.store.refresh_access(id).await
    }

    /// Query the worker's current credit balance and store it.
    pub async fn refresh_credits(&self, id: WorkerId) -> Result<WorkerRecord> {
        let source = self
            .credits
            .as_ref()
            .ok_or_else(|| Error::CreditsUnavailable("no credit source configured".into()))?;
        let worker = self.store.get(id)?;
        let access = self.access_credential(&worker).await?;
        let credits = source
            .credits(&access)
            .await
            .map_err(|e| Error::CreditsUnavailable(e.to_string()))?;
        self.store.set_credits(id, credits).await
    }

    pub fn error_threshold(&self) -> u32 {
        self.health.error_threshold()
    }

    pub fn set_error_threshold(&self, threshold: u32) -> Result<()> {
        self.health.set_error_threshold(threshold)
    }

    pub fn summary(&self) -> PoolSummary {
        let day = day_of(self.store.now());
        let mut summary = PoolSummary::default();
        for record in self.store.list() {
            summary.total += 1;
            if record.enabled {
                summary.enabled += 1;
            }
            match record.health {
                Health::Healthy => summary.healthy += 1,
                Health::ErrorBanned { .. } => summary.error_banned += 1,
                Health::RateLimited { .. } => summary.rate_limited += 1,
            }
            summary.total_credits += record.credits.unwrap_or(0).max(0);
            let usage = record.usage.as_of(day);
            summary.today_image += usage.today_image;
            summary.today_video += usage.today_video;
            summary.today_error += usage.today_error;
            summary.in_flight_image += u64::from(record.image.in_flight);
            summary.in_flight_video += u64::from(record.video.in_flight);
        }
        summary
    }

    /// Pool health for the health endpoint.
    ///
    /// `healthy` when every enabled worker is healthy, `degraded` when some
    /// are, `unhealthy` when none are (or none are enabled).
    pub fn health_report(&self) -> serde_json::Value {
        let records = self.store.list();
        let enabled: Vec<&WorkerRecord> = records.iter().filter(|r| r.enabled).collect();
        let healthy = enabled
            .iter()
            .filter(|r| r.health == Health::Healthy)
            .count();

        let status = if !enabled.is_empty() && healthy == enabled.len() {
            "healthy"
        } else if healthy > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        let workers: Vec<serde_json::Value> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.id,
                    "enabled": r.enabled,
                    "status": r.health.label(),
                })
            })
            .collect();

        serde_json::json!({
            "status": status,
            "workers_total": records.len(),
            "workers_enabled": enabled.len(),
            "workers_healthy": healthy,
            "workers": workers,
        })
    }

    /// Start a new usage day where the stored bucket is stale.
    pub async fn reset_daily(&self) -> Result<usize> {
        self.store.reset_daily().await
    }
}
