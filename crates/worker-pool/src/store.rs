//! Authoritative in-memory worker set with write-through persistence
//!
//! Each worker lives in its own `Arc<Mutex<WorkerRecord>>` slot so counter
//! mutations on one worker are linearizable without blocking others. The
//! mutex is a plain `std::sync::Mutex` and is never held across an await,
//! which keeps admission non-suspending.
//!
//! Every durable mutation takes `write_lock` (an async mutex) for the whole
//! mutate-then-persist sequence, so the persisted order of writes matches the
//! in-memory order. Reads never touch the persistent store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use upstream::{Exchange, IdentityExchange};

use crate::error::{Error, Result};
use crate::persist::RecordStore;
use crate::worker::{
    Clock, Health, KindCapacity, Usage, WorkerId, WorkerRecord, day_of, until_next_day,
};

/// Shared handle to one worker's live record.
pub(crate) type Slot = Arc<Mutex<WorkerRecord>>;

pub(crate) fn lock(slot: &Slot) -> MutexGuard<'_, WorkerRecord> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Options accepted when adding a worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub remark: Option<String>,
    pub enabled: bool,
    pub image_enabled: bool,
    pub video_enabled: bool,
    pub image_concurrency: i32,
    pub video_concurrency: i32,
    pub credits: Option<i64>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            project_id: None,
            project_name: None,
            remark: None,
            enabled: true,
            image_enabled: true,
            video_enabled: true,
            image_concurrency: -1,
            video_concurrency: -1,
            credits: None,
        }
    }
}

impl WorkerOptions {
    fn validate(&self) -> Result<()> {
        validate_limit("image_concurrency", self.image_concurrency)?;
        validate_limit("video_concurrency", self.video_concurrency)
    }
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerUpdate {
    /// New refresh credential; triggers a fresh identity exchange.
    pub refresh: Option<String>,
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub remark: Option<String>,
    pub image_enabled: Option<bool>,
    pub video_enabled: Option<bool>,
    pub image_concurrency: Option<i32>,
    pub video_concurrency: Option<i32>,
    pub credits: Option<i64>,
}

impl WorkerUpdate {
    fn validate(&self) -> Result<()> {
        if let Some(limit) = self.image_concurrency {
            validate_limit("image_concurrency", limit)?;
        }
        if let Some(limit) = self.video_concurrency {
            validate_limit("video_concurrency", limit)?;
        }
        if self.refresh.as_deref().is_some_and(str::is_empty) {
            return Err(Error::InvalidUpdate("refresh credential is empty".into()));
        }
        Ok(())
    }

    fn apply(self, record: &mut WorkerRecord, exchange: Option<Exchange>) {
        if let (Some(refresh), Some(exchange)) = (self.refresh, exchange) {
            record.refresh = refresh;
            record.access = Some(exchange.access);
            record.access_expires_at = exchange.expires_at;
            record.email = exchange.email;
        }
        if self.project_id.is_some() {
            record.project_id = self.project_id;
        }
        if self.project_name.is_some() {
            record.project_name = self.project_name;
        }
        if self.remark.is_some() {
            record.remark = self.remark;
        }
        if let Some(enabled) = self.image_enabled {
            record.image.enabled = enabled;
        }
        if let Some(enabled) = self.video_enabled {
            record.video.enabled = enabled;
        }
        if let Some(limit) = self.image_concurrency {
            record.image.limit = limit;
        }
        if let Some(limit) = self.video_concurrency {
            record.video.limit = limit;
        }
        if self.credits.is_some() {
            record.credits = self.credits;
        }
    }
}

fn validate_limit(field: &str, limit: i32) -> Result<()> {
    if limit < -1 {
        return Err(Error::InvalidUpdate(format!(
            "{field} must be -1 (unlimited), 0 (disabled) or positive, got {limit}"
        )));
    }
    Ok(())
}

/// Owner of the worker set.
pub struct WorkerStore {
    workers: RwLock<BTreeMap<WorkerId, Slot>>,
    backend: Arc<dyn RecordStore>,
    identity: Arc<dyn IdentityExchange>,
    clock: Arc<dyn Clock>,
    write_lock: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    changes: watch::Sender<u64>,
}

impl WorkerStore {
    /// Load every persisted record into memory.
    pub async fn load(
        backend: Arc<dyn RecordStore>,
        identity: Arc<dyn IdentityExchange>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let records = backend.load_all().await?;
        let next_id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let workers: BTreeMap<WorkerId, Slot> = records
            .into_iter()
            .map(|r| (r.id, Arc::new(Mutex::new(r))))
            .collect();
        info!(workers = workers.len(), "worker store loaded");

        let (changes, _) = watch::channel(0);
        Ok(Self {
            workers: RwLock::new(workers),
            backend,
            identity,
            clock,
            write_lock: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(next_id),
            changes,
        })
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Snapshot of every worker, ordered by id.
    pub fn list(&self) -> Vec<WorkerRecord> {
        let workers = self.workers.read().unwrap_or_else(PoisonError::into_inner);
        workers.values().map(|slot| lock(slot).clone()).collect()
    }

    pub fn get(&self, id: WorkerId) -> Result<WorkerRecord> {
        self.slot(id)
            .map(|slot| lock(&slot).clone())
            .ok_or(Error::NotFound(id))
    }

    pub fn len(&self) -> usize {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find_by_email(&self, email: &str) -> Option<WorkerRecord> {
        let workers = self.workers.read().unwrap_or_else(PoisonError::into_inner);
        workers.values().find_map(|slot| {
            let record = lock(slot);
            record
                .email
                .eq_ignore_ascii_case(email)
                .then(|| record.clone())
        })
    }

    pub(crate) fn slot(&self, id: WorkerId) -> Option<Slot> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Receiver bumped whenever credentials, enablement or membership change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify_changed(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    async fn exchange(&self, refresh: &str) -> Result<Exchange> {
        self.identity
            .exchange(refresh)
            .await
            .map_err(|e| Error::InvalidCredential(e.to_string()))
    }

    /// Add a worker from its refresh credential.
    ///
    /// The credential is exchanged first; a rejected exchange fails with
    /// `InvalidCredential` and nothing is created.
    pub async fn add(&self, refresh: String, options: WorkerOptions) -> Result<WorkerRecord> {
        options.validate()?;
        let exchange = self.exchange(&refresh).await?;

        let _guard = self.write_lock.lock().await;
        if self.find_by_email(&exchange.email).is_some() {
            return Err(Error::DuplicateAccount(exchange.email));
        }

        let now = self.now();
        let record = WorkerRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            refresh,
            access: Some(exchange.access),
            access_expires_at: exchange.expires_at,
            email: exchange.email,
            project_id: options.project_id,
            project_name: options.project_name,
            remark: options.remark,
            enabled: options.enabled,
            image: KindCapacity::new(options.image_enabled, options.image_concurrency),
            video: KindCapacity::new(options.video_enabled, options.video_concurrency),
            credits: options.credits,
            consecutive_errors: 0,
            health: Health::Healthy,
            usage: Usage {
                day: day_of(now),
                ..Usage::default()
            },
            created_at: now,
            last_used_at: None,
        };

        self.backend.save(&record).await?;
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, Arc::new(Mutex::new(record.clone())));
        self.notify_changed();
        info!(worker_id = record.id, email = %record.email, "worker added");
        Ok(record)
    }

    /// Apply a partial update. A new refresh credential is exchanged before
    /// anything changes; rejection leaves the worker untouched.
    pub async fn update(&self, id: WorkerId, update: WorkerUpdate) -> Result<WorkerRecord> {
        update.validate()?;
        if self.slot(id).is_none() {
            return Err(Error::NotFound(id));
        }
        let exchange = match update.refresh.as_deref() {
            Some(refresh) => Some(self.exchange(refresh).await?),
            None => None,
        };

        let _guard = self.write_lock.lock().await;
        if let Some(exchange) = &exchange {
            if let Some(other) = self.find_by_email(&exchange.email) {
                if other.id != id {
                    return Err(Error::DuplicateAccount(exchange.email.clone()));
                }
            }
        }
        let slot = self.slot(id).ok_or(Error::NotFound(id))?;
        let snapshot = {
            let mut record = lock(&slot);
            update.apply(&mut record, exchange);
            record.clone()
        };
        self.backend.save(&snapshot).await?;
        self.notify_changed();
        debug!(worker_id = id, "worker updated");
        Ok(snapshot)
    }

    /// Remove a worker. Permits still held against it release harmlessly.
    pub async fn remove(&self, id: WorkerId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.slot(id).is_none() {
            return Err(Error::NotFound(id));
        }
        self.backend.delete(id).await?;
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        self.notify_changed();
        info!(worker_id = id, "worker removed");
        Ok(())
    }

    /// Administrator toggle. Re-enabling also lifts an error ban.
    pub async fn set_enabled(&self, id: WorkerId, enabled: bool) -> Result<WorkerRecord> {
        let (snapshot, lifted) = self
            .mutate(id, |record| {
                record.enabled = enabled;
                let lifted = enabled && matches!(record.health, Health::ErrorBanned { .. });
                if lifted {
                    record.health = Health::Healthy;
                    record.consecutive_errors = 0;
                }
                lifted
            })
            .await?;
        self.notify_changed();
        info!(worker_id = id, enabled, error_ban_lifted = lifted, "worker enablement changed");
        Ok(snapshot)
    }

    /// Re-exchange the stored refresh credential for a new access credential.
    pub async fn refresh_access(&self, id: WorkerId) -> Result<WorkerRecord> {
        let refresh = self.get(id)?.refresh;
        let exchange = self
            .identity
            .exchange(&refresh)
            .await
            .map_err(|e| Error::RefreshFailed(e.to_string()))?;
        self.store_exchange(id, None, exchange).await
    }

    /// Install a newly minted refresh credential and its access credential.
    pub async fn replace_refresh(&self, id: WorkerId, refresh: String) -> Result<WorkerRecord> {
        let exchange = self
            .identity
            .exchange(&refresh)
            .await
            .map_err(|e| Error::RefreshFailed(e.to_string()))?;
        self.store_exchange(id, Some(refresh), exchange).await
    }

    async fn store_exchange(
        &self,
        id: WorkerId,
        refresh: Option<String>,
        exchange: Exchange,
    ) -> Result<WorkerRecord> {
        let (snapshot, email_changed) = self
            .mutate(id, |record| {
                if let Some(refresh) = refresh {
                    record.refresh = refresh;
                }
                record.access = Some(exchange.access);
                record.access_expires_at = exchange.expires_at;
                record.email != exchange.email
            })
            .await?;
        if email_changed {
            warn!(worker_id = id, "credential now resolves to a different account");
        }
        self.notify_changed();
        info!(worker_id = id, expires_at = ?snapshot.access_expires_at, "access credential refreshed");
        Ok(snapshot)
    }

    /// Store a freshly queried credit balance.
    pub async fn set_credits(&self, id: WorkerId, credits: i64) -> Result<WorkerRecord> {
        let (snapshot, previous) = self
            .mutate(id, |record| record.credits.replace(credits))
            .await?;
        info!(worker_id = id, credits, previous = ?previous, "credit balance updated");
        Ok(snapshot)
    }

    /// Start a new usage day for every worker whose bucket is stale.
    pub async fn reset_daily(&self) -> Result<usize> {
        let day = day_of(self.now());
        let ids: Vec<WorkerId> = self.list().iter().filter(|r| r.usage.day < day).map(|r| r.id).collect();
        for id in &ids {
            self.mutate(*id, |record| record.usage.roll(day)).await?;
        }
        if !ids.is_empty() {
            info!(workers = ids.len(), day, "daily usage counters reset");
        }
        Ok(ids.len())
    }

    /// Mutate one record in place and write it through to the backend.
    ///
    /// Returns the post-mutation snapshot and the closure's result. The
    /// in-memory change stands even if persisting fails.
    pub(crate) async fn mutate<T>(
        &self,
        id: WorkerId,
        f: impl FnOnce(&mut WorkerRecord) -> T,
    ) -> Result<(WorkerRecord, T)> {
        let _guard = self.write_lock.lock().await;
        let slot = self.slot(id).ok_or(Error::NotFound(id))?;
        let (snapshot, out) = {
            let mut record = lock(&slot);
            let out = f(&mut record);
            (record.clone(), out)
        };
        if let Err(e) = self.backend.save(&snapshot).await {
            warn!(worker_id = id, error = %e, "failed to persist worker mutation");
            return Err(e);
        }
        Ok((snapshot, out))
    }
}

/// Spawn the task that starts a new usage day at each UTC midnight, so idle
/// workers do not keep reporting the previous day's counts.
pub fn spawn_daily_reset(store: Arc<WorkerStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let wait = std::time::Duration::from_millis(until_next_day(store.now()));
            debug!(wait_secs = wait.as_secs(), "daily usage reset sleeping");
            tokio::time::sleep(wait).await;
            if let Err(e) = store.reset_daily().await {
                warn!(error = %e, "daily usage reset failed");
            }
        }
    })
}
