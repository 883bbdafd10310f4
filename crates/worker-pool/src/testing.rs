//! Collaborator fakes shared by the unit tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use upstream::{
    BoxFuture, CreditsSource, Exchange, IdentityExchange, SessionRefresher, UpstreamError,
};

use crate::error::Result;
use crate::persist::{JsonRecordStore, RecordStore};
use crate::store::{WorkerOptions, WorkerStore};
use crate::worker::{Clock, ManualClock, WorkerId, WorkerRecord};

/// 2023-11-14T22:13:20Z, a fixed starting point for manual clocks.
pub const T0: u64 = 1_700_000_000_000;

/// Identity service fake: `st_<name>` maps to `<name>@example.com`, anything
/// starting with `bad` is rejected. Expiry is `expires_in` after the clock.
pub struct FakeExchange {
    clock: Arc<dyn Clock>,
    expires_in: Mutex<Option<Duration>>,
    pub calls: AtomicUsize,
}

impl FakeExchange {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            expires_in: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_expires_in(&self, expires_in: Option<Duration>) {
        *self.expires_in.lock().unwrap() = expires_in;
    }
}

impl IdentityExchange for FakeExchange {
    fn exchange<'a>(&'a self, refresh: &'a str) -> BoxFuture<'a, upstream::Result<Exchange>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if refresh.starts_with("bad") {
                return Err(UpstreamError::InvalidCredential(format!("{refresh} rejected")));
            }
            let name = refresh.trim_start_matches("st_");
            let name = name.split('#').next().unwrap_or(name);
            let expires_at = self
                .expires_in
                .lock()
                .unwrap()
                .map(|d| self.clock.now_millis() + d.as_millis() as u64);
            Ok(Exchange {
                access: format!("at_{refresh}"),
                expires_at,
                email: format!("{name}@example.com"),
            })
        })
    }
}

/// Browser session fake: sessions exist for listed workers; refreshing
/// returns `st_<email-name>#<n>` or fails for workers in `failing`.
#[derive(Default)]
pub struct FakeSessions {
    pub sessions: Mutex<HashSet<WorkerId>>,
    pub failing: Mutex<HashSet<WorkerId>>,
    pub names: Mutex<HashMap<WorkerId, String>>,
    pub delay: Mutex<Option<Duration>>,
    pub calls: Mutex<Vec<WorkerId>>,
}

impl FakeSessions {
    pub fn with_session(&self, id: WorkerId, name: &str) {
        self.sessions.lock().unwrap().insert(id);
        self.names.lock().unwrap().insert(id, name.to_string());
    }

    pub fn calls(&self) -> Vec<WorkerId> {
        self.calls.lock().unwrap().clone()
    }
}

impl SessionRefresher for FakeSessions {
    fn has_cached_session(&self, worker_id: u64) -> bool {
        self.sessions.lock().unwrap().contains(&worker_id)
    }

    fn refresh_via_session(&self, worker_id: u64) -> BoxFuture<'_, upstream::Result<String>> {
        Box::pin(async move {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(worker_id);
                calls.len()
            };
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.lock().unwrap().contains(&worker_id) {
                return Err(UpstreamError::Session("login required".into()));
            }
            let name = self
                .names
                .lock()
                .unwrap()
                .get(&worker_id)
                .cloned()
                .unwrap_or_else(|| format!("w{worker_id}"));
            Ok(format!("st_{name}#{n}"))
        })
    }

    fn discard_session(&self, worker_id: u64) -> BoxFuture<'_, upstream::Result<()>> {
        Box::pin(async move {
            self.sessions.lock().unwrap().remove(&worker_id);
            Ok(())
        })
    }
}

/// Credit balances keyed by access credential; unknown credentials fail.
#[derive(Default)]
pub struct FakeCredits {
    balances: Mutex<HashMap<String, i64>>,
}

impl FakeCredits {
    pub fn set(&self, access: &str, credits: i64) {
        self.balances
            .lock()
            .unwrap()
            .insert(access.to_string(), credits);
    }
}

impl CreditsSource for FakeCredits {
    fn credits<'a>(&'a self, access: &'a str) -> BoxFuture<'a, upstream::Result<i64>> {
        Box::pin(async move {
            self.balances
                .lock()
                .unwrap()
                .get(access)
                .copied()
                .ok_or_else(|| UpstreamError::InvalidCredential(format!("{access} unknown")))
        })
    }
}

pub struct Harness {
    pub _dir: tempfile::TempDir,
    pub clock: Arc<ManualClock>,
    pub exchange: Arc<FakeExchange>,
    pub store: Arc<WorkerStore>,
}

pub async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let exchange = Arc::new(FakeExchange::new(clock.clone()));
    let backend = Arc::new(
        JsonRecordStore::open(dir.path().join("workers.json"))
            .await
            .unwrap(),
    );
    let store = Arc::new(
        WorkerStore::load(backend, exchange.clone(), clock.clone())
            .await
            .unwrap(),
    );
    Harness {
        _dir: dir,
        clock,
        exchange,
        store,
    }
}

impl Harness {
    /// Add a worker named `name` with the given per-kind limits.
    pub async fn add(&self, name: &str, image_limit: i32, video_limit: i32) -> WorkerId {
        add_to(&self.store, name, image_limit, video_limit).await
    }
}

/// Clock that follows tokio's (pausable) time, for tests of timer loops.
pub struct TokioClock {
    base: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            base: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> u64 {
        T0 + self.base.elapsed().as_millis() as u64
    }
}

/// Record store with no I/O, so paused-time tests never wait on the
/// blocking pool.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<WorkerId, WorkerRecord>>,
}

impl RecordStore for MemoryRecordStore {
    fn load_all(&self) -> BoxFuture<'_, Result<Vec<WorkerRecord>>> {
        Box::pin(async move { Ok(self.records.lock().unwrap().values().cloned().collect()) })
    }

    fn save<'a>(&'a self, record: &'a WorkerRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.records.lock().unwrap().insert(record.id, record.clone());
            Ok(())
        })
    }

    fn delete(&self, id: WorkerId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.records.lock().unwrap().remove(&id);
            Ok(())
        })
    }
}

/// Store on tokio time and an in-memory backend.
pub async fn timed_store() -> (Arc<FakeExchange>, Arc<WorkerStore>) {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let exchange = Arc::new(FakeExchange::new(clock.clone()));
    let store = WorkerStore::load(
        Arc::new(MemoryRecordStore::default()),
        exchange.clone(),
        clock,
    )
    .await
    .unwrap();
    (exchange, Arc::new(store))
}

pub async fn add_to(store: &WorkerStore, name: &str, image_limit: i32, video_limit: i32) -> WorkerId {
    let options = WorkerOptions {
        image_concurrency: image_limit,
        video_concurrency: video_limit,
        ..WorkerOptions::default()
    };
    store
        .add(format!("st_{name}"), options)
        .await
        .unwrap()
        .id
}
