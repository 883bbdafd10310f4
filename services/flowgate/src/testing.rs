//! Shared fixtures for router tests

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use upstream::{
    BoxFuture, CreditsSource, Exchange, Generator, IdentityExchange, Kind, UpstreamError,
};
use worker_pool::worker::ManualClock;
use worker_pool::{JsonRecordStore, PoolSettings, WorkerPool, WorkerStore};

/// 2025-01-01T00:00:00Z in unix milliseconds.
pub const T0: u64 = 1_735_689_600_000;

/// Identity exchange keyed by refresh credential: `rt_<name>` maps to
/// `<name>@example.com`, anything else is rejected.
#[derive(Default)]
pub struct FakeExchange;

impl IdentityExchange for FakeExchange {
    fn exchange<'a>(&'a self, refresh: &'a str) -> BoxFuture<'a, upstream::Result<Exchange>> {
        Box::pin(async move {
            let name = refresh
                .strip_prefix("rt_")
                .ok_or_else(|| UpstreamError::InvalidCredential("unknown session".into()))?;
            Ok(Exchange {
                access: format!("at_{name}"),
                expires_at: Some(T0 + 86_400_000),
                email: format!("{name}@example.com"),
            })
        })
    }
}

/// Generator returning scripted results per access credential; unscripted
/// credentials echo the payload back.
#[derive(Default)]
pub struct FakeGenerator {
    scripted: Mutex<HashMap<String, upstream::Result<serde_json::Value>>>,
    pub calls: Mutex<Vec<(String, Kind)>>,
}

impl FakeGenerator {
    pub fn script(&self, access: &str, result: upstream::Result<serde_json::Value>) {
        self.scripted
            .lock()
            .unwrap()
            .insert(access.to_string(), result);
    }
}

impl Generator for FakeGenerator {
    fn invoke<'a>(
        &'a self,
        access: &'a str,
        kind: Kind,
        payload: &'a serde_json::Value,
    ) -> BoxFuture<'a, upstream::Result<serde_json::Value>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push((access.to_string(), kind));
            match self.scripted.lock().unwrap().remove(access) {
                Some(result) => result,
                None => Ok(serde_json::json!({ "echo": payload, "kind": kind })),
            }
        })
    }
}

/// Balance source: `at_<name>` holds 100 credits per character of `name`.
pub struct FakeCredits;

impl CreditsSource for FakeCredits {
    fn credits<'a>(&'a self, access: &'a str) -> BoxFuture<'a, upstream::Result<i64>> {
        Box::pin(async move {
            let name = access
                .strip_prefix("at_")
                .ok_or_else(|| UpstreamError::InvalidCredential("unknown access".into()))?;
            Ok(100 * name.len() as i64)
        })
    }
}

/// Pool backed by a JSON file under `dir` and a clock pinned at `T0`.
pub async fn test_pool(dir: &Path) -> Arc<WorkerPool> {
    let backend = JsonRecordStore::open(dir.join("workers.json")).await.unwrap();
    let store = WorkerStore::load(
        Arc::new(backend),
        Arc::new(FakeExchange),
        Arc::new(ManualClock::new(T0)),
    )
    .await
    .unwrap();
    Arc::new(
        WorkerPool::new(Arc::new(store), None, PoolSettings::default())
            .with_credits_source(Arc::new(FakeCredits)),
    )
}
