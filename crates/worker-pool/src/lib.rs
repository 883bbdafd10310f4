//! Worker pool scheduling core
//!
//! Manages a pool of upstream credentials ("workers") that execute image and
//! video generation jobs: per-kind concurrency admission, outcome-driven
//! health and bans, load-aware selection, and background credential refresh.
//!
//! Worker lifecycle:
//! 1. Admin adds a worker with a refresh credential → exchanged for an access
//!    credential, persisted, `Healthy`
//! 2. A request selects the least-loaded eligible worker and takes an
//!    admission permit for its kind; the permit is released on every exit path
//! 3. The request outcome updates usage and health: failures accumulate to an
//!    error ban, a rate-limit signal raises a time-boxed ban
//! 4. The ban sweeper clears expired rate-limit bans
//! 5. The refresh scheduler renews credentials through cached browser
//!    sessions before they expire
//!
//! The in-memory store is authoritative; every mutation is written through to
//! a `RecordStore` before it returns.

pub mod admission;
pub mod balancer;
pub mod classify;
pub mod error;
pub mod health;
pub mod persist;
pub mod pool;
pub mod refresh;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;

pub use admission::{AdmissionController, Permit, RejectReason, Rejected};
pub use balancer::LoadBalancer;
pub use classify::classify_status;
pub use error::{Error, Exhaustion, Result};
pub use health::{HealthTracker, WorkerHealth, spawn_ban_sweeper};
pub use persist::{JsonRecordStore, RecordStore};
pub use pool::{Lease, PoolSettings, PoolSummary, WorkerPool, WorkerView};
pub use refresh::{RefreshScheduler, RefreshSettings, spawn_refresh_task};
pub use store::{WorkerOptions, WorkerStore, WorkerUpdate, spawn_daily_reset};
pub use worker::{
    Clock, Health, KindCapacity, SystemClock, Usage, WorkerId, WorkerRecord, WorkerSummary,
};
