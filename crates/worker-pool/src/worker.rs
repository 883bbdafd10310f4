//! Worker record: one managed upstream credential and its live counters
//!
//! The record is plain data. All mutation goes through `WorkerStore`,
//! `AdmissionController` and `HealthTracker`; the eligibility and ranking
//! predicates here are pure reads used by those components.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use upstream::{Kind, Outcome};

/// Stable worker identifier assigned by the store.
pub type WorkerId = u64;

const MILLIS_PER_DAY: u64 = 86_400_000;

/// Source of wall-clock time in unix milliseconds.
///
/// Every timestamp the pool stores or compares (credential expiry, ban
/// deadlines, usage day buckets) is read through this.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually advanced clock.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self(AtomicU64::new(start_millis))
    }

    pub fn set(&self, millis: u64) {
        self.0.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: std::time::Duration) {
        self.0.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// UTC day number for a unix millisecond timestamp.
pub fn day_of(millis: u64) -> u64 {
    millis / MILLIS_PER_DAY
}

/// Milliseconds from `millis` to the next UTC midnight.
pub fn until_next_day(millis: u64) -> u64 {
    MILLIS_PER_DAY - millis % MILLIS_PER_DAY
}

/// Health of a worker.
///
/// Transitions (driven by `HealthTracker`):
/// - Healthy → ErrorBanned (consecutive failures reach the threshold)
/// - Healthy | ErrorBanned → RateLimited (upstream rate-limit signal)
/// - RateLimited → Healthy (ban sweep at or after `until`)
/// - ErrorBanned → Healthy (administrator re-enables the worker)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Health {
    #[default]
    Healthy,
    ErrorBanned {
        since: u64,
    },
    RateLimited {
        since: u64,
        until: u64,
    },
}

impl Health {
    pub fn label(&self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::ErrorBanned { .. } => "error_banned",
            Health::RateLimited { .. } => "rate_limited",
        }
    }

    pub fn is_banned(&self) -> bool {
        !matches!(self, Health::Healthy)
    }
}

/// Per-kind capability, concurrency limit and in-flight count.
///
/// `limit`: negative = unlimited, `0` = kind disabled, positive = hard cap.
/// `in_flight` is live state only and is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCapacity {
    pub enabled: bool,
    pub limit: i32,
    #[serde(skip)]
    pub in_flight: u32,
}

impl Default for KindCapacity {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: -1,
            in_flight: 0,
        }
    }
}

impl KindCapacity {
    pub fn new(enabled: bool, limit: i32) -> Self {
        Self {
            enabled,
            limit,
            in_flight: 0,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit < 0
    }

    /// Whether one more request of this kind fits.
    pub fn has_capacity(&self) -> bool {
        match self.limit {
            l if l < 0 => true,
            0 => false,
            l => self.in_flight < l as u32,
        }
    }

    /// Current load in `[0, 1]`; unlimited capacity counts as zero load.
    pub fn load_ratio(&self) -> f64 {
        if self.limit <= 0 {
            return 0.0;
        }
        f64::from(self.in_flight) / f64::from(self.limit)
    }
}

/// Lifetime and same-day usage counters.
///
/// The `today_*` buckets belong to UTC day `day`; they restart from zero the
/// first time a counter is touched on a later day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub image_total: u64,
    pub video_total: u64,
    pub error_total: u64,
    pub today_image: u64,
    pub today_video: u64,
    pub today_error: u64,
    pub day: u64,
}

impl Usage {
    /// Start a new day bucket if `day` is later than the current one.
    pub fn roll(&mut self, day: u64) {
        if day > self.day {
            self.today_image = 0;
            self.today_video = 0;
            self.today_error = 0;
            self.day = day;
        }
    }

    /// The counters as they read on `day`; a stale day bucket reads as zero.
    pub fn as_of(&self, day: u64) -> Usage {
        let mut usage = self.clone();
        usage.roll(day);
        usage
    }

    pub fn record(&mut self, kind: Kind, outcome: Outcome, day: u64) {
        self.roll(day);
        match (outcome, kind) {
            (Outcome::Success, Kind::Image) => {
                self.image_total += 1;
                self.today_image += 1;
            }
            (Outcome::Success, Kind::Video) => {
                self.video_total += 1;
                self.today_video += 1;
            }
            (Outcome::RateLimited | Outcome::Failure, _) => {
                self.error_total += 1;
                self.today_error += 1;
            }
        }
    }

    /// Successful generations over the worker's lifetime.
    pub fn lifetime(&self) -> u64 {
        self.image_total + self.video_total
    }
}

/// One managed upstream account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    /// Long-lived refresh credential.
    pub refresh: String,
    /// Short-lived access credential, absent until first exchanged.
    #[serde(default)]
    pub access: Option<String>,
    /// Access credential expiry, unix milliseconds. `None` = unknown.
    #[serde(default)]
    pub access_expires_at: Option<u64>,
    pub email: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub remark: Option<String>,
    pub enabled: bool,
    pub image: KindCapacity,
    pub video: KindCapacity,
    /// Remaining credit balance, `None` = never queried.
    #[serde(default)]
    pub credits: Option<i64>,
    #[serde(default)]
    pub consecutive_errors: u32,
    #[serde(default)]
    pub health: Health,
    #[serde(default)]
    pub usage: Usage,
    pub created_at: u64,
    #[serde(default)]
    pub last_used_at: Option<u64>,
}

impl WorkerRecord {
    pub fn capacity(&self, kind: Kind) -> &KindCapacity {
        match kind {
            Kind::Image => &self.image,
            Kind::Video => &self.video,
        }
    }

    pub fn capacity_mut(&mut self, kind: Kind) -> &mut KindCapacity {
        match kind {
            Kind::Image => &mut self.image,
            Kind::Video => &mut self.video,
        }
    }

    pub fn has_credits(&self) -> bool {
        self.credits.is_none_or(|c| c > 0)
    }

    /// Why this worker cannot take a request of `kind`, or `None` if it can.
    pub fn ineligibility(&self, kind: Kind) -> Option<Ineligible> {
        let capacity = self.capacity(kind);
        if !self.enabled {
            Some(Ineligible::Disabled)
        } else if self.health.is_banned() {
            Some(Ineligible::Banned)
        } else if !capacity.enabled || capacity.limit == 0 {
            Some(Ineligible::KindDisabled)
        } else if !self.has_credits() {
            Some(Ineligible::NoCredits)
        } else if !capacity.has_capacity() {
            Some(Ineligible::AtCapacity)
        } else {
            None
        }
    }

    pub fn is_eligible(&self, kind: Kind) -> bool {
        self.ineligibility(kind).is_none()
    }

    /// The cached access credential, if it is still valid at `now`.
    pub fn access_at(&self, now: u64) -> Option<&str> {
        match (self.access.as_deref(), self.access_expires_at) {
            (Some(access), Some(expires)) if expires > now => Some(access),
            (Some(access), None) => Some(access),
            _ => None,
        }
    }

    /// Milliseconds until the access credential expires (negative once expired).
    pub fn time_until_expiry(&self, now: u64) -> Option<i64> {
        self.access_expires_at
            .map(|expires| expires as i64 - now as i64)
    }
}

/// Reason a worker was filtered out of selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
    Disabled,
    Banned,
    KindDisabled,
    NoCredits,
    AtCapacity,
}

/// Secret-free view of a worker for listings and health output.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub email: String,
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub remark: Option<String>,
    pub enabled: bool,
    pub health: Health,
    pub consecutive_errors: u32,
    pub credits: Option<i64>,
    pub access_expires_at: Option<u64>,
    pub image: KindView,
    pub video: KindView,
    pub usage: Usage,
    pub created_at: u64,
    pub last_used_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KindView {
    pub enabled: bool,
    pub limit: i32,
    pub in_flight: u32,
}

impl From<&KindCapacity> for KindView {
    fn from(c: &KindCapacity) -> Self {
        Self {
            enabled: c.enabled,
            limit: c.limit,
            in_flight: c.in_flight,
        }
    }
}

impl WorkerSummary {
    /// Summary of `r` as seen at `now`.
    pub fn at(r: &WorkerRecord, now: u64) -> Self {
        Self {
            id: r.id,
            email: r.email.clone(),
            project_id: r.project_id.clone(),
            project_name: r.project_name.clone(),
            remark: r.remark.clone(),
            enabled: r.enabled,
            health: r.health,
            consecutive_errors: r.consecutive_errors,
            credits: r.credits,
            access_expires_at: r.access_expires_at,
            image: (&r.image).into(),
            video: (&r.video).into(),
            usage: r.usage.as_of(day_of(now)),
            created_at: r.created_at,
            last_used_at: r.last_used_at,
        }
    }
}
