//! Error types for pool operations

use std::fmt;

use serde::Serialize;
use upstream::Kind;

use crate::worker::WorkerId;

/// Why no worker could take a request, counted over the whole pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Exhaustion {
    pub total: usize,
    pub disabled: usize,
    pub banned: usize,
    pub kind_disabled: usize,
    pub no_credits: usize,
    pub at_capacity: usize,
}

impl fmt::Display for Exhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} workers: {} disabled, {} banned, {} kind disabled, {} out of credits, {} at capacity",
            self.total,
            self.disabled,
            self.banned,
            self.kind_disabled,
            self.no_credits,
            self.at_capacity
        )
    }
}

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("worker not found: {0}")]
    NotFound(WorkerId),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("account {0} already has a worker")]
    DuplicateAccount(String),

    #[error("no eligible worker for {kind} ({summary})")]
    NoEligibleWorker { kind: Kind, summary: Exhaustion },

    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),

    #[error("credit balance unavailable: {0}")]
    CreditsUnavailable(String),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
