//! Contracts between the worker pool and its external collaborators
//!
//! The pool never talks to the network or a browser directly. It consumes:
//! - `IdentityExchange`: refresh credential → access credential + expiry + account email
//! - `SessionRefresher`: browser-assisted renewal of the refresh credential
//! - `Generator`: the opaque upstream generation call
//! - `CreditsSource`: remaining credit balance of an account
//!
//! All traits return `Pin<Box<dyn Future>>` so they can be held as `Arc<dyn Trait>`.

pub mod kind;

pub use kind::{Kind, UnknownKind};

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;

/// Boxed future returned by collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which bucket a finished upstream call fell into.
///
/// This is all the scheduler needs to know about a call:
/// - Success resets the consecutive error counter
/// - RateLimited raises a rate-limit ban
/// - Failure counts towards the error-ban threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    Failure,
}

impl Outcome {
    pub fn label(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RateLimited => "rate_limited",
            Outcome::Failure => "failure",
        }
    }
}

/// Result of exchanging a refresh credential with the identity service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub access: String,
    /// Access credential expiry as unix milliseconds; `None` when the
    /// identity service did not report one.
    pub expires_at: Option<u64>,
    pub email: String,
}

/// Errors from collaborator calls.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("credential rejected: {0}")]
    InvalidCredential(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("upstream call timed out")]
    Timeout,

    #[error("no cached browser session for worker {0}")]
    NoSession(u64),

    #[error("session refresh failed: {0}")]
    Session(String),
}

impl UpstreamError {
    /// Outcome bucket this error represents when it ends a generation call.
    pub fn outcome(&self) -> Outcome {
        match self {
            UpstreamError::RateLimited(_) => Outcome::RateLimited,
            _ => Outcome::Failure,
        }
    }
}

/// Result alias for collaborator calls.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Exchanges a long-lived refresh credential for a short-lived access credential.
pub trait IdentityExchange: Send + Sync {
    fn exchange<'a>(&'a self, refresh: &'a str) -> BoxFuture<'a, Result<Exchange>>;
}

/// Cached browser session state of one worker, as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub has_session: bool,
    pub needs_login: bool,
    /// Last time the session was saved, unix milliseconds.
    pub last_modified: Option<u64>,
}

impl SessionStatus {
    pub fn from_presence(has_session: bool) -> Self {
        Self {
            has_session,
            needs_login: !has_session,
            last_modified: None,
        }
    }
}

/// Browser-assisted session cache able to mint a fresh refresh credential.
///
/// `refresh_via_session` may run for minutes; callers must run it off the
/// request path and bound it with a timeout.
pub trait SessionRefresher: Send + Sync {
    fn has_cached_session(&self, worker_id: u64) -> bool;

    fn refresh_via_session(&self, worker_id: u64) -> BoxFuture<'_, Result<String>>;

    fn session_status(&self, worker_id: u64) -> SessionStatus {
        SessionStatus::from_presence(self.has_cached_session(worker_id))
    }

    /// Forget a worker's cached session. Missing sessions are not an error.
    fn discard_session(&self, worker_id: u64) -> BoxFuture<'_, Result<()>>;
}

/// Reports the remaining credit balance of the account behind an access
/// credential.
pub trait CreditsSource: Send + Sync {
    fn credits<'a>(&'a self, access: &'a str) -> BoxFuture<'a, Result<i64>>;
}

/// Performs one upstream generation call with a worker's access credential.
pub trait Generator: Send + Sync {
    fn invoke<'a>(
        &'a self,
        access: &'a str,
        kind: Kind,
        payload: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value>>;
}
