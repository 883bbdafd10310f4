//! Error types for identity and session operations

use upstream::UpstreamError;

/// Errors from identity exchange and browser session handling.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("identity exchange failed: {0}")]
    Exchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("session helper failed: {0}")]
    Helper(String),

    #[error("no cached session for worker {0}")]
    NoSession(u64),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for UpstreamError {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidCredentials(msg) => UpstreamError::InvalidCredential(msg),
            Error::Http(msg) => UpstreamError::Http(msg),
            Error::Exchange(msg) => UpstreamError::InvalidCredential(msg),
            Error::NoSession(id) => UpstreamError::NoSession(id),
            Error::Helper(msg) | Error::Io(msg) => UpstreamError::Session(msg),
        }
    }
}
