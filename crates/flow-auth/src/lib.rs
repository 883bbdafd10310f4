//! Identity and browser-session collaborators for the worker pool
//!
//! Concrete implementations of the `upstream` collaborator traits:
//! 1. `SessionExchangeClient` trades a refresh credential (session cookie) for
//!    an access token, its expiry and the account email
//! 2. `SessionDirectory` tracks cached browser sessions per worker
//! 3. `CommandSessionRefresher` runs an external browser-automation helper
//!    against a cached session to mint a new refresh credential

pub mod constants;
pub mod error;
pub mod exchange;
pub mod session;

pub use constants::*;
pub use error::{Error, Result};
pub use exchange::{SessionExchangeClient, parse_session_response};
pub use session::{CommandSessionRefresher, SessionDirectory};
