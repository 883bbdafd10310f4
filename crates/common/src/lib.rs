//! Shared types for the flowgate workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
