//! Outcome classification for upstream generation responses
//!
//! The health tracker only needs to know which bucket a call fell into. A 429
//! is always a rate limit; other statuses count as a rate limit when the body
//! carries one of the upstream's throttling markers, since the upstream
//! sometimes reports quota exhaustion with a 400 or 403.

use upstream::Outcome;

/// Body markers the upstream uses for throttling and quota exhaustion.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "resource_exhausted",
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "quota exceeded",
    "exceeded your quota",
];

/// Whether a response body carries a throttling marker.
pub fn is_rate_limit_body(body: &str) -> bool {
    let lower = body.to_lowercase();
    RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Classify an upstream response by HTTP status and body.
pub fn classify_status(status: u16, body: &str) -> Outcome {
    match status {
        200..=299 => Outcome::Success,
        429 => Outcome::RateLimited,
        _ if is_rate_limit_body(body) => Outcome::RateLimited,
        _ => Outcome::Failure,
    }
}
