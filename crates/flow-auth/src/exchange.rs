//! Refresh credential → access credential exchange
//!
//! The identity service answers a GET on the session endpoint, authenticated
//! by the session cookie, with the current access token, its expiry as an
//! RFC 3339 string and the account's email. An invalid or revoked cookie yields
//! either 401/403 or a 200 with an empty JSON object, both treated as
//! `InvalidCredentials`.

use serde::Deserialize;
use tracing::debug;
use upstream::{BoxFuture, Exchange, IdentityExchange};

use crate::constants::{SESSION_COOKIE, SESSION_ENDPOINT, USER_AGENT};
use crate::error::{Error, Result};

/// Shape of the session endpoint response. Every field is optional because
/// an unauthenticated session is answered with `{}`.
#[derive(Debug, Deserialize)]
struct SessionResponse {
    access_token: Option<String>,
    expires: Option<String>,
    user: Option<SessionUser>,
}

#[derive(Debug, Deserialize)]
struct SessionUser {
    email: Option<String>,
}

/// Parse a session endpoint body into an `Exchange`.
///
/// An unparseable `expires` value is dropped (expiry unknown) rather than
/// failing the exchange; the refresh scheduler ignores workers without a
/// known expiry.
pub fn parse_session_response(body: &str) -> Result<Exchange> {
    let parsed: SessionResponse = serde_json::from_str(body)
        .map_err(|e| Error::Exchange(format!("invalid session response: {e}")))?;

    let access = parsed
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::InvalidCredentials("session has no access token".into()))?;

    let email = parsed
        .user
        .and_then(|u| u.email)
        .filter(|e| !e.is_empty())
        .ok_or_else(|| Error::InvalidCredentials("session has no account email".into()))?;

    let expires_at = parsed.expires.as_deref().and_then(parse_expiry);

    Ok(Exchange {
        access,
        expires_at,
        email,
    })
}

/// RFC 3339 timestamp → unix milliseconds.
fn parse_expiry(raw: &str) -> Option<u64> {
    match chrono::DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => u64::try_from(ts.timestamp_millis()).ok(),
        Err(e) => {
            debug!(expires = raw, error = %e, "ignoring unparseable expiry");
            None
        }
    }
}

/// HTTP client for the identity service session endpoint.
#[derive(Clone)]
pub struct SessionExchangeClient {
    client: reqwest::Client,
    endpoint: String,
}

impl SessionExchangeClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoint(client, SESSION_ENDPOINT)
    }

    /// Point the client at a non-default session endpoint.
    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Exchange a refresh credential for an access credential.
    pub async fn exchange_session(&self, refresh: &str) -> Result<Exchange> {
        let response = self
            .client
            .get(&self.endpoint)
            .header(reqwest::header::COOKIE, format!("{SESSION_COOKIE}={refresh}"))
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(|e| Error::Http(format!("session request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "session rejected ({status}): {body}"
            )));
        }
        if !status.is_success() {
            return Err(Error::Exchange(format!(
                "session endpoint returned {status}: {body}"
            )));
        }

        let exchange = parse_session_response(&body)?;
        debug!(email = %exchange.email, expires_at = ?exchange.expires_at, "session exchanged");
        Ok(exchange)
    }
}

impl IdentityExchange for SessionExchangeClient {
    fn exchange<'a>(&'a self, refresh: &'a str) -> BoxFuture<'a, upstream::Result<Exchange>> {
        Box::pin(async move { self.exchange_session(refresh).await.map_err(Into::into) })
    }
}
