//! Generation request path
//!
//! `GenerationHandler` runs one request against the pool:
//! 1. Select the least-loaded eligible worker and reserve capacity for the kind
//! 2. Obtain a usable access credential (re-exchanging an expired one)
//! 3. Invoke the upstream generator under the per-kind timeout
//! 4. Release the capacity
//! 5. Feed the outcome back into worker health and usage
//!
//! The capacity reservation is an RAII permit, so a client disconnect that
//! drops the request future mid-call still releases it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{Instrument, debug, info_span, warn};
use upstream::{BoxFuture, CreditsSource, Generator, Kind, Outcome, UpstreamError};
use worker_pool::{WorkerPool, classify_status};

use crate::error::ApiError;
use crate::metrics;

/// Header carrying the request id on every generation response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Upstream generation client.
///
/// POSTs the opaque payload to `{base_url}/{kind}` with the worker's access
/// credential as a bearer token. Non-2xx responses are classified into
/// rate-limit or failure errors; the per-kind deadline is enforced by the
/// caller. Balances are read from `GET {base_url}/credits`.
pub struct HttpGenerator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGenerator {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn call(
        &self,
        access: &str,
        kind: Kind,
        payload: &serde_json::Value,
    ) -> upstream::Result<serde_json::Value> {
        let url = format!("{}/{}", self.base_url, kind.as_str());
        let response = self
            .client
            .post(&url)
            .bearer_auth(access)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::Http(e.to_string())
                }
            })?;

        read_json(response).await
    }

    async fn balance(&self, access: &str) -> upstream::Result<i64> {
        #[derive(Deserialize)]
        struct Balance {
            credits: i64,
        }

        let url = format!("{}/credits", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(access)
            .send()
            .await
            .map_err(|e| UpstreamError::Http(e.to_string()))?;
        let balance: Balance = serde_json::from_value(read_json(response).await?)
            .map_err(|e| UpstreamError::Http(format!("invalid credits response: {e}")))?;
        Ok(balance.credits)
    }
}

/// Classify an upstream response and parse a successful body as JSON.
async fn read_json(response: reqwest::Response) -> upstream::Result<serde_json::Value> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| UpstreamError::Http(format!("reading response body: {e}")))?;

    match classify_status(status, &body) {
        Outcome::Success => serde_json::from_str(&body)
            .map_err(|e| UpstreamError::Http(format!("invalid JSON from upstream: {e}"))),
        Outcome::RateLimited => Err(UpstreamError::RateLimited(body)),
        Outcome::Failure if status == 401 => Err(UpstreamError::InvalidCredential(body)),
        Outcome::Failure => Err(UpstreamError::Status { status, body }),
    }
}

impl CreditsSource for HttpGenerator {
    fn credits<'a>(&'a self, access: &'a str) -> BoxFuture<'a, upstream::Result<i64>> {
        Box::pin(self.balance(access))
    }
}

impl Generator for HttpGenerator {
    fn invoke<'a>(
        &'a self,
        access: &'a str,
        kind: Kind,
        payload: &'a serde_json::Value,
    ) -> BoxFuture<'a, upstream::Result<serde_json::Value>> {
        Box::pin(self.call(access, kind, payload))
    }
}

/// Per-kind upstream deadlines.
#[derive(Debug, Clone, Copy)]
pub struct KindTimeouts {
    pub image: Duration,
    pub video: Duration,
}

impl KindTimeouts {
    pub fn get(&self, kind: Kind) -> Duration {
        match kind {
            Kind::Image => self.image,
            Kind::Video => self.video,
        }
    }
}

/// Orchestrates one generation request over the worker pool.
pub struct GenerationHandler {
    pool: Arc<WorkerPool>,
    generator: Arc<dyn Generator>,
    timeouts: KindTimeouts,
}

impl GenerationHandler {
    pub fn new(
        pool: Arc<WorkerPool>,
        generator: Arc<dyn Generator>,
        timeouts: KindTimeouts,
    ) -> Self {
        Self {
            pool,
            generator,
            timeouts,
        }
    }

    /// Run `payload` against the best worker for `kind`.
    pub async fn generate(
        &self,
        kind: Kind,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, ApiError> {
        let lease = self.pool.acquire(kind).map_err(|e| {
            if matches!(e, worker_pool::Error::NoEligibleWorker { .. }) {
                metrics::record_rejected(kind);
                warn!(kind = %kind, error = %e, "no eligible worker");
            }
            ApiError::from(e)
        })?;
        let worker_id = lease.worker_id();
        debug!(worker_id, kind = %kind, "worker selected");

        let started = Instant::now();
        let (outcome, result) = match self.pool.access_credential(&lease.worker).await {
            Ok(access) => {
                let result = tokio::time::timeout(
                    self.timeouts.get(kind),
                    self.generator.invoke(&access, kind, &payload),
                )
                .await
                .unwrap_or(Err(UpstreamError::Timeout));
                let outcome = match &result {
                    Ok(_) => Outcome::Success,
                    Err(e) => e.outcome(),
                };
                (outcome, result.map_err(ApiError::from))
            }
            Err(e) => {
                warn!(worker_id, error = %e, "no usable access credential");
                (Outcome::Failure, Err(ApiError::from(e)))
            }
        };
        drop(lease);

        if let Err(e) = self.pool.record_outcome(worker_id, kind, outcome).await {
            warn!(worker_id, error = %e, "failed to record outcome");
        }
        metrics::record_generation(kind, outcome, started.elapsed().as_secs_f64());

        match &result {
            Ok(_) => debug!(worker_id, kind = %kind, "generation succeeded"),
            Err(e) => warn!(
                worker_id,
                kind = %kind,
                outcome = outcome.label(),
                error = %e,
                "generation failed"
            ),
        }
        result
    }
}

async fn run(
    handler: &GenerationHandler,
    kind: &str,
    payload: Result<axum::Json<serde_json::Value>, JsonRejection>,
) -> Result<serde_json::Value, ApiError> {
    let kind: Kind = kind
        .parse()
        .map_err(|e: upstream::UnknownKind| ApiError::bad_request(e.to_string()))?;
    let axum::Json(payload) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    handler.generate(kind, payload).await
}

/// POST /v1/generate/{kind}
pub async fn generate_handler(
    State(handler): State<Arc<GenerationHandler>>,
    Path(kind): Path<String>,
    payload: Result<axum::Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let span = info_span!("generate", request_id = %request_id, kind = %kind);
    let result = run(&handler, &kind, payload).instrument(span).await;

    let mut response = match result {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response(),
        Err(e) => e.with_request_id(request_id.clone()).into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
