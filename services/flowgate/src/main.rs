//! flowgate
//!
//! Single-binary service fronting a pool of upstream generation accounts:
//! 1. Loads the worker pool from its JSON store
//! 2. Serves `POST /v1/generate/{kind}` by dispatching to the least-loaded
//!    eligible worker
//! 3. Keeps worker credentials fresh in the background and clears expired
//!    rate-limit bans
//! 4. Exposes an admin API on a separate listener

mod admin;
mod config;
mod error;
mod generation;
mod metrics;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flow_auth::{CommandSessionRefresher, SessionDirectory, SessionExchangeClient};
use metrics_exporter_prometheus::PrometheusHandle;
use upstream::SessionRefresher;
use worker_pool::{
    JsonRecordStore, RefreshScheduler, SystemClock, WorkerPool, WorkerStore, spawn_refresh_task,
};

use crate::admin::{AdminState, WorkerDefaults, build_admin_router};
use crate::config::Config;
use crate::generation::{GenerationHandler, HttpGenerator, KindTimeouts, generate_handler};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    pool: Arc<WorkerPool>,
    generation: Arc<GenerationHandler>,
    prometheus: PrometheusHandle,
}

impl FromRef<AppState> for Arc<GenerationHandler> {
    fn from_ref(state: &AppState) -> Self {
        state.generation.clone()
    }
}

/// Build the public router.
///
/// `max_connections` caps concurrently served requests; excess requests queue.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/generate/{kind}", post(generate_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL then RUST_LOG then info
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting flowgate");

    // Install before any metric is emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_listen_addr = %config.server.admin_listen_addr,
        upstream = %config.upstream.base_url,
        store_path = %config.pool.store_path.display(),
        refresh_enabled = config.refresh.enabled,
        "configuration loaded"
    );

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    // --- Worker pool ---
    let store_dir = config.pool.store_path.parent();
    if let Some(parent) = store_dir.filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let backend = JsonRecordStore::open(config.pool.store_path.clone())
        .await
        .context("failed to open worker store")?;
    let identity = SessionExchangeClient::with_endpoint(
        client.clone(),
        config.upstream.identity_url.clone(),
    );
    let store = Arc::new(
        WorkerStore::load(Arc::new(backend), Arc::new(identity), Arc::new(SystemClock))
            .await
            .context("failed to load workers")?,
    );

    let sessions: Option<Arc<dyn SessionRefresher>> = match &config.refresh.command {
        Some(command) => {
            let directory = SessionDirectory::new(config.refresh.session_dir.clone());
            directory
                .ensure()
                .await
                .context("failed to prepare session directory")?;
            let refresher: Arc<dyn SessionRefresher> = Arc::new(CommandSessionRefresher::new(
                directory,
                command.clone(),
                config.refresh.args.clone(),
            ));
            Some(refresher)
        }
        None => None,
    };

    let generator = Arc::new(HttpGenerator::new(
        client.clone(),
        config.upstream.base_url.clone(),
    ));
    let pool = Arc::new(
        WorkerPool::new(store.clone(), sessions.clone(), config.pool.settings())
            .with_credits_source(generator.clone()),
    );

    // --- Background tasks ---
    let mut background = vec![pool.spawn_ban_sweeper(), pool.spawn_daily_reset()];
    match (&sessions, config.refresh.enabled) {
        (Some(sessions), true) => {
            let scheduler =
                RefreshScheduler::new(store.clone(), sessions.clone(), config.refresh.settings());
            background.push(spawn_refresh_task(scheduler));
            info!(
                workers = config.refresh.workers,
                buffer_secs = config.refresh.buffer_secs,
                "credential refresh enabled"
            );
        }
        (None, true) => {
            warn!("refresh.command not set, background credential refresh disabled");
        }
        (_, false) => info!("background credential refresh disabled by config"),
    }

    // --- Public listener ---
    let generation = Arc::new(GenerationHandler::new(
        pool.clone(),
        generator,
        KindTimeouts {
            image: config.upstream.timeout(upstream::Kind::Image),
            video: config.upstream.timeout(upstream::Kind::Video),
        },
    ));
    let app = build_router(
        AppState {
            pool: pool.clone(),
            generation,
            prometheus: prometheus_handle,
        },
        config.server.max_connections,
    );

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "accepting generation requests");

    // Every server drains once the shutdown signal flips this to true
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut servers = vec![tokio::spawn(serve(listener, app, shutdown_rx.clone()))];

    // --- Admin listener ---
    match config.server.admin_key.clone() {
        Some(admin_key) => {
            let admin_app = build_admin_router(AdminState::new(
                pool.clone(),
                Some(admin_key),
                WorkerDefaults {
                    image_concurrency: config.pool.default_image_concurrency,
                    video_concurrency: config.pool.default_video_concurrency,
                },
            ));
            let admin_listener = TcpListener::bind(config.server.admin_listen_addr)
                .await
                .with_context(|| {
                    format!("failed to bind admin to {}", config.server.admin_listen_addr)
                })?;
            info!(addr = %config.server.admin_listen_addr, "admin API listening");
            servers.push(tokio::spawn(serve(
                admin_listener,
                admin_app,
                shutdown_rx.clone(),
            )));
        }
        None => warn!(
            "no admin key configured (FLOWGATE_ADMIN_KEY or admin_key_file), admin API disabled"
        ),
    }

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    // The drain timer starts at signal receipt
    let drain = join_servers(servers);
    match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
        Ok(()) => info!("all in-flight requests drained"),
        Err(_) => {
            let summary = pool.summary();
            warn!(
                in_flight_image = summary.in_flight_image,
                in_flight_video = summary.in_flight_video,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    for task in background {
        task.abort();
    }

    info!("shutdown complete");
    Ok(())
}

/// Serve `app` until `shutdown` flips to true.
async fn serve(listener: TcpListener, app: Router, mut shutdown: watch::Receiver<bool>) {
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await;
    if let Err(e) = result {
        error!(error = %e, "server error during shutdown");
    }
}

/// Wait for every server task, logging any that panicked.
async fn join_servers(servers: Vec<tokio::task::JoinHandle<()>>) {
    for server in servers {
        if let Err(e) = server.await {
            error!(error = %e, "server task panicked");
        }
    }
}

/// Pool health: 200 when any enabled worker is healthy, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.pool.health_report();
    let status_code = if report["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        report.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeGenerator, test_pool};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use upstream::{Kind, Outcome};
    use worker_pool::WorkerOptions;

    /// PrometheusHandle without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn test_app_state(pool: Arc<WorkerPool>) -> AppState {
        let generation = Arc::new(GenerationHandler::new(
            pool.clone(),
            Arc::new(FakeGenerator::default()),
            KindTimeouts {
                image: Duration::from_secs(5),
                video: Duration::from_secs(5),
            },
        ));
        AppState {
            pool,
            generation,
            prometheus: test_prometheus_handle(),
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_is_unhealthy_for_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_app_state(test_pool(dir.path()).await), 1000);

        let (status, json) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["workers_total"], 0);
    }

    #[tokio::test]
    async fn health_reports_degraded_when_some_workers_banned() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path()).await;
        let a = pool
            .add_worker("rt_alice".into(), WorkerOptions::default())
            .await
            .unwrap();
        pool.add_worker("rt_bob".into(), WorkerOptions::default())
            .await
            .unwrap();
        let app = build_router(test_app_state(pool.clone()), 1000);

        let (status, json) = get_json(app.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["workers_healthy"], 2);

        pool.record_outcome(a.id, Kind::Image, Outcome::RateLimited)
            .await
            .unwrap();
        let (status, json) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["workers_healthy"], 1);
        let workers = json["workers"].as_array().unwrap();
        assert_eq!(workers[0]["status"], "rate_limited");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_app_state(test_pool(dir.path()).await), 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn generate_route_is_mounted() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path()).await;
        pool.add_worker("rt_carol".into(), WorkerOptions::default())
            .await
            .unwrap();
        let app = build_router(test_app_state(pool), 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/generate/video")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"prompt":"waves"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["kind"], "video");
        assert_eq!(json["echo"]["prompt"], "waves");
    }

    #[tokio::test]
    async fn admin_routes_not_served_on_public_router() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_app_state(test_pool(dir.path()).await), 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/workers")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serve_drains_on_shutdown_signal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/ping", get(|| async { "pong" }));
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, app, rx));

        let body = reqwest::get(format!("http://{addr}/ping"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "pong");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server must stop after shutdown signal")
            .unwrap();
    }
}
