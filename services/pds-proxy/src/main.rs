//! PDS proxy
//!
//! Single-binary service that:
//! 1. Loads DPoP-bound OAuth sessions from a JSON session file
//! 2. Listens for incoming requests naming a subject in a header
//! 3. Performs each request against that subject's resource server with a
//!    fresh DPoP proof, refreshing tokens and rotating nonces as needed
//! 4. Returns the resource server response verbatim
//!
//! `pds-proxy generate-key [--kid <id>]` prints a new private P-256 JWK,
//! usable as a session key or as the client's `private_key_jwt` key.

mod config;
mod metrics;
mod proxy;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::HeaderName;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use dpop_auth::{ClientAuth, DpopKey, FileSessionStore, RefreshClient, SessionStore};
use dpop_client::DpopClient;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::proxy::ProxyState;

/// Upper bound on waiting for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    sessions: Arc<FileSessionStore>,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

impl AppState {
    fn new(
        client: Arc<DpopClient>,
        sessions: Arc<FileSessionStore>,
        subject_header: HeaderName,
        prometheus: PrometheusHandle,
    ) -> Self {
        Self {
            proxy: ProxyState {
                client,
                subject_header,
                requests_total: Arc::new(AtomicU64::new(0)),
                errors_total: Arc::new(AtomicU64::new(0)),
                in_flight: Arc::new(AtomicU64::new(0)),
            },
            sessions,
            started_at: Instant::now(),
            prometheus,
        }
    }
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` caps concurrently processed requests; excess requests
/// queue rather than fail.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Value following `flag` in the argument list.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

fn generate_key(kid: Option<&str>) -> DpopKey {
    let key = DpopKey::generate();
    match kid {
        Some(kid) => key.with_kid(kid),
        None => key,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs; LOG_LEVEL wins over RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("generate-key") {
        let key = generate_key(flag_value(&args, "--kid"));
        info!(thumbprint = %key.thumbprint(), "generated P-256 key");
        println!("{}", key.to_private_jwk().expose());
        return Ok(());
    }

    info!("starting pds-proxy");

    // Install before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    let config_path = Config::resolve_path(flag_value(&args, "--config"));
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let client_auth = config
        .oauth
        .client_auth()
        .context("failed to load client key")?;
    let auth_method = match &client_auth {
        ClientAuth::Public { .. } => "none",
        ClientAuth::PrivateKeyJwt { .. } => "private_key_jwt",
    };

    info!(
        listen_addr = %config.server.listen_addr,
        sessions_path = %config.oauth.sessions_path.display(),
        client_id = %config.oauth.client_id,
        auth_method,
        subject_header = %config.server.subject_header,
        "configuration loaded"
    );
    if config.oauth.allow_insecure_urls {
        warn!("allow_insecure_urls is set; authorization server URLs are not restricted");
    }

    let sessions = Arc::new(
        FileSessionStore::load(config.oauth.sessions_path.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to load sessions from {}",
                    config.oauth.sessions_path.display()
                )
            })?,
    );

    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build HTTP client")?;

    let refresher = RefreshClient::new(http.clone(), client_auth, config.oauth.timeout())
        .allow_insecure_urls(config.oauth.allow_insecure_urls);
    let store: Arc<dyn SessionStore> = sessions.clone();
    let client = Arc::new(DpopClient::new(
        http,
        store,
        refresher,
        config.oauth.timeout(),
    ));

    let subject_header = HeaderName::from_bytes(config.server.subject_header.as_bytes())
        .context("invalid subject_header")?;

    let app_state = AppState::new(client, sessions, subject_header, prometheus_handle);
    let in_flight = app_state.proxy.in_flight.clone();
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: status, stored session count, uptime, request counters.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "healthy",
        "sessions": state.sessions.len().await,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "requests_served": state.proxy.requests_total.load(Ordering::Relaxed),
        "errors_total": state.proxy.errors_total.load(Ordering::Relaxed),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler forwarding everything else to the subject's PDS.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
