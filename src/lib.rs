//! jwks-bearer authenticates an OAuth 2.0 client with a self-signed JWT
//! (RFC 7523) and publishes the matching public key as a JWKS.

#![forbid(unsafe_code)]
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod telemetry;
pub mod token;
mod well_known;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use axum::http::{StatusCode, Uri};
use axum::routing::get;
use axum::{Router, middleware as AxumMiddleware};
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

use client::{TokenClient, TokenResult};
use config::{ClientConfig, ServerConfig};
use crypto::KeyPair;
use error::{ResponseError, Result};

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: axum::http::Method,
    path: &str,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    app.oneshot(
        Request::builder()
            .method(method)
            .uri(path)
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await
    .unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub key: Arc<KeyPair>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Create a new [`AppState`] without metrics.
    pub fn new(key: KeyPair) -> Self {
        Self {
            key: Arc::new(key),
            metrics: None,
        }
    }
}

impl FromRef<AppState> for Arc<KeyPair> {
    fn from_ref(state: &AppState) -> Arc<KeyPair> {
        Arc::clone(&state.key)
    }
}

/// Problem body for unknown routes.
pub fn not_found(path: &str) -> ResponseError {
    ResponseError::default()
        .title("Not found.")
        .status(StatusCode::NOT_FOUND)
        .instance(path)
}

async fn fallback(uri: Uri) -> ResponseError {
    not_found(uri.path())
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Log every request with its latency.
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(
                    DefaultOnResponse::new()
                        .level(tracing::Level::INFO)
                        .latency_unit(LatencyUnit::Micros),
                ),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(10),
        ));

    Router::new()
        // `GET /metrics` goes to `metrics`.
        .route("/metrics", get(telemetry::metrics))
        .fallback(fallback)
        .with_state(state.clone())
        .nest("/.well-known", well_known::well_known(state))
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Load the key and exchange one signed assertion for an access token.
pub async fn request_token(config: &ClientConfig) -> Result<TokenResult> {
    tracing::info!(
        auth_host = %config.auth_host,
        realm = %config.realm,
        client_id = %config.client_id,
        self_hosted = config.self_hosted,
        "requesting access token"
    );

    let key = KeyPair::load(&config.key_path)?;
    let endpoint = config.token_endpoint()?;

    TokenClient::new(config.timeout)?
        .exchange(&key, &endpoint, &config.client_id, config.self_hosted)
        .await
}

/// Load the key and serve its JWKS until Ctrl-C.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let key = KeyPair::load(&config.key_path)?;
    let metrics = if config.metrics {
        Some(telemetry::setup_metrics_recorder().map_err(|err| {
            error::Error::Configuration {
                message: format!("cannot install metrics recorder: {err}"),
            }
        })?)
    } else {
        None
    };

    tracing::warn!(
        "this server is for demo purposes only, do not use as is in production"
    );
    tracing::info!(kid = %key.kid(), "serving public key");

    let state = AppState {
        key: Arc::new(key),
        metrics,
    };
    let listener = tokio::net::TcpListener::bind(config.address).await?;
    tracing::info!(address = %config.address, "server started");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "cannot listen for shutdown signal");
    }
    tracing::info!("shutting down");
}
