use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::timeout::TimeoutLayer;

use crate::{
    handler::metadata_handler,
    health::{basic_health_handler, health_handler},
    observability::log_requests,
    security::apply_security_headers,
    GatewayConfig, MetadataFetcher, SecurityHeaders,
};

/// Shared, read-only state handed to every handler.
pub struct AppState<F> {
    fetcher: Arc<F>,
    prefix: Arc<str>,
    started_at: Instant,
    fallback_headers: Arc<SecurityHeaders>,
}

// Manual impl: `F` itself does not need to be `Clone`.
impl<F> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            fetcher: Arc::clone(&self.fetcher),
            prefix: Arc::clone(&self.prefix),
            started_at: self.started_at,
            fallback_headers: Arc::clone(&self.fallback_headers),
        }
    }
}

impl<F: MetadataFetcher> AppState<F> {
    pub fn new(fetcher: F, prefix: &str, fallback_headers: SecurityHeaders) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            prefix: Arc::from(prefix),
            started_at: Instant::now(),
            fallback_headers: Arc::new(fallback_headers),
        }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Time since the state was built, i.e. since the server started.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Builds the full gateway router around `fetcher`.
///
/// Metadata and health routes carry the API security headers and answer
/// `408` once `write_timeout` passes. The 404 fallback carries the default
/// headers, and every request is access-logged.
pub fn gateway_router<F: MetadataFetcher>(fetcher: F, config: &GatewayConfig) -> Router {
    let prefix = config.server.prefix.as_str();
    let state = AppState::new(fetcher, prefix, config.security.default_headers(prefix));
    let api_headers = config.security.api_headers(prefix);

    Router::new()
        .route(
            &format!("/{prefix}/metadata/"),
            get(metadata_handler::<F>)
                .head(|| async { method_not_allowed("GET") })
                .fallback(|| async { method_not_allowed("GET") }),
        )
        .route(
            &format!("/{prefix}/metadata/*rest"),
            get(metadata_handler::<F>)
                .head(|| async { method_not_allowed("GET") })
                .fallback(|| async { method_not_allowed("GET") }),
        )
        .route(
            &format!("/{prefix}/health"),
            get(health_handler::<F>).fallback(|| async { method_not_allowed("GET, HEAD") }),
        )
        .route(
            &format!("/{prefix}/health/basic"),
            get(basic_health_handler).fallback(|| async { method_not_allowed("GET, HEAD") }),
        )
        .route_layer(TimeoutLayer::new(config.server.write_timeout))
        .route_layer(middleware::map_response_with_state(
            api_headers,
            apply_security_headers,
        ))
        .fallback(not_found::<F>)
        .with_state(state)
        .layer(middleware::from_fn_with_state(
            config.logging.clone(),
            log_requests,
        ))
}

fn method_not_allowed(allow: &'static str) -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, allow)],
        "Method Not Allowed",
    )
        .into_response()
}

async fn not_found<F: MetadataFetcher>(State(state): State<AppState<F>>) -> Response {
    let mut response = (StatusCode::NOT_FOUND, "Not Found").into_response();
    state.fallback_headers.apply(response.headers_mut());
    response
}
