//! Liveness and dependency health checks.
//!
//! `/health/basic` only proves the process answers. `/health` also probes the
//! metadata server and folds every check into one [`HealthStatus`].

use std::{collections::BTreeMap, fmt, time::Duration};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio::time::Instant;
use tracing::{error, info};

use crate::{
    key::CLUSTER_NAME_URL, router::AppState, ContextError, MetadataError, MetadataFetcher,
    RequestContext,
};

/// Upper bound for the metadata connectivity probe.
pub const METADATA_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Probes slower than this are reported as degraded.
pub const SLOW_PROBE_THRESHOLD: Duration = Duration::from_secs(1);

pub const METADATA_SERVICE_CHECK: &str = "metadata_service";
pub const HTTP_SERVER_CHECK: &str = "http_server";

/// Health of one check or of the whole service.
///
/// Ordered by severity so the overall status is the maximum of all checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Degraded still answers `200`; only unhealthy maps to `503`.
    pub fn http_status(self) -> StatusCode {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    pub last_checked: DateTime<Utc>,
}

impl HealthCheck {
    pub fn new(status: HealthStatus, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            status,
            message: Some(message.into()),
            duration,
            last_checked: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(serialize_with = "serialize_duration")]
    pub uptime: Duration,
    pub version: String,
    pub checks: BTreeMap<String, HealthCheck>,
}

fn serialize_duration<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&format_args!("{duration:?}"))
}

/// Reduces individual checks to one status: any unhealthy wins, then any
/// degraded, otherwise healthy. An empty set is healthy.
pub fn determine_overall_health(checks: &BTreeMap<String, HealthCheck>) -> HealthStatus {
    checks
        .values()
        .map(|check| check.status)
        .max()
        .unwrap_or(HealthStatus::Healthy)
}

/// Maps the outcome of a metadata probe to a status and message.
pub fn classify_probe(
    outcome: Result<(), &MetadataError>,
    deadline_exceeded: bool,
    duration: Duration,
) -> (HealthStatus, String) {
    match outcome {
        Err(_) if deadline_exceeded => (
            HealthStatus::Unhealthy,
            "Metadata service timeout".to_owned(),
        ),
        Err(err) => (
            HealthStatus::Degraded,
            format!("Metadata service error: {err}"),
        ),
        Ok(()) if duration > SLOW_PROBE_THRESHOLD => (
            HealthStatus::Degraded,
            "Metadata service responding slowly".to_owned(),
        ),
        Ok(()) => (
            HealthStatus::Healthy,
            "Metadata service is responsive".to_owned(),
        ),
    }
}

/// Fetches the cluster name under a [`METADATA_PROBE_TIMEOUT`] child context.
pub async fn check_metadata_service<F: MetadataFetcher>(
    ctx: &RequestContext,
    fetcher: &F,
) -> HealthCheck {
    let started = Instant::now();
    let probe_ctx = ctx.with_timeout(METADATA_PROBE_TIMEOUT);

    let outcome = tokio::select! {
        result = fetcher.fetch(&probe_ctx, CLUSTER_NAME_URL) => result.map(drop),
        err = probe_ctx.done() => Err(MetadataError::Cancelled(err)),
    };
    let duration = started.elapsed();
    let deadline_exceeded = probe_ctx.err() == Some(ContextError::DeadlineExceeded);

    let (status, message) = classify_probe(outcome.as_ref().map(|_| ()), deadline_exceeded, duration);
    HealthCheck::new(status, message, duration)
}

/// Runs every check and assembles the full report.
pub async fn build_health_response<F: MetadataFetcher>(
    ctx: &RequestContext,
    fetcher: &F,
    uptime: Duration,
) -> HealthResponse {
    let started = Instant::now();
    let timestamp = Utc::now();

    let mut checks = BTreeMap::new();
    checks.insert(
        METADATA_SERVICE_CHECK.to_owned(),
        check_metadata_service(ctx, fetcher).await,
    );
    // Reaching this line is the proof that the server is up.
    checks.insert(
        HTTP_SERVER_CHECK.to_owned(),
        HealthCheck::new(
            HealthStatus::Healthy,
            "HTTP server is responding",
            started.elapsed(),
        ),
    );

    HealthResponse {
        status: determine_overall_health(&checks),
        timestamp,
        uptime,
        version: env!("CARGO_PKG_VERSION").to_owned(),
        checks,
    }
}

/// Serves `/<prefix>/health` with the aggregated report.
pub async fn health_handler<F: MetadataFetcher>(State(state): State<AppState<F>>) -> Response {
    let started = Instant::now();
    let ctx = RequestContext::background();
    let report = build_health_response(&ctx, state.fetcher(), state.uptime()).await;

    // Encode before picking a status so a failure can still answer a clean 500.
    let body = match serde_json::to_vec(&report) {
        Ok(body) => body,
        Err(err) => {
            error!(error = %err, "error encoding health response");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode health response",
            )
                .into_response();
        }
    };

    info!(
        status = %report.status,
        elapsed = ?started.elapsed(),
        "health check completed"
    );
    (
        report.status.http_status(),
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// Serves `/<prefix>/health/basic`; never touches the metadata server.
pub async fn basic_health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "OK",
    )
}
