use std::collections::BTreeMap;

use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use tracing::{error, info};

use crate::{
    key::UnknownMetadataKey, router::AppState, MetadataError, MetadataFetcher, MetadataKey,
    RequestContext,
};

/// Failures of a single metadata request, each mapped to a fixed response.
#[derive(Debug, thiserror::Error)]
pub enum MetadataRequestError {
    #[error("invalid request path: {path}")]
    InvalidPath { path: String, prefix: String },
    #[error(transparent)]
    UnknownKey(#[from] UnknownMetadataKey),
    #[error("failed to fetch metadata: {0}")]
    Fetch(#[source] MetadataError),
    #[error(transparent)]
    Malformed(MetadataError),
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl IntoResponse for MetadataRequestError {
    fn into_response(self) -> Response {
        match self {
            MetadataRequestError::InvalidPath { prefix, .. } => (
                StatusCode::BAD_REQUEST,
                format!("Invalid request: expected /{prefix}/metadata/{{type}}"),
            )
                .into_response(),
            MetadataRequestError::UnknownKey(_) => {
                (StatusCode::BAD_REQUEST, "Unknown metadata type").into_response()
            }
            MetadataRequestError::Fetch(_) => {
                (StatusCode::BAD_GATEWAY, "Failed to fetch metadata").into_response()
            }
            MetadataRequestError::Malformed(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Unexpected format for instance-zone metadata",
            )
                .into_response(),
            MetadataRequestError::Encode(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode response").into_response()
            }
        }
    }
}

/// Splits `/<prefix>/metadata/<type>` (one trailing slash allowed) and
/// resolves the metadata type.
pub fn parse_metadata_path(prefix: &str, path: &str) -> Result<MetadataKey, MetadataRequestError> {
    let clean = path.strip_suffix('/').unwrap_or(path);
    let segments: Vec<&str> = clean.split('/').collect();
    if segments.len() != 4 {
        return Err(MetadataRequestError::InvalidPath {
            path: path.to_owned(),
            prefix: prefix.to_owned(),
        });
    }
    Ok(segments[3].parse::<MetadataKey>()?)
}

/// Resolves a metadata request path to the JSON body `{"<type>": "<value>"}`.
pub async fn fetch_metadata_json<F: MetadataFetcher>(
    fetcher: &F,
    ctx: &RequestContext,
    prefix: &str,
    path: &str,
) -> Result<Vec<u8>, MetadataRequestError> {
    let key = parse_metadata_path(prefix, path)?;
    let raw = fetcher
        .fetch(ctx, key.url())
        .await
        .map_err(MetadataRequestError::Fetch)?;
    let value = key.normalize(raw).map_err(MetadataRequestError::Malformed)?;

    let body = BTreeMap::from([(key.as_str(), value.as_str())]);
    Ok(serde_json::to_vec(&body)?)
}

/// Serves `GET /<prefix>/metadata/<type>`.
pub async fn metadata_handler<F: MetadataFetcher>(
    State(state): State<AppState<F>>,
    uri: Uri,
) -> Response {
    let path = uri.path();
    info!(path, "received metadata request");

    let ctx = RequestContext::background();
    match fetch_metadata_json(state.fetcher(), &ctx, state.prefix(), path).await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(path, error = %err, "metadata request failed");
            err.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{fetch_metadata_json, parse_metadata_path, MetadataRequestError};
    use crate::{MetadataError, MetadataFetcher, MetadataKey, RequestContext, Result};

    struct FixedFetcher(HashMap<&'static str, &'static str>);

    impl MetadataFetcher for FixedFetcher {
        async fn fetch(&self, _ctx: &RequestContext, url: &str) -> Result<String> {
            self.0
                .get(url)
                .map(|value| value.to_string())
                .ok_or_else(|| MetadataError::MalformedResponse(format!("unknown url {url}")))
        }
    }

    fn fetcher() -> FixedFetcher {
        FixedFetcher(HashMap::from([
            (MetadataKey::ClusterName.url(), "test-cluster-name"),
            (MetadataKey::ClusterLocation.url(), "test-cluster-location"),
            (
                MetadataKey::InstanceZone.url(),
                "projects/1234567890/zones/us-central1-a",
            ),
        ]))
    }

    #[test]
    fn trailing_slash_is_ignored() {
        let key = parse_metadata_path("x", "/x/metadata/cluster-name/").expect("valid path");
        assert_eq!(key, MetadataKey::ClusterName);
    }

    #[test]
    fn wrong_segment_count_is_rejected() {
        for path in ["/x/y", "/x/metadata/", "/x/metadata/cluster-name/extra"] {
            let err = parse_metadata_path("x", path).expect_err("must reject");
            assert!(matches!(err, MetadataRequestError::InvalidPath { .. }), "{path}");
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = parse_metadata_path("x", "/x/metadata/unknown").expect_err("must reject");
        assert!(matches!(err, MetadataRequestError::UnknownKey(_)));
    }

    #[tokio::test]
    async fn instance_zone_returns_last_segment() {
        let body = fetch_metadata_json(
            &fetcher(),
            &RequestContext::background(),
            "x",
            "/x/metadata/instance-zone",
        )
        .await
        .expect("must succeed");
        assert_eq!(body, br#"{"instance-zone":"us-central1-a"}"#);
    }

    #[tokio::test]
    async fn fetch_failure_is_reported_as_fetch_error() {
        let err = fetch_metadata_json(
            &FixedFetcher(HashMap::new()),
            &RequestContext::background(),
            "x",
            "/x/metadata/cluster-name",
        )
        .await
        .expect_err("must fail");
        assert!(matches!(err, MetadataRequestError::Fetch(_)));
    }
}
