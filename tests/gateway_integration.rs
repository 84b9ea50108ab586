use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use metadata_gateway::{
    gateway_router, observability::init_test_tracing, GatewayConfig, MetadataError,
    MetadataFetcher, MetadataKey, RequestContext, Result,
};
use serde_json::Value as JsonValue;

/// Stand-in for the metadata server with a configurable latency.
#[derive(Clone)]
struct FakeMetadata {
    delay: Duration,
    reachable: bool,
    calls: Arc<AtomicUsize>,
}

impl FakeMetadata {
    fn healthy() -> Self {
        Self {
            delay: Duration::ZERO,
            reachable: true,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::healthy()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::healthy()
        }
    }
}

impl MetadataFetcher for FakeMetadata {
    async fn fetch(&self, _ctx: &RequestContext, url: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if !self.reachable {
            return Err(MetadataError::MalformedResponse("connection refused".to_owned()));
        }

        let value = if url == MetadataKey::ClusterName.url() {
            "test-cluster-name"
        } else if url == MetadataKey::ClusterLocation.url() {
            "test-cluster-location"
        } else if url == MetadataKey::InstanceZone.url() {
            "projects/1234567890/zones/us-central1-a"
        } else {
            return Err(MetadataError::MalformedResponse(format!("unknown url {url}")));
        };
        Ok(value.to_owned())
    }
}

struct TestGateway {
    base_url: String,
    http: reqwest::Client,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestGateway {
    async fn get(&self, path: &str) -> reqwest::Response {
        self.http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .expect("gateway must answer")
    }
}

async fn spawn_gateway(fetcher: FakeMetadata) -> TestGateway {
    spawn_gateway_with(fetcher, &[]).await
}

async fn spawn_gateway_with(fetcher: FakeMetadata, vars: &[(&str, &str)]) -> TestGateway {
    init_test_tracing();

    let config = GatewayConfig::from_lookup(|key| match key {
        "SERVICE_PREFIX" => Some("x".to_owned()),
        _ => vars
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| (*value).to_owned()),
    });
    let app = gateway_router(fetcher, &config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("gateway must run");
    });

    TestGateway {
        base_url: format!("http://{address}"),
        http: reqwest::Client::new(),
        task,
    }
}

#[tokio::test]
async fn serves_every_metadata_key() {
    let gateway = spawn_gateway(FakeMetadata::healthy()).await;

    let cases = [
        ("/x/metadata/cluster-name", r#"{"cluster-name":"test-cluster-name"}"#),
        (
            "/x/metadata/cluster-location",
            r#"{"cluster-location":"test-cluster-location"}"#,
        ),
        ("/x/metadata/instance-zone", r#"{"instance-zone":"us-central1-a"}"#),
        ("/x/metadata/instance-zone/", r#"{"instance-zone":"us-central1-a"}"#),
    ];

    for (path, expected) in cases {
        let response = gateway.get(path).await;
        assert_eq!(response.status(), 200, "{path}");
        assert_eq!(response.headers()["content-type"], "application/json");
        let body: JsonValue = response.json().await.expect("json body");
        let expected: JsonValue = serde_json::from_str(expected).expect("valid json");
        assert_eq!(body, expected, "{path}");
    }
}

#[tokio::test]
async fn unknown_metadata_type_is_bad_request() {
    let gateway = spawn_gateway(FakeMetadata::healthy()).await;

    let response = gateway.get("/x/metadata/unknown").await;
    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.expect("body"), "Unknown metadata type");
}

#[tokio::test]
async fn wrong_segment_count_is_bad_request() {
    let gateway = spawn_gateway(FakeMetadata::healthy()).await;

    for path in ["/x/metadata/", "/x/metadata/cluster-name/extra"] {
        let response = gateway.get(path).await;
        assert_eq!(response.status(), 400, "{path}");
        assert_eq!(
            response.text().await.expect("body"),
            "Invalid request: expected /x/metadata/{type}"
        );
    }
}

#[tokio::test]
async fn upstream_failure_is_bad_gateway_without_details() {
    let gateway = spawn_gateway(FakeMetadata::unreachable()).await;

    let response = gateway.get("/x/metadata/cluster-name").await;
    assert_eq!(response.status(), 502);
    let body = response.text().await.expect("body");
    assert_eq!(body, "Failed to fetch metadata");
    assert!(!body.contains("connection refused"));
}

#[tokio::test]
async fn unknown_paths_are_not_found_with_strict_headers() {
    let gateway = spawn_gateway(FakeMetadata::healthy()).await;

    for path in ["/", "/x/metadata", "/x/health/", "/elsewhere/metadata/cluster-name"] {
        let response = gateway.get(path).await;
        assert_eq!(response.status(), 404, "{path}");
        assert_eq!(response.headers()["cross-origin-embedder-policy"], "require-corp");
        assert_eq!(response.headers()["cross-origin-resource-policy"], "same-origin");
        assert_eq!(response.text().await.expect("body"), "Not Found");
    }
}

#[tokio::test]
async fn api_routes_carry_api_security_headers() {
    let gateway = spawn_gateway(FakeMetadata::healthy()).await;

    let response = gateway.get("/x/metadata/cluster-name").await;
    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["server"], "x");
    assert_eq!(headers["cross-origin-resource-policy"], "cross-origin");
    assert_eq!(headers["cross-origin-opener-policy"], "same-origin-allow-popups");
    assert!(!headers.contains_key("cross-origin-embedder-policy"));
}

#[tokio::test]
async fn unsupported_methods_are_rejected() {
    let fetcher = FakeMetadata::healthy();
    let calls = Arc::clone(&fetcher.calls);
    let gateway = spawn_gateway(fetcher).await;

    let response = gateway
        .http
        .post(format!("{}/x/metadata/cluster-name", gateway.base_url))
        .send()
        .await
        .expect("gateway must answer");
    assert_eq!(response.status(), 405);
    assert_eq!(response.headers()["allow"], "GET");
    assert_eq!(response.headers()["x-frame-options"], "DENY");

    let response = gateway
        .http
        .delete(format!("{}/x/health", gateway.base_url))
        .send()
        .await
        .expect("gateway must answer");
    assert_eq!(response.status(), 405);
    assert_eq!(response.headers()["allow"], "GET, HEAD");

    for path in ["/x/metadata/cluster-name", "/x/metadata/"] {
        let response = gateway
            .http
            .head(format!("{}{path}", gateway.base_url))
            .send()
            .await
            .expect("gateway must answer");
        assert_eq!(response.status(), 405, "{path}");
        assert_eq!(response.headers()["allow"], "GET");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn basic_health_ignores_metadata_dependency() {
    let fetcher = FakeMetadata::unreachable();
    let calls = Arc::clone(&fetcher.calls);
    let gateway = spawn_gateway(fetcher).await;

    let response = gateway.get("/x/health/basic").await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; charset=utf-8"
    );
    assert_eq!(response.text().await.expect("body"), "OK");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn health_is_ok_when_metadata_responds() {
    let gateway = spawn_gateway(FakeMetadata::healthy()).await;

    let response = gateway.get("/x/health").await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "application/json");

    let body: JsonValue = response.json().await.expect("json body");
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert!(body["uptime"].is_string());
    assert!(body["timestamp"].is_string());
    assert_eq!(body["checks"]["metadata_service"]["status"], "healthy");
    assert_eq!(body["checks"]["http_server"]["status"], "healthy");
    assert_eq!(
        body["checks"]["http_server"]["message"],
        "HTTP server is responding"
    );
}

#[tokio::test]
async fn health_is_degraded_but_ok_when_metadata_errors() {
    let gateway = spawn_gateway(FakeMetadata::unreachable()).await;

    let response = gateway.get("/x/health").await;
    assert_eq!(response.status(), 200);

    let body: JsonValue = response.json().await.expect("json body");
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["checks"]["metadata_service"]["status"], "degraded");
}

#[tokio::test]
async fn health_is_degraded_but_ok_when_metadata_is_slow() {
    let gateway = spawn_gateway(FakeMetadata::slow(Duration::from_millis(1_200))).await;

    let response = gateway.get("/x/health").await;
    assert_eq!(response.status(), 200);

    let body: JsonValue = response.json().await.expect("json body");
    assert_eq!(body["status"], "degraded");
    assert_eq!(
        body["checks"]["metadata_service"]["message"],
        "Metadata service responding slowly"
    );
}

#[tokio::test]
async fn health_is_unavailable_when_probe_times_out() {
    let gateway = spawn_gateway(FakeMetadata::slow(Duration::from_secs(10))).await;

    let started = std::time::Instant::now();
    let response = gateway.get("/x/health").await;
    assert_eq!(response.status(), 503);
    assert!(started.elapsed() < Duration::from_secs(5));

    let body: JsonValue = response.json().await.expect("json body");
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(
        body["checks"]["metadata_service"]["message"],
        "Metadata service timeout"
    );
    assert_eq!(body["checks"]["http_server"]["status"], "healthy");
}

#[tokio::test]
async fn slow_responses_hit_the_write_timeout() {
    let gateway = spawn_gateway_with(
        FakeMetadata::slow(Duration::from_secs(5)),
        &[("SERVER_WRITE_TIMEOUT", "200ms")],
    )
    .await;

    let started = std::time::Instant::now();
    let response = gateway.get("/x/metadata/cluster-name").await;
    assert_eq!(response.status(), 408);
    assert_eq!(response.headers()["x-frame-options"], "DENY");
    assert!(started.elapsed() < Duration::from_secs(2));
}
