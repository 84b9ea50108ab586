//! Tracing setup and per-request access logging.

use std::{
    collections::BTreeMap,
    io,
    net::SocketAddr,
    sync::Once,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use http_body::Body as _;
use tracing::{error, info, level_filters::LevelFilter, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Requests slower than this are logged at warn level.
pub const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(1);

const USER_AGENT_MAX_LEN: usize = 100;
const REDACTED: &str = "<redacted>";
const ALLOWED_QUERY_KEYS: [&str; 2] = ["page", "limit"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `metadata_gateway=debug`.
    pub level: String,
    /// Strip query values, IP addresses and long user agents from access logs.
    pub pii_redaction: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            pii_redaction: false,
        }
    }
}

impl LogConfig {
    /// Installs the global JSON subscriber on stdout. Call once at startup.
    pub fn init_tracing_subscriber(&self) -> anyhow::Result<()> {
        let filter = EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stdout))
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
    }
}

/// Initialize tracing for tests; safe to call from many tests.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy();

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Request fields as they will appear in the access log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientInfo {
    pub query: String,
    pub client_ip: String,
    pub user_agent: String,
}

impl ClientInfo {
    pub fn from_request(
        query: Option<&str>,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        redact: bool,
    ) -> Self {
        let query = query.unwrap_or_default();
        let client_ip = client_ip(headers, peer);
        let user_agent = header_str(headers, "user-agent").unwrap_or_default();

        if !redact {
            return Self {
                query: query.to_owned(),
                client_ip,
                user_agent: user_agent.to_owned(),
            };
        }

        Self {
            query: redact_query(query),
            client_ip: redact_ip(&client_ip),
            user_agent: redact_user_agent(user_agent),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        return forwarded.split(',').next().unwrap_or_default().trim().to_owned();
    }
    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        return real_ip.trim().to_owned();
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

/// Propagated request id, or a fresh `req_<nanos>` one.
pub fn request_id(headers: &HeaderMap) -> String {
    ["x-request-id", "x-correlation-id", "x-trace-id"]
        .into_iter()
        .find_map(|name| header_str(headers, name))
        .map(str::to_owned)
        .unwrap_or_else(|| {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            format!("req_{nanos}")
        })
}

/// Keeps `page` and `limit` values; every other value becomes `<redacted>`.
pub fn redact_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    if !is_well_formed_query(query) {
        return "<invalid_query>".to_owned();
    }

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let values = params.entry(key.to_string()).or_default();
        if ALLOWED_QUERY_KEYS.contains(&key.as_ref()) {
            values.push(value.into_owned());
        } else if values.is_empty() {
            values.push(REDACTED.to_owned());
        }
    }

    let pairs = params
        .iter()
        .flat_map(|(key, values)| values.iter().map(move |value| (key, value)));
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Rejects `;` separators and broken percent escapes.
fn is_well_formed_query(query: &str) -> bool {
    if query.contains(';') {
        return false;
    }
    let bytes = query.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let escape = bytes.get(i + 1..i + 3);
            if !escape.is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit)) {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    true
}

/// IPv4 keeps only its first octet; anything else is fully redacted.
pub fn redact_ip(ip: &str) -> String {
    if ip.contains('.') && !ip.contains(':') {
        let octets: Vec<&str> = ip.split('.').collect();
        if octets.len() == 4 {
            return format!("{}.0.0.0", octets[0]);
        }
    }
    "redacted".to_owned()
}

pub fn redact_user_agent(user_agent: &str) -> String {
    if user_agent.is_empty() {
        return REDACTED.to_owned();
    }
    user_agent.chars().take(USER_AGENT_MAX_LEN).collect()
}

pub fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        200..=299 => "success",
        300..=399 => "redirect",
        400..=499 => "client_error",
        500.. => "server_error",
        _ => "unknown",
    }
}

/// Server errors log at error, client errors and slow requests at warn.
pub fn log_level(status: StatusCode, elapsed: Duration) -> Level {
    if status.is_server_error() {
        Level::ERROR
    } else if status.is_client_error() || elapsed > SLOW_REQUEST_THRESHOLD {
        Level::WARN
    } else {
        Level::INFO
    }
}

/// Access-log middleware for `axum::middleware::from_fn_with_state`.
pub async fn log_requests(
    State(config): State<LogConfig>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let client = ClientInfo::from_request(
        request.uri().query(),
        request.headers(),
        peer,
        config.pii_redaction,
    );
    let request_id = request_id(request.headers());

    info!(
        kind = "request_start",
        %method,
        path = %path,
        query = %client.query,
        client_ip = %client.client_ip,
        user_agent = %client.user_agent,
        request_id = %request_id,
        "HTTP request started"
    );

    let response = next.run(request).await;

    let elapsed = started.elapsed();
    let status = response.status();
    let response_size = response.body().size_hint().exact().unwrap_or_default();
    let duration_ms = elapsed.as_secs_f64() * 1_000.0;

    macro_rules! complete {
        ($log:ident) => {
            $log!(
                kind = "request_complete",
                %method,
                path = %path,
                query = %client.query,
                status = status.as_u16(),
                status_class = status_class(status),
                duration_ms,
                response_size,
                client_ip = %client.client_ip,
                user_agent = %client.user_agent,
                request_id = %request_id,
                "HTTP {} {} - {} - {:?} - {}",
                method,
                path,
                status.as_u16(),
                elapsed,
                client.client_ip
            )
        };
    }

    let level = log_level(status, elapsed);
    if level == Level::ERROR {
        complete!(error);
    } else if level == Level::WARN {
        complete!(warn);
    } else {
        complete!(info);
    }

    response
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use axum::http::{HeaderMap, HeaderValue, StatusCode};
    use tracing::Level;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let peer: SocketAddr = "192.168.1.9:5555".parse().expect("valid addr");
        let map = headers(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(client_ip(&map, Some(peer)), "203.0.113.7");

        let map = headers(&[("x-real-ip", " 198.51.100.2 ")]);
        assert_eq!(client_ip(&map, Some(peer)), "198.51.100.2");

        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), "192.168.1.9");

        let v6: SocketAddr = "[::1]:8080".parse().expect("valid addr");
        assert_eq!(client_ip(&HeaderMap::new(), Some(v6)), "::1");
    }

    #[test]
    fn request_id_uses_headers_in_order() {
        let map = headers(&[("x-trace-id", "trace"), ("x-correlation-id", "corr")]);
        assert_eq!(request_id(&map), "corr");
        assert!(request_id(&HeaderMap::new()).starts_with("req_"));
    }

    #[test]
    fn redaction_keeps_only_allowlisted_query_values() {
        assert_eq!(
            redact_query("page=2&email=a%40b.c&limit=10"),
            "email=%3Credacted%3E&limit=10&page=2"
        );
        assert_eq!(redact_query("q=a&q=b&page=1&page=2"), "page=1&page=2&q=%3Credacted%3E");
        assert_eq!(redact_query("a=%zz"), "<invalid_query>");
        assert_eq!(redact_query("a=1;b=2"), "<invalid_query>");
        assert_eq!(redact_query(""), "");
    }

    #[test]
    fn redaction_masks_ip_addresses() {
        assert_eq!(redact_ip("203.0.113.7"), "203.0.0.0");
        assert_eq!(redact_ip("2001:db8::1"), "redacted");
        assert_eq!(redact_ip("not-an-ip"), "redacted");
    }

    #[test]
    fn redaction_truncates_user_agent() {
        let long = "a".repeat(150);
        assert_eq!(redact_user_agent(&long).len(), 100);
        assert_eq!(redact_user_agent(""), "<redacted>");
        assert_eq!(redact_user_agent("curl/8.0"), "curl/8.0");
    }

    #[test]
    fn redaction_disabled_passes_fields_through() {
        let map = headers(&[("user-agent", "curl/8.0"), ("x-real-ip", "203.0.113.7")]);
        let info = ClientInfo::from_request(Some("token=abc"), &map, None, false);
        assert_eq!(info.query, "token=abc");
        assert_eq!(info.client_ip, "203.0.113.7");
        assert_eq!(info.user_agent, "curl/8.0");

        let info = ClientInfo::from_request(Some("token=abc"), &map, None, true);
        assert_eq!(info.query, "token=%3Credacted%3E");
        assert_eq!(info.client_ip, "203.0.0.0");
    }

    #[test]
    fn status_classes() {
        assert_eq!(status_class(StatusCode::OK), "success");
        assert_eq!(status_class(StatusCode::MOVED_PERMANENTLY), "redirect");
        assert_eq!(status_class(StatusCode::NOT_FOUND), "client_error");
        assert_eq!(status_class(StatusCode::BAD_GATEWAY), "server_error");
        assert_eq!(status_class(StatusCode::CONTINUE), "unknown");
    }

    #[test]
    fn log_level_by_status_and_latency() {
        let fast = Duration::from_millis(5);
        assert_eq!(log_level(StatusCode::OK, fast), Level::INFO);
        assert_eq!(log_level(StatusCode::OK, Duration::from_secs(2)), Level::WARN);
        assert_eq!(log_level(StatusCode::BAD_REQUEST, fast), Level::WARN);
        assert_eq!(log_level(StatusCode::SERVICE_UNAVAILABLE, fast), Level::ERROR);
    }

    #[test]
    fn init_test_tracing_idempotent() {
        init_test_tracing();
        init_test_tracing();
    }
}
