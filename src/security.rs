use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::Response,
};

const DEFAULT_CACHE_CONTROL: &str = "no-cache, no-store, must-revalidate, private";
const STRICT_CSP: &str = "default-src 'none'; frame-ancestors 'none'";
const RELAXED_CSP: &str = "default-src 'self'; frame-ancestors 'none'";

const CROSS_ORIGIN_EMBEDDER_POLICY: &str = "cross-origin-embedder-policy";
const CROSS_ORIGIN_OPENER_POLICY: &str = "cross-origin-opener-policy";
const CROSS_ORIGIN_RESOURCE_POLICY: &str = "cross-origin-resource-policy";
const PERMITTED_CROSS_DOMAIN_POLICIES: &str = "x-permitted-cross-domain-policies";

/// Security headers stamped onto every response of a route group.
///
/// Empty cross-origin policies are left out of the response entirely.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityHeaders {
    pub coep: String,
    pub coop: String,
    pub corp: String,
    pub strict_csp: bool,
    /// Overrides the default `Cache-Control` when set.
    pub cache_control: Option<String>,
    /// Value of the `Server` header.
    pub server: String,
}

impl SecurityHeaders {
    /// Most restrictive policies, for anything that is not a public API.
    pub fn strict(server: impl Into<String>) -> Self {
        Self {
            coep: "require-corp".to_owned(),
            coop: "same-origin".to_owned(),
            corp: "same-origin".to_owned(),
            strict_csp: true,
            cache_control: None,
            server: server.into(),
        }
    }

    /// Relaxed policies so the API can be called cross-origin.
    pub fn api(server: impl Into<String>) -> Self {
        Self {
            coep: String::new(),
            coop: "same-origin-allow-popups".to_owned(),
            corp: "cross-origin".to_owned(),
            strict_csp: false,
            cache_control: None,
            server: server.into(),
        }
    }

    pub fn custom(
        server: impl Into<String>,
        coep: impl Into<String>,
        coop: impl Into<String>,
        corp: impl Into<String>,
    ) -> Self {
        Self {
            coep: coep.into(),
            coop: coop.into(),
            corp: corp.into(),
            strict_csp: false,
            cache_control: None,
            server: server.into(),
        }
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
        headers.insert(header::X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block"));
        headers.insert(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        );
        headers.insert(
            HeaderName::from_static(PERMITTED_CROSS_DOMAIN_POLICIES),
            HeaderValue::from_static("none"),
        );
        insert_str(headers, header::SERVER, &self.server);

        let csp = if self.strict_csp { STRICT_CSP } else { RELAXED_CSP };
        headers.insert(header::CONTENT_SECURITY_POLICY, HeaderValue::from_static(csp));

        let cache_control = self.cache_control.as_deref().unwrap_or(DEFAULT_CACHE_CONTROL);
        insert_str(headers, header::CACHE_CONTROL, cache_control);
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(header::EXPIRES, HeaderValue::from_static("0"));

        insert_str(headers, HeaderName::from_static(CROSS_ORIGIN_EMBEDDER_POLICY), &self.coep);
        insert_str(headers, HeaderName::from_static(CROSS_ORIGIN_OPENER_POLICY), &self.coop);
        insert_str(headers, HeaderName::from_static(CROSS_ORIGIN_RESOURCE_POLICY), &self.corp);
    }
}

/// Skips empty values and values that are not valid header text.
fn insert_str(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if value.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Response mapper for `axum::middleware::map_response_with_state`.
pub async fn apply_security_headers(
    State(options): State<SecurityHeaders>,
    mut response: Response,
) -> Response {
    options.apply(response.headers_mut());
    response
}
