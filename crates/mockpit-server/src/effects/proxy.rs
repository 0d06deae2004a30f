//! Catch-all proxy forwarding.
//!
//! Unmatched requests are forwarded to the environment's proxy host when
//! proxy mode is on. The upstream response is relayed as is, except for
//! hop-by-hop headers, `Set-Cookie` attributes that would not apply to the
//! mock host, and the configured response headers.

use super::transport::{HttpTransport, InboundResponse, OutboundBody, OutboundRequest};
use crate::environment::{Environment, Header};
use crate::error::EngineError;
use crate::template::RenderScope;
use bytes::Bytes;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Headers that only apply to a single connection.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

static COOKIE_SECURE: OnceLock<Regex> = OnceLock::new();
static COOKIE_DOMAIN: OnceLock<Regex> = OnceLock::new();

/// Upstream base URL when proxy mode is on and the host is a valid
/// `http`/`https` URL.
pub fn proxy_target(environment: &Environment) -> Option<reqwest::Url> {
    if !environment.proxy_mode || environment.proxy_host.trim().is_empty() {
        return None;
    }
    match reqwest::Url::parse(environment.proxy_host.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
        Ok(url) => {
            warn!("Ignoring proxy host with unsupported scheme '{}'", url.scheme());
            None
        }
        Err(e) => {
            warn!("Ignoring invalid proxy host '{}': {}", environment.proxy_host, e);
            None
        }
    }
}

/// Upstream URL for a request path, honoring `proxyRemovePrefix`.
pub fn upstream_url(environment: &Environment, target: &reqwest::Url, path: &str, raw_query: &str) -> String {
    let prefix = environment.endpoint_prefix.trim_matches('/');
    let mut forwarded = path.to_string();
    if environment.proxy_remove_prefix && !prefix.is_empty() {
        let with_slash = format!("/{prefix}");
        if let Some(rest) = path.strip_prefix(&with_slash) {
            if rest.is_empty() || rest.starts_with('/') {
                forwarded = if rest.is_empty() { "/".to_string() } else { rest.to_string() };
            }
        }
    }

    let base = target.as_str().trim_end_matches('/');
    if raw_query.is_empty() {
        format!("{base}{forwarded}")
    } else {
        format!("{base}{forwarded}?{raw_query}")
    }
}

fn is_forwardable_request_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name != "host" && name != "content-length" && !HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Render configured headers, skipping entries without a key.
pub fn render_headers(headers: &[Header], scope: &RenderScope<'_>) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|h| !h.key.trim().is_empty())
        .map(|h| (h.key.clone(), scope.render_or_raw(&h.value)))
        .collect()
}

/// Build the upstream request for an unmatched request.
pub fn build_request(
    environment: &Environment,
    target: &reqwest::Url,
    scope: &RenderScope<'_>,
    request_headers: &[(String, String)],
    body: Bytes,
) -> OutboundRequest {
    let request = scope.request();
    let url = upstream_url(environment, target, &request.raw_path, &request.raw_query);

    let mut headers: Vec<(String, String)> = request_headers
        .iter()
        .filter(|(name, _)| is_forwardable_request_header(name))
        .cloned()
        .collect();
    for (key, value) in render_headers(&environment.proxy_req_headers, scope) {
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case(&key));
        headers.push((key, value));
    }

    OutboundRequest {
        method: request.method.clone(),
        url,
        headers,
        body: if body.is_empty() {
            OutboundBody::Empty
        } else {
            OutboundBody::Bytes(body)
        },
    }
}

/// Drop `Secure` and `Domain` attributes so the cookie applies to the mock host.
pub fn rewrite_set_cookie(cookie: &str) -> String {
    let secure = COOKIE_SECURE.get_or_init(|| {
        Regex::new(r"(?i);\s*Secure\b").expect("cookie secure pattern is valid")
    });
    let domain = COOKIE_DOMAIN.get_or_init(|| {
        Regex::new(r"(?i);\s*Domain=[^;]*").expect("cookie domain pattern is valid")
    });
    let without_secure = secure.replace_all(cookie, "");
    domain.replace_all(&without_secure, "").to_string()
}

/// Headers relayed to the client for an upstream response.
pub fn relay_headers(
    upstream: &[(String, String)],
    environment: &Environment,
    scope: &RenderScope<'_>,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = upstream
        .iter()
        .filter(|(name, _)| {
            let name = name.to_ascii_lowercase();
            name != "content-length" && !HOP_BY_HOP_HEADERS.contains(&name.as_str())
        })
        .map(|(name, value)| {
            if name.eq_ignore_ascii_case("set-cookie") {
                (name.clone(), rewrite_set_cookie(value))
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect();
    for (key, value) in render_headers(&environment.proxy_res_headers, scope) {
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case(&key));
        headers.push((key, value));
    }
    headers
}

/// Send the upstream request. Failures become [`EngineError::UpstreamProxy`].
pub async fn forward(
    transport: &dyn HttpTransport,
    request: OutboundRequest,
) -> Result<InboundResponse, EngineError> {
    let target = request.url.clone();
    debug!("Proxying {} {}", request.method, target);
    transport.send(request).await.map_err(|e| {
        warn!("Upstream proxy request to {} failed: {:#}", target, e);
        EngineError::UpstreamProxy {
            target,
            reason: format!("{e:#}"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BucketStore;
    use crate::template::{HandlebarsRenderer, RequestContext};
    use async_trait::async_trait;
    use hyper::HeaderMap;

    fn environment() -> Environment {
        Environment {
            proxy_mode: true,
            proxy_host: "http://upstream.test:8080/".into(),
            endpoint_prefix: "api".into(),
            proxy_remove_prefix: true,
            proxy_req_headers: vec![
                Header::new("X-Forwarded-By", "mockpit {{request.method}}"),
                Header::new("", "ignored"),
            ],
            proxy_res_headers: vec![Header::new("X-Proxied", "true")],
            ..Default::default()
        }
    }

    fn request() -> RequestContext {
        RequestContext::from_parts("POST", "/api/users", Some("page=2"), &HeaderMap::new(), b"{}")
    }

    #[test]
    fn test_proxy_target_requires_mode_and_valid_url() {
        let mut env = environment();
        assert!(proxy_target(&env).is_some());
        env.proxy_host = "not a url".into();
        assert!(proxy_target(&env).is_none());
        env.proxy_host = "ftp://files.test".into();
        assert!(proxy_target(&env).is_none());
        env = environment();
        env.proxy_mode = false;
        assert!(proxy_target(&env).is_none());
    }

    #[test]
    fn test_upstream_url_removes_prefix() {
        let mut env = environment();
        let target = proxy_target(&env).unwrap();
        assert_eq!(
            upstream_url(&env, &target, "/api/users", "page=2"),
            "http://upstream.test:8080/users?page=2"
        );
        assert_eq!(
            upstream_url(&env, &target, "/apiary", ""),
            "http://upstream.test:8080/apiary"
        );
        env.proxy_remove_prefix = false;
        assert_eq!(
            upstream_url(&env, &target, "/api/users", ""),
            "http://upstream.test:8080/api/users"
        );
    }

    #[test]
    fn test_build_request_rewrites_headers() {
        let env = environment();
        let target = proxy_target(&env).unwrap();
        let renderer = HandlebarsRenderer::new();
        let buckets = BucketStore::default();
        let request = request();
        let scope = RenderScope::new(&renderer, &buckets, &request, 1);
        let incoming = vec![
            ("host".to_string(), "localhost:3000".to_string()),
            ("connection".to_string(), "keep-alive".to_string()),
            ("content-length".to_string(), "2".to_string()),
            ("accept".to_string(), "application/json".to_string()),
            ("x-forwarded-by".to_string(), "client".to_string()),
        ];

        let outbound = build_request(&env, &target, &scope, &incoming, Bytes::from_static(b"{}"));
        assert_eq!(outbound.method, "POST");
        assert_eq!(outbound.url, "http://upstream.test:8080/users?page=2");
        assert_eq!(
            outbound.headers,
            vec![
                ("accept".to_string(), "application/json".to_string()),
                ("X-Forwarded-By".to_string(), "mockpit POST".to_string()),
            ]
        );
        assert_eq!(outbound.body, OutboundBody::Bytes(Bytes::from_static(b"{}")));
    }

    #[test]
    fn test_build_request_keeps_path_escapes() {
        let env = environment();
        let target = proxy_target(&env).unwrap();
        let renderer = HandlebarsRenderer::new();
        let buckets = BucketStore::default();
        let request =
            RequestContext::from_parts("GET", "/api/files/a%3Fb%23c", Some("x=1"), &HeaderMap::new(), b"");
        let scope = RenderScope::new(&renderer, &buckets, &request, 1);

        let outbound = build_request(&env, &target, &scope, &[], Bytes::new());
        assert_eq!(outbound.url, "http://upstream.test:8080/files/a%3Fb%23c?x=1");
        assert_eq!(outbound.body, OutboundBody::Empty);
    }

    #[test]
    fn test_rewrite_set_cookie() {
        assert_eq!(
            rewrite_set_cookie("sid=1; Path=/; Domain=upstream.test; Secure; HttpOnly"),
            "sid=1; Path=/; HttpOnly"
        );
        assert_eq!(rewrite_set_cookie("sid=1"), "sid=1");
    }

    #[test]
    fn test_relay_headers() {
        let env = environment();
        let renderer = HandlebarsRenderer::new();
        let buckets = BucketStore::default();
        let request = request();
        let scope = RenderScope::new(&renderer, &buckets, &request, 1);
        let upstream = vec![
            ("transfer-encoding".to_string(), "chunked".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
            ("set-cookie".to_string(), "a=b; secure".to_string()),
        ];
        assert_eq!(
            relay_headers(&upstream, &env, &scope),
            vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("set-cookie".to_string(), "a=b".to_string()),
                ("X-Proxied".to_string(), "true".to_string()),
            ]
        );
    }

    struct FailingTransport;

    #[async_trait]
    impl HttpTransport for FailingTransport {
        async fn send(&self, _request: OutboundRequest) -> anyhow::Result<InboundResponse> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn test_forward_failure_maps_to_bad_gateway() {
        let request = OutboundRequest {
            method: "GET".into(),
            url: "http://upstream.test/x".into(),
            headers: Vec::new(),
            body: OutboundBody::Empty,
        };
        let err = forward(&FailingTransport, request).await.unwrap_err();
        assert_eq!(err.status(), hyper::StatusCode::BAD_GATEWAY);
        assert!(matches!(err, EngineError::UpstreamProxy { .. }));
    }
}
