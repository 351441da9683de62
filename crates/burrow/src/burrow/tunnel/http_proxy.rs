use std::{sync::Arc, sync::LazyLock, time::Duration};

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use regex::{Captures, Regex};

use crate::burrow::tunnel::{
    pending::PendingError,
    protocol::{
        HOP_BY_HOP_REQUEST_HEADERS, HOP_BY_HOP_RESPONSE_HEADERS, HeaderList, RequestFrame,
        ResponseFrame, strip_headers,
    },
    registry::SessionRegistry,
    route::{RouteKey, Scheme, is_valid_segment},
};

static LINK_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(\s)(href|src|action)(\s*=\s*)(["'])(/[^"']*)"#).expect("valid link attribute regex")
});

/// Public HTTP request, already split from the transport.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    /// Full public path, route key included.
    pub path: String,
    pub query: String,
    pub headers: HeaderList,
    pub body: Bytes,
}

/// Turns public HTTP requests into request frames on the owning session and
/// the correlated response frames back into HTTP responses.
#[derive(Debug, Clone)]
pub struct HttpProxyEngine {
    registry: Arc<SessionRegistry>,
    request_timeout: Duration,
    max_body_bytes: usize,
}

impl HttpProxyEngine {
    pub fn new(registry: Arc<SessionRegistry>, request_timeout: Duration, max_body_bytes: usize) -> Self {
        Self {
            registry,
            request_timeout,
            max_body_bytes,
        }
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Splits a public path into the route key and the path forwarded to the
    /// local service.
    ///
    /// A registered `username/project` key made of the first two segments
    /// wins over the single-segment key.
    pub fn resolve_route(&self, path: &str) -> Option<(RouteKey, String)> {
        let trimmed = path.trim_start_matches('/');
        let mut segs = trimmed.splitn(3, '/');
        let first = segs.next().filter(|s| is_valid_segment(s))?;

        if let Some(second) = segs.next().filter(|s| is_valid_segment(s)) {
            if let Ok(scoped) = RouteKey::scoped(first, second) {
                if self.registry.get_registered(&scoped).is_some() {
                    let rest = segs.next().unwrap_or("");
                    return Some((scoped, format!("/{rest}")));
                }
            }
        }

        let key = RouteKey::project(first).ok()?;
        let rest = trimmed[first.len()..].trim_start_matches('/');
        Some((key, format!("/{rest}")))
    }

    /// Proxies one public request.
    pub async fn handle(&self, req: ProxyRequest) -> Response {
        let resp = self.dispatch(req).await;
        metrics::counter!("burrow_http_requests_total", "status" => resp.status().as_u16().to_string())
            .increment(1);
        resp
    }

    async fn dispatch(&self, req: ProxyRequest) -> Response {
        let Some((key, path)) = self.resolve_route(&req.path) else {
            return not_found();
        };
        let Some(session) = self.registry.get_registered(&key) else {
            return not_found();
        };
        let Some(reg) = session.registration() else {
            return not_found();
        };
        if reg.scheme == Scheme::Tcp {
            return (
                StatusCode::BAD_REQUEST,
                "tunnel is a tcp route; connect to its tcp port instead",
            )
                .into_response();
        }
        if req.body.len() > self.max_body_bytes {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }

        let frame = RequestFrame {
            id: 0,
            method: req.method,
            path,
            headers: strip_headers(req.headers, HOP_BY_HOP_REQUEST_HEADERS),
            query: req.query,
            body: req.body,
        };

        match session.request(frame, self.request_timeout).await {
            Ok(resp) => render(resp, &key),
            Err(PendingError::TimedOut) => {
                tracing::warn!(route=%key, timeout=%humantime::format_duration(self.request_timeout), "proxy: tunnel response timed out");
                (StatusCode::GATEWAY_TIMEOUT, "tunnel response timed out").into_response()
            }
            Err(PendingError::ConnectionLost) => {
                tracing::warn!(route=%key, "proxy: tunnel connection lost");
                (StatusCode::BAD_GATEWAY, "tunnel connection lost").into_response()
            }
        }
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "tunnel not found").into_response()
}

fn render(resp: ResponseFrame, key: &RouteKey) -> Response {
    let is_html = resp
        .header("content-type")
        .is_some_and(|v| v.to_ascii_lowercase().contains("text/html"));

    let mut headers = strip_headers(resp.headers, HOP_BY_HOP_RESPONSE_HEADERS);
    let body = if is_html {
        match std::str::from_utf8(&resp.body) {
            Ok(html) => {
                headers = strip_headers(headers, &["content-length"]);
                Bytes::from(rewrite_html_links(html, key))
            }
            Err(_) => resp.body,
        }
    } else {
        resp.body
    };

    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = Response::new(Body::from(body));
    *out.status_mut() = status;
    let map = out.headers_mut();
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) else {
            continue;
        };
        map.append(name, value);
    }
    out
}

/// Prefixes root-relative `href`/`src`/`action` values with `/{key}` so pages
/// served under the tunnel path keep resolving their own assets.
pub fn rewrite_html_links(html: &str, key: &RouteKey) -> String {
    LINK_ATTR_RE
        .replace_all(html, |caps: &Captures| {
            let url = &caps[5];
            if url.starts_with("//") {
                return caps[0].to_string();
            }
            format!("{}{}{}{}/{key}{url}", &caps[1], &caps[2], &caps[3], &caps[4])
        })
        .into_owned()
}
