use std::time::Duration;

use bytes::BytesMut;
use reqwest::{
    Method,
    header::{HeaderMap, HeaderName, HeaderValue},
};

use crate::burrow::{
    net::LocalTarget,
    tunnel::{
        protocol::{HOP_BY_HOP_REQUEST_HEADERS, HeaderList, RequestFrame, ResponseFrame, strip_headers},
        route::Scheme,
    },
};

/// Not forwarded to the local service: response bodies must stay identity-encoded
/// so the relay can rewrite HTML.
const LOCAL_DROPPED_HEADERS: &[&str] = &["accept-encoding"];

/// Replays forwarded requests against the local service.
#[derive(Debug, Clone)]
pub struct LocalForwarder {
    client: reqwest::Client,
    base: String,
    max_body_bytes: usize,
}

impl LocalForwarder {
    /// `max_body_bytes` caps buffered response bodies; larger responses become a 502
    /// instead of a frame the relay would refuse.
    pub fn new(
        scheme: Scheme,
        target: &LocalTarget,
        timeout: Duration,
        max_body_bytes: usize,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base: format!("{scheme}://{target}"),
            max_body_bytes,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Always produces a response; failures become a 502 carrying the error text.
    pub async fn forward(&self, req: RequestFrame) -> ResponseFrame {
        let id = req.id;
        match self.try_forward(req).await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::debug!(id, base=%self.base, err=%err, "agent: local request failed");
                ResponseFrame::bad_gateway(id, format!("{err:#}"))
            }
        }
    }

    async fn try_forward(&self, req: RequestFrame) -> anyhow::Result<ResponseFrame> {
        let method = Method::from_bytes(req.method.as_bytes())?;
        let mut url = format!("{}{}", self.base, req.path);
        if !req.query.is_empty() {
            url.push('?');
            url.push_str(&req.query);
        }

        let mut headers = HeaderMap::new();
        let forwarded = strip_headers(req.headers, HOP_BY_HOP_REQUEST_HEADERS);
        for (name, value) in strip_headers(forwarded, LOCAL_DROPPED_HEADERS) {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) else {
                continue;
            };
            headers.append(name, value);
        }

        let mut resp = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(req.body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let headers: HeaderList = resp
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        if let Some(len) = resp.content_length() {
            if len > self.max_body_bytes as u64 {
                anyhow::bail!(
                    "local response of {len} bytes exceeds the {} byte tunnel limit",
                    self.max_body_bytes
                );
            }
        }
        let mut body = BytesMut::new();
        while let Some(chunk) = resp.chunk().await? {
            if body.len() + chunk.len() > self.max_body_bytes {
                anyhow::bail!(
                    "local response exceeds the {} byte tunnel limit",
                    self.max_body_bytes
                );
            }
            body.extend_from_slice(&chunk);
        }
        let body = body.freeze();

        Ok(ResponseFrame {
            id: req.id,
            status,
            headers,
            body,
        })
    }
}
