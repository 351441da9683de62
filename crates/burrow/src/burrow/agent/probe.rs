use std::time::Duration;

use crate::burrow::{net::LocalTarget, tunnel::route::Scheme};

/// Guesses whether the local service speaks HTTPS or plain HTTP.
///
/// HTTPS is tried first with certificate checks off (local services usually
/// run self-signed certs). Anything that does not answer below 400 over
/// HTTPS is treated as HTTP.
pub async fn detect_scheme(target: &LocalTarget, timeout: Duration) -> Scheme {
    let client = match reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(timeout)
        .build()
    {
        Ok(c) => c,
        Err(err) => {
            tracing::debug!(err=%err, "agent: probe client unavailable; assuming http");
            return Scheme::Http;
        }
    };

    for scheme in [Scheme::Https, Scheme::Http] {
        let url = format!("{scheme}://{target}/");
        match client.get(&url).send().await {
            Ok(resp) if resp.status().as_u16() < 400 => {
                tracing::debug!(target=%target, scheme=%scheme, status=resp.status().as_u16(), "agent: probe succeeded");
                return scheme;
            }
            Ok(resp) => {
                tracing::debug!(target=%target, scheme=%scheme, status=resp.status().as_u16(), "agent: probe got error status");
            }
            Err(err) => {
                tracing::debug!(target=%target, scheme=%scheme, err=%err, "agent: probe failed");
            }
        }
    }
    Scheme::Http
}
