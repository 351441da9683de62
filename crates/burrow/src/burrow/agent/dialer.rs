use std::time::Duration;

use async_trait::async_trait;
use tokio::{net::TcpStream, sync::watch};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::burrow::agent::AgentError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens the transport to the relay.
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    type Conn: Send + 'static;

    async fn dial(&self, url: &str) -> anyhow::Result<Self::Conn>;
}

#[derive(Debug, Clone)]
pub struct WsDialer {
    pub connect_timeout: Duration,
}

impl Default for WsDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl TunnelDialer for WsDialer {
    type Conn = WsStream;

    async fn dial(&self, url: &str) -> anyhow::Result<WsStream> {
        let (ws, _) = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| anyhow::anyhow!("connect timed out after {}", humantime::format_duration(self.connect_timeout)))??;
        Ok(ws)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(2),
        }
    }
}

/// Wait before the attempt following `attempt` (1-based): linear in the attempt number.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.max(1))
}

/// Dials until one attempt succeeds or `policy.max_attempts` have failed.
///
/// `on_attempt(n, max)` runs before each attempt. Flipping `cancel` to true
/// aborts the dial or the backoff wait with [`AgentError::Disconnected`].
pub async fn connect_with_retry<D, F>(
    dialer: &D,
    url: &str,
    policy: RetryPolicy,
    cancel: &mut watch::Receiver<bool>,
    mut on_attempt: F,
) -> Result<D::Conn, AgentError>
where
    D: TunnelDialer + ?Sized,
    F: FnMut(u32, u32),
{
    let max = policy.max_attempts.max(1);
    let mut last_err = String::new();

    for attempt in 1..=max {
        on_attempt(attempt, max);

        let res = tokio::select! {
            _ = crate::burrow::signalled(cancel) => return Err(AgentError::Disconnected),
            res = dialer.dial(url) => res,
        };
        match res {
            Ok(conn) => {
                tracing::info!(relay=%url, attempt, "agent: connected to relay");
                return Ok(conn);
            }
            Err(err) => last_err = format!("{err:#}"),
        }

        if attempt == max {
            break;
        }

        let delay = backoff_delay(policy.backoff_base, attempt);
        tracing::warn!(
            relay=%url,
            attempt,
            max,
            err=%last_err,
            backoff=%humantime::format_duration(delay),
            "agent: connect failed; retrying"
        );
        tokio::select! {
            _ = crate::burrow::signalled(cancel) => return Err(AgentError::Disconnected),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    Err(AgentError::Connect {
        attempts: max,
        reason: last_err,
    })
}
