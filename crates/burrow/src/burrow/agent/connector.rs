use std::{sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use tokio::{sync::watch, task::JoinHandle};
use tokio_tungstenite::tungstenite::Message;

use crate::burrow::{
    agent::{
        AgentError, AgentStatus,
        dialer::{RetryPolicy, TunnelDialer, WsDialer, WsStream, connect_with_retry},
        executor::LocalForwarder,
        probe::detect_scheme,
    },
    net::LocalTarget,
    tunnel::{
        protocol::{ControlError, ControlFrame, ControlKind, Frame, RegisterAck, RegisterRequest},
        route::{RouteKey, Scheme},
        session::TunnelSession,
    },
};

#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Relay base, e.g. `ws://relay.example.com:8000`.
    pub relay_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Fixed scheme; `None` probes the local service.
    pub protocol: Option<Scheme>,
    pub retry: RetryPolicy,
    pub keepalive_interval: Duration,
    pub probe_timeout: Duration,
    pub forward_timeout: Duration,
    pub register_timeout: Duration,
    /// Largest local response body buffered per request. A smaller limit
    /// advertised by the relay wins.
    pub max_response_bytes: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8000".into(),
            username: None,
            password: None,
            protocol: None,
            retry: RetryPolicy::default(),
            keepalive_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
            forward_timeout: Duration::from_secs(60),
            register_timeout: Duration::from_secs(10),
            max_response_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Client connector: owns the status stream and the cancel switch, and
/// turns `connect` calls into live tunnels.
pub struct Agent<D = WsDialer> {
    opts: AgentOptions,
    dialer: Arc<D>,
    status: Arc<watch::Sender<AgentStatus>>,
    cancel: Arc<watch::Sender<bool>>,
}

impl<D> std::fmt::Debug for Agent<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("relay_url", &self.opts.relay_url)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Agent<WsDialer> {
    pub fn new(opts: AgentOptions) -> Self {
        Self::with_dialer(opts, WsDialer::default())
    }
}

impl<D> Agent<D>
where
    D: TunnelDialer<Conn = WsStream> + 'static,
{
    pub fn with_dialer(opts: AgentOptions, dialer: D) -> Self {
        let (status, _) = watch::channel(AgentStatus::Idle);
        let (cancel, _) = watch::channel(false);
        Self {
            opts,
            dialer: Arc::new(dialer),
            status: Arc::new(status),
            cancel: Arc::new(cancel),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> AgentStatus {
        self.status.borrow().clone()
    }

    /// Aborts an in-progress `connect` or tears down the live tunnel.
    pub fn disconnect(&self) {
        self.cancel.send_replace(true);
    }

    fn set(&self, s: AgentStatus) {
        tracing::debug!(status=%s, "agent: status");
        self.status.send_replace(s);
    }

    fn fail(&self, err: AgentError) -> AgentError {
        match &err {
            AgentError::Disconnected => self.set(AgentStatus::Disconnected),
            other => self.set(AgentStatus::Error(other.to_string())),
        }
        err
    }

    /// Validates input, probes the local scheme, dials the relay with retries
    /// and registers. On success the tunnel keeps running in background tasks
    /// until the returned handle (or this agent) disconnects.
    pub async fn connect(&self, project: &str, local_url: &str) -> Result<AgentHandle, AgentError> {
        self.cancel.send_replace(false);
        let mut cancel = self.cancel.subscribe();

        self.set(AgentStatus::Validating);
        let key = RouteKey::from_parts(self.opts.username.as_deref(), project)
            .map_err(|e| self.fail(AgentError::InputValidation(e.to_string())))?;
        let target: LocalTarget = local_url
            .parse()
            .map_err(|e: crate::burrow::net::InvalidTarget| {
                self.fail(AgentError::InputValidation(e.to_string()))
            })?;

        let scheme = match self.opts.protocol {
            Some(s) => s,
            None => {
                self.set(AgentStatus::Probing);
                detect_scheme(&target, self.opts.probe_timeout).await
            }
        };

        let url = format!("{}/ws/{key}", self.opts.relay_url.trim_end_matches('/'));
        let ws = connect_with_retry(
            self.dialer.as_ref(),
            &url,
            self.opts.retry,
            &mut cancel,
            |attempt, max| self.set(AgentStatus::Connecting { attempt, max }),
        )
        .await
        .map_err(|e| self.fail(e))?;

        self.set(AgentStatus::Registering);
        let req = RegisterRequest {
            username: self.opts.username.clone(),
            password: self.opts.password.clone(),
            project_name: project.trim().to_string(),
            local_url: target.to_string(),
            protocol: scheme.to_string(),
        };
        let (ws, ack) = tokio::select! {
            _ = crate::burrow::signalled(&mut cancel) => return Err(self.fail(AgentError::Disconnected)),
            res = register(ws, &req, self.opts.register_timeout) => res.map_err(|e| self.fail(e))?,
        };

        let body_limit = ack
            .max_body_bytes
            .map_or(self.opts.max_response_bytes, |n| n.min(self.opts.max_response_bytes));
        let forwarder = LocalForwarder::new(scheme, &target, self.opts.forward_timeout, body_limit)
            .map_err(|e| self.fail(AgentError::Transport(format!("{e:#}"))))?;

        let public_url = ack.public_url.clone().unwrap_or_default();
        let mut links = vec![(public_url.clone(), "Public URL".to_string())];
        if scheme != Scheme::Tcp {
            links.push((forwarder.base_url().to_string(), "Local service".to_string()));
        }

        let (session, outbound) = TunnelSession::new(key.clone());
        session.mark_open();

        tracing::info!(route=%key, public_url=%public_url, scheme=%scheme, target=%target, "agent: tunnel up");
        self.set(AgentStatus::Connected {
            public_url: public_url.clone(),
        });

        let supervisor = spawn_tunnel(
            ws,
            session.clone(),
            outbound,
            forwarder,
            self.opts.keepalive_interval,
            cancel,
            self.status.clone(),
        );

        Ok(AgentHandle {
            public_url,
            tcp_port: ack.tcp_port,
            links,
            status: self.status.subscribe(),
            cancel: self.cancel.clone(),
            session,
            supervisor,
        })
    }
}

/// Live tunnel returned by [`Agent::connect`].
#[derive(Debug)]
pub struct AgentHandle {
    public_url: String,
    tcp_port: Option<u16>,
    links: Vec<(String, String)>,
    status: watch::Receiver<AgentStatus>,
    cancel: Arc<watch::Sender<bool>>,
    session: Arc<TunnelSession>,
    supervisor: JoinHandle<()>,
}

impl AgentHandle {
    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn tcp_port(&self) -> Option<u16> {
        self.tcp_port
    }

    /// `(url, label)` pairs for display.
    pub fn links(&self) -> &[(String, String)] {
        &self.links
    }

    pub fn status(&self) -> watch::Receiver<AgentStatus> {
        self.status.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    pub fn disconnect(&self) {
        self.cancel.send_replace(true);
    }

    /// Waits until the tunnel is torn down for any reason.
    pub async fn wait(self) {
        let _ = self.supervisor.await;
    }
}

/// Sends the register frame and waits for the relay's verdict.
async fn register(
    mut ws: WsStream,
    req: &RegisterRequest,
    deadline: Duration,
) -> Result<(WsStream, RegisterAck), AgentError> {
    let text = Frame::Control(ControlFrame::register(req))
        .encode()
        .map_err(|e| AgentError::Transport(e.to_string()))?;
    if let Err(err) = ws.send(Message::Text(text)).await {
        // A relay that refused the connection outright has already queued its reason.
        return match tokio::time::timeout(deadline, await_ack(&mut ws)).await {
            Ok(Err(e @ AgentError::Registration { .. })) => Err(e),
            _ => Err(AgentError::Transport(err.to_string())),
        };
    }

    let ack = tokio::time::timeout(deadline, await_ack(&mut ws))
        .await
        .map_err(|_| AgentError::Transport("timed out waiting for registration".into()))??;
    Ok((ws, ack))
}

async fn await_ack(ws: &mut WsStream) -> Result<RegisterAck, AgentError> {
    loop {
        let msg = match ws.next().await {
            Some(Ok(m)) => m,
            Some(Err(e)) => return Err(AgentError::Transport(e.to_string())),
            None => return Err(AgentError::Transport("relay closed the connection".into())),
        };
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => {
                return Err(AgentError::Transport("relay closed the connection".into()));
            }
            _ => continue,
        };
        let frame = Frame::decode(&text).map_err(|e| AgentError::Transport(e.to_string()))?;
        let Frame::Control(c) = frame else {
            continue;
        };
        match c.kind {
            ControlKind::RegisterAck => {
                return c
                    .payload_as::<RegisterAck>()
                    .map_err(|e| AgentError::Transport(e.to_string()));
            }
            ControlKind::Error => {
                let e: ControlError = c
                    .payload_as()
                    .map_err(|e| AgentError::Transport(e.to_string()))?;
                return Err(AgentError::Registration {
                    code: e.code,
                    message: e.message,
                });
            }
            _ => continue,
        }
    }
}

fn spawn_tunnel(
    ws: WsStream,
    session: Arc<TunnelSession>,
    mut outbound: tokio::sync::mpsc::UnboundedReceiver<Frame>,
    forwarder: LocalForwarder,
    keepalive_interval: Duration,
    mut cancel: watch::Receiver<bool>,
    status: Arc<watch::Sender<AgentStatus>>,
) -> JoinHandle<()> {
    let (mut sink, mut stream) = ws.split();

    let writer = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(keepalive_interval);
            keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            keepalive.tick().await;
            loop {
                let msg = tokio::select! {
                    _ = session.closed() => break,
                    _ = keepalive.tick() => Message::Ping(Vec::new()),
                    frame = outbound.recv() => {
                        let Some(frame) = frame else { break };
                        match frame.encode() {
                            Ok(text) => Message::Text(text),
                            Err(err) => {
                                tracing::warn!(err=%err, "agent: encode frame failed");
                                continue;
                            }
                        }
                    }
                };
                if let Err(err) = sink.send(msg).await {
                    tracing::warn!(err=%err, "agent: send to relay failed");
                    session.close();
                    break;
                }
            }
            let _ = sink.close().await;
        })
    };

    let reader = {
        let session = session.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = session.closed() => break,
                    msg = stream.next() => msg,
                };
                let text = match msg {
                    Some(Ok(Message::Text(t))) => t,
                    Some(Ok(Message::Binary(b))) => match String::from_utf8(b) {
                        Ok(t) => t,
                        Err(_) => {
                            tracing::warn!("agent: non utf-8 frame from relay");
                            break;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("agent: relay closed the connection");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        tracing::warn!(err=%err, "agent: read from relay failed");
                        break;
                    }
                };
                match session.handle_text(&text) {
                    Ok(None) => {}
                    Ok(Some(c)) if c.kind == ControlKind::Error => {
                        let msg = c
                            .payload_as::<ControlError>()
                            .map(|e| e.message)
                            .unwrap_or_default();
                        tracing::warn!(err=%msg, "agent: relay reported an error");
                        break;
                    }
                    Ok(Some(c)) => {
                        tracing::debug!(kind=?c.kind, "agent: ignoring control frame");
                    }
                    Err(err) => {
                        tracing::warn!(err=%err, "agent: protocol violation from relay");
                        break;
                    }
                }
            }
            session.close();
        })
    };

    let executor = {
        let session = session.clone();
        let inbound = session.take_inbound();
        tokio::spawn(async move {
            let Some(mut inbound) = inbound else {
                return;
            };
            loop {
                let req = tokio::select! {
                    _ = session.closed() => break,
                    req = inbound.recv() => match req {
                        Some(r) => r,
                        None => break,
                    },
                };
                let session = session.clone();
                let forwarder = forwarder.clone();
                tokio::spawn(async move {
                    let resp = forwarder.forward(req).await;
                    if session.send(Frame::Response(resp)).is_err() {
                        tracing::debug!("agent: tunnel closed before response was sent");
                    }
                });
            }
        })
    };

    tokio::spawn(async move {
        tokio::select! {
            _ = session.closed() => {}
            _ = crate::burrow::signalled(&mut cancel) => {
                tracing::info!(route=%session.key(), "agent: disconnect requested");
            }
        }
        session.close();
        let _ = writer.await;
        let _ = reader.await;
        let _ = executor.await;
        status.send_replace(AgentStatus::Disconnected);
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;

    struct CountingDialer {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TunnelDialer for CountingDialer {
        type Conn = WsStream;

        async fn dial(&self, _url: &str) -> anyhow::Result<WsStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("no relay here")
        }
    }

    fn opts() -> AgentOptions {
        AgentOptions {
            protocol: Some(Scheme::Http),
            retry: RetryPolicy {
                max_attempts: 2,
                backoff_base: Duration::from_millis(10),
            },
            ..AgentOptions::default()
        }
    }

    #[tokio::test]
    async fn invalid_input_fails_before_any_dial() {
        let agent = Agent::with_dialer(opts(), CountingDialer { calls: AtomicU32::new(0) });

        for (project, local) in [("ab", "localhost:3000"), ("demo", "localhost"), ("demo", "http://x:1")] {
            let err = agent.connect(project, local).await.unwrap_err();
            assert!(matches!(err, AgentError::InputValidation(_)), "{project} {local}: {err}");
            assert!(matches!(agent.status(), AgentStatus::Error(_)));
        }
        assert_eq!(agent.dialer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_report_connect_error() {
        let agent = Agent::with_dialer(opts(), CountingDialer { calls: AtomicU32::new(0) });
        let mut rx = agent.subscribe();

        let err = agent.connect("demo", "localhost:3000").await.unwrap_err();
        assert!(matches!(err, AgentError::Connect { attempts: 2, .. }));
        assert_eq!(agent.dialer.calls.load(Ordering::SeqCst), 2);

        let last = rx.borrow_and_update().clone();
        assert!(last.to_string().starts_with("Error: could not reach relay"));
    }
}
