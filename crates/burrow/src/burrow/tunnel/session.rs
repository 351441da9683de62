use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::burrow::{
    net::LocalTarget,
    telemetry,
    tunnel::{
        pending::{PendingError, PendingTable},
        protocol::{ControlFrame, ControlKind, Frame, ProtocolError, RequestFrame, ResponseFrame},
        route::{RouteKey, Scheme},
        tcp::TcpRoute,
    },
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

const REG_NONE: u8 = 0;
const REG_PENDING: u8 = 1;
const REG_DONE: u8 = 2;

/// What a registered session forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub target: LocalTarget,
    pub scheme: Scheme,
    pub tcp_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: u64,
    pub key: String,
    pub state: SessionState,
    pub registered: bool,
    pub scheme: Option<Scheme>,
    pub target: Option<String>,
    pub tcp_port: Option<u16>,
    pub tcp_active_connections: usize,
    pub pending_requests: usize,
    pub connected_at_unix_ms: u64,
}

/// One live WebSocket between relay and agent.
///
/// The transport loops own the socket; the session only sees decoded frames
/// (via [`TunnelSession::handle_frame`]) and queues outgoing frames on an
/// unbounded channel drained by a single writer task, so concurrent senders
/// never interleave partial messages.
pub struct TunnelSession {
    id: u64,
    key: RouteKey,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: PendingTable,
    inbound_tx: mpsc::UnboundedSender<RequestFrame>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<RequestFrame>>>,
    state: watch::Sender<SessionState>,
    reg_state: AtomicU8,
    registration: RwLock<Option<Registration>>,
    tcp_route: Mutex<Option<TcpRoute>>,
    connected_at_unix_ms: u64,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TunnelSession {
    /// Creates a session in `Connecting` state. The returned receiver feeds
    /// the transport's writer task.
    pub fn new(key: RouteKey) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Connecting);
        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            key,
            outbound,
            pending: PendingTable::new(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            state,
            reg_state: AtomicU8::new(REG_NONE),
            registration: RwLock::new(None),
            tcp_route: Mutex::new(None),
            connected_at_unix_ms: telemetry::now_unix_ms(),
        });
        (session, outbound_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &RouteKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn mark_open(&self) {
        self.state.send_if_modified(|s| {
            if *s == SessionState::Connecting {
                *s = SessionState::Open;
                true
            } else {
                false
            }
        });
    }

    /// Queues a frame for the writer task. Fails once the writer has gone away.
    pub fn send(&self, frame: Frame) -> Result<(), PendingError> {
        if self.is_closed() {
            return Err(PendingError::ConnectionLost);
        }
        self.outbound
            .send(frame)
            .map_err(|_| PendingError::ConnectionLost)
    }

    pub fn send_control(&self, frame: ControlFrame) -> Result<(), PendingError> {
        self.send(Frame::Control(frame))
    }

    /// Sends `req` under a fresh correlation id and waits for its response.
    pub async fn request(
        &self,
        mut req: RequestFrame,
        deadline: Duration,
    ) -> Result<ResponseFrame, PendingError> {
        let waiter = self.pending.register();
        req.id = waiter.id();
        self.send(Frame::Request(req))?;
        waiter.wait(deadline).await
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Decodes one text message and dispatches it.
    pub fn handle_text(&self, text: &str) -> Result<Option<ControlFrame>, ProtocolError> {
        let frame = Frame::decode(text)?;
        Ok(self.handle_frame(frame))
    }

    /// Routes an inbound frame.
    ///
    /// Responses resolve pending requests, requests go to the inbound queue,
    /// pings are answered in place. Every other control frame is handed back
    /// to the caller.
    pub fn handle_frame(&self, frame: Frame) -> Option<ControlFrame> {
        match frame {
            Frame::Response(resp) => {
                let id = resp.id;
                if !self.pending.complete(id, resp) {
                    tracing::debug!(session=%self.key, id, "tunnel: dropping response with no waiter");
                }
                None
            }
            Frame::Request(req) => {
                if self.inbound_tx.send(req).is_err() {
                    tracing::debug!(session=%self.key, "tunnel: inbound request with no consumer");
                }
                None
            }
            Frame::Control(c) if c.kind == ControlKind::Ping => {
                let _ = self.send_control(ControlFrame::pong(c.payload));
                None
            }
            Frame::Control(c) if c.kind == ControlKind::Pong => None,
            Frame::Control(c) => Some(c),
        }
    }

    /// Hands out the inbound request stream once.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<RequestFrame>> {
        lock(&self.inbound_rx).take()
    }

    /// Claims the single registration slot of this session.
    pub fn try_claim_registration(&self) -> bool {
        self.reg_state
            .compare_exchange(REG_NONE, REG_PENDING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn abandon_registration(&self) {
        let _ = self.reg_state.compare_exchange(
            REG_PENDING,
            REG_NONE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Stores the registration and, for TCP routes, the listener it owns.
    ///
    /// If the session closed while the route was being set up, the route is
    /// shut down right away instead of outliving its session.
    pub fn complete_registration(&self, reg: Registration, route: Option<TcpRoute>) {
        if let Ok(mut guard) = self.registration.write() {
            *guard = Some(reg);
        }
        *lock(&self.tcp_route) = route;
        self.reg_state.store(REG_DONE, Ordering::Release);

        if self.is_closed() {
            if let Some(route) = lock(&self.tcp_route).take() {
                route.close();
            }
        }
    }

    pub fn is_registered(&self) -> bool {
        self.reg_state.load(Ordering::Acquire) == REG_DONE
    }

    pub fn registration(&self) -> Option<Registration> {
        if !self.is_registered() {
            return None;
        }
        self.registration.read().ok().and_then(|g| g.clone())
    }

    /// Closes the session: fails every pending request and releases the TCP
    /// route. Safe to call more than once.
    pub fn close(&self) {
        let changed = self.state.send_if_modified(|s| {
            if *s == SessionState::Closed {
                false
            } else {
                *s = SessionState::Closed;
                true
            }
        });
        if !changed {
            return;
        }

        let failed = self.pending.fail_all();
        if let Some(route) = lock(&self.tcp_route).take() {
            route.close();
        }
        tracing::info!(session=%self.key, id=self.id, failed_requests=failed, "tunnel: session closed");
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let reg = self.registration();
        let tcp_active_connections = lock(&self.tcp_route)
            .as_ref()
            .map(|r| r.active_connections())
            .unwrap_or(0);
        SessionSnapshot {
            id: self.id,
            key: self.key.to_string(),
            state: self.state(),
            registered: reg.is_some(),
            scheme: reg.as_ref().map(|r| r.scheme),
            target: reg.as_ref().map(|r| r.target.to_string()),
            tcp_port: reg.as_ref().and_then(|r| r.tcp_port),
            tcp_active_connections,
            pending_requests: self.pending.len(),
            connected_at_unix_ms: self.connected_at_unix_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn session() -> (Arc<TunnelSession>, mpsc::UnboundedReceiver<Frame>) {
        TunnelSession::new("demo".parse().unwrap())
    }

    fn get(path: &str) -> RequestFrame {
        RequestFrame {
            id: 0,
            method: "GET".into(),
            path: path.into(),
            headers: vec![],
            query: String::new(),
            body: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn request_is_answered_by_matching_response() {
        let (s, mut out) = session();
        s.mark_open();

        let s2 = s.clone();
        let call = tokio::spawn(async move { s2.request(get("/a"), Duration::from_secs(5)).await });

        let Some(Frame::Request(req)) = out.recv().await else {
            panic!("expected request frame");
        };
        assert_ne!(req.id, 0);

        s.handle_frame(Frame::Response(ResponseFrame {
            id: req.id,
            status: 201,
            headers: vec![],
            body: Bytes::from_static(b"ok"),
        }));

        let resp = call.await.unwrap().unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(s.pending_len(), 0);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (s, mut out) = session();
        let rest = s
            .handle_text(r#"{"type":"control","kind":"ping","payload":{"n":1}}"#)
            .unwrap();
        assert!(rest.is_none());
        let Some(Frame::Control(c)) = out.recv().await else {
            panic!("expected pong");
        };
        assert_eq!(c.kind, ControlKind::Pong);
        assert_eq!(c.payload["n"], 1);
    }

    #[tokio::test]
    async fn requests_flow_to_inbound_and_other_controls_return() {
        let (s, _out) = session();
        let mut inbound = s.take_inbound().unwrap();
        assert!(s.take_inbound().is_none());

        s.handle_frame(Frame::Request(get("/x")));
        assert_eq!(inbound.recv().await.unwrap().path, "/x");

        let c = s
            .handle_frame(Frame::Control(ControlFrame::error(409, "taken")))
            .unwrap();
        assert_eq!(c.kind, ControlKind::Error);
    }

    #[tokio::test]
    async fn close_fails_pending_and_rejects_sends() {
        let (s, _out) = session();
        s.mark_open();

        let s2 = s.clone();
        let call = tokio::spawn(async move { s2.request(get("/slow"), Duration::from_secs(30)).await });
        while s.pending_len() == 0 {
            tokio::task::yield_now().await;
        }

        s.close();
        s.close();
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(call.await.unwrap().unwrap_err(), PendingError::ConnectionLost);
        assert_eq!(
            s.request(get("/after"), Duration::from_secs(1)).await.unwrap_err(),
            PendingError::ConnectionLost
        );
        tokio::time::timeout(Duration::from_secs(1), s.closed())
            .await
            .expect("closed() resolves after close");
    }

    #[tokio::test]
    async fn registration_slot_is_claimed_once() {
        let (s, _out) = session();
        assert!(s.try_claim_registration());
        assert!(!s.try_claim_registration());
        assert!(s.registration().is_none());

        s.complete_registration(
            Registration {
                target: "localhost:3000".parse().unwrap(),
                scheme: Scheme::Http,
                tcp_port: None,
            },
            None,
        );
        assert!(s.is_registered());
        assert!(!s.try_claim_registration());
        assert_eq!(s.registration().unwrap().scheme, Scheme::Http);

        let snap = s.snapshot();
        assert!(snap.registered);
        assert_eq!(snap.target.as_deref(), Some("localhost:3000"));
    }

    #[tokio::test]
    async fn abandoned_registration_can_be_retried() {
        let (s, _out) = session();
        assert!(s.try_claim_registration());
        s.abandon_registration();
        assert!(s.try_claim_registration());
    }
}
