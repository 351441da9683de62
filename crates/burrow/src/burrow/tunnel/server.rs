use std::{net::SocketAddr, ops::ControlFlow, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{
        Path, Request, State,
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::burrow::tunnel::{
    http_proxy::{HttpProxyEngine, ProxyRequest},
    protocol::{ControlFrame, ControlKind, Frame, HeaderList, ProtocolError, RegisterRequest},
    registry::{RegistrationError, SessionRegistry},
    route::RouteKey,
    session::TunnelSession,
};

/// Room for base64 growth and JSON framing around a maximal body.
const FRAME_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub struct RelayState {
    pub registry: Arc<SessionRegistry>,
    pub proxy: HttpProxyEngine,
    /// Sessions that have not registered by then are dropped.
    pub register_timeout: Duration,
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/ws/{project}", get(ws_project))
        .route("/ws/{username}/{project}", get(ws_scoped))
        .fallback(proxy)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serves the relay on an already-bound listener until `shutdown` flips to true.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<RelayState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let registry = state.registry.clone();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            // Upgraded sockets are not tracked by graceful shutdown.
            registry.close_all();
        })
        .await?;
    Ok(())
}

pub async fn serve_with_shutdown(
    addr: &str,
    state: Arc<RelayState>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local: Option<SocketAddr> = listener.local_addr().ok();
    tracing::info!(addr = ?local, "relay: listening");
    serve(listener, state, shutdown).await
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
}

fn error_response(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorBody {
            status: "error",
            message: message.into(),
        }),
    )
        .into_response()
}

async fn register(
    State(st): State<Arc<RelayState>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rej) => return error_response(StatusCode::BAD_REQUEST, rej.body_text()),
    };
    match st.registry.register(&req).await {
        Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
        Err(err) => registration_failed(&err),
    }
}

fn registration_failed(err: &RegistrationError) -> Response {
    tracing::info!(err=%err, "relay: registration rejected");
    let code = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
    error_response(code, err.to_string())
}

async fn ws_project(
    State(st): State<Arc<RelayState>>,
    Path(project): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    match RouteKey::project(&project) {
        Ok(key) => upgrade(st, ws, key),
        Err(err) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

async fn ws_scoped(
    State(st): State<Arc<RelayState>>,
    Path((username, project)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    match RouteKey::scoped(&username, &project) {
        Ok(key) => upgrade(st, ws, key),
        Err(err) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

fn upgrade(st: Arc<RelayState>, ws: WebSocketUpgrade, key: RouteKey) -> Response {
    let max = st.proxy.max_body_bytes().saturating_mul(2) + FRAME_OVERHEAD_BYTES;
    ws.max_message_size(max)
        .on_upgrade(move |socket| run_session(st, socket, key))
}

async fn run_session(st: Arc<RelayState>, mut socket: WebSocket, key: RouteKey) {
    let (session, mut outbound) = match st.registry.open(key.clone()) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(route=%key, err=%err, "relay: refusing connection");
            if let Ok(text) = Frame::Control(ControlFrame::error(err.status_code(), err.to_string())).encode() {
                let _ = socket.send(Message::Text(text.into())).await;
            }
            let _ = socket.close().await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    let writer = {
        let session = session.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound.recv() => {
                        let Some(frame) = frame else { break };
                        let text = match frame.encode() {
                            Ok(t) => t,
                            Err(err) => {
                                tracing::warn!(route=%session.key(), err=%err, "relay: encode frame failed");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    _ = session.closed() => break,
                }
            }
            // Flush whatever was queued before the close, e.g. an error frame.
            while let Ok(frame) = outbound.try_recv() {
                if let Ok(text) = frame.encode() {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        })
    };

    let register_deadline = tokio::time::sleep(st.register_timeout);
    tokio::pin!(register_deadline);

    loop {
        tokio::select! {
            _ = session.closed() => break,
            _ = &mut register_deadline, if !session.is_registered() => {
                tracing::warn!(route=%session.key(), "relay: session did not register in time");
                let _ = session.send_control(ControlFrame::error(408, "registration timed out"));
                break;
            }
            msg = stream.next() => {
                let res = match msg {
                    Some(Ok(Message::Text(text))) => on_text(&st, &session, text.as_str()).await,
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => on_text(&st, &session, text).await,
                        Err(_) => Err(ProtocolError::NotUtf8),
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => Ok(ControlFlow::Continue(())),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(route=%session.key(), err=%err, "relay: websocket read failed");
                        break;
                    }
                };
                match res {
                    Ok(ControlFlow::Continue(())) => {}
                    Ok(ControlFlow::Break(())) => break,
                    Err(err) => {
                        tracing::warn!(route=%session.key(), err=%err, "relay: protocol violation, closing session");
                        let _ = session.send_control(ControlFrame::error(400, err.to_string()));
                        break;
                    }
                }
            }
        }
    }

    st.registry.close(&session);
    let _ = writer.await;
}

/// Dispatches one inbound message. A rejected in-band registration ends the
/// session after the error frame is queued.
async fn on_text(
    st: &RelayState,
    session: &TunnelSession,
    text: &str,
) -> Result<ControlFlow<()>, ProtocolError> {
    let Some(ctrl) = session.handle_text(text)? else {
        return Ok(ControlFlow::Continue(()));
    };
    match ctrl.kind {
        ControlKind::Register => {
            let (reply, flow) = match ctrl.payload_as::<RegisterRequest>() {
                Ok(req) => match st.registry.register_session(session, &req).await {
                    Ok(ack) => (ControlFrame::register_ack(&ack), ControlFlow::Continue(())),
                    Err(err) => {
                        tracing::info!(route=%session.key(), err=%err, "relay: registration rejected");
                        (
                            ControlFrame::error(err.status_code(), err.to_string()),
                            ControlFlow::Break(()),
                        )
                    }
                },
                Err(err) => (
                    ControlFrame::error(400, format!("bad register payload: {err}")),
                    ControlFlow::Break(()),
                ),
            };
            let _ = session.send_control(reply);
            Ok(flow)
        }
        kind => {
            tracing::debug!(route=%session.key(), kind=?kind, "relay: ignoring control frame");
            Ok(ControlFlow::Continue(()))
        }
    }
}

/// Fallback for every public path.
async fn proxy(State(st): State<Arc<RelayState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let limit = st.proxy.max_body_bytes();
    let body = match axum::body::to_bytes(body, limit.saturating_add(1)).await {
        Ok(b) => b,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let headers: HeaderList = parts
        .headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect();

    st.proxy
        .handle(ProxyRequest {
            method: parts.method.as_str().to_string(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().unwrap_or("").to_string(),
            headers,
            body,
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burrow::tunnel::{auth::StaticUsers, protocol::RegisterAck, tcp::TcpTunnelEngine};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    struct Relay {
        addr: SocketAddr,
        state: Arc<RelayState>,
        _shutdown: watch::Sender<bool>,
    }

    async fn start_relay() -> Relay {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(SessionRegistry::new(
            TcpTunnelEngine::new("127.0.0.1"),
            Arc::new(StaticUsers::default()),
            &format!("http://{addr}"),
        )
        .with_max_body_bytes(1024 * 1024));
        let state = Arc::new(RelayState {
            registry: registry.clone(),
            proxy: HttpProxyEngine::new(registry, Duration::from_secs(5), 1024 * 1024),
            register_timeout: Duration::from_secs(10),
        });
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve(listener, state.clone(), rx));
        Relay {
            addr,
            state,
            _shutdown: tx,
        }
    }

    type Ws = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn dial(addr: SocketAddr, path: &str) -> Ws {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{path}"))
            .await
            .unwrap();
        ws
    }

    async fn send(ws: &mut Ws, frame: Frame) {
        ws.send(WsMessage::Text(frame.encode().unwrap().into())).await.unwrap();
    }

    async fn next_frame(ws: &mut Ws) -> Option<Frame> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame within deadline")?
                .ok()?;
            match msg {
                WsMessage::Text(t) => return Some(Frame::decode(t.as_ref()).unwrap()),
                WsMessage::Close(_) => return None,
                _ => continue,
            }
        }
    }

    fn register_req(project: &str) -> RegisterRequest {
        RegisterRequest {
            username: None,
            password: None,
            project_name: project.into(),
            local_url: "127.0.0.1:3000".into(),
            protocol: "http".into(),
        }
    }

    #[tokio::test]
    async fn in_band_register_then_proxy_round_trip() {
        let relay = start_relay().await;
        let mut ws = dial(relay.addr, "/ws/myapp").await;
        send(&mut ws, Frame::Control(ControlFrame::register(&register_req("myapp")))).await;

        let Some(Frame::Control(ack)) = next_frame(&mut ws).await else {
            panic!("expected register ack");
        };
        assert_eq!(ack.kind, ControlKind::RegisterAck);
        let ack: RegisterAck = ack.payload_as().unwrap();
        assert_eq!(ack.status, "success");
        assert_eq!(ack.max_body_bytes, Some(1024 * 1024));

        let addr = relay.addr;
        let public = tokio::spawn(async move {
            reqwest::get(format!("http://{addr}/myapp/hello?x=1")).await.unwrap()
        });

        let Some(Frame::Request(req)) = next_frame(&mut ws).await else {
            panic!("expected request frame");
        };
        assert_eq!(req.path, "/hello");
        assert_eq!(req.query, "x=1");
        assert!(!req.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host")));

        send(
            &mut ws,
            Frame::Response(crate::burrow::tunnel::protocol::ResponseFrame {
                id: req.id,
                status: 201,
                headers: vec![("x-from".into(), "agent".into())],
                body: bytes::Bytes::from_static(b"hi"),
            }),
        )
        .await;

        let resp = public.await.unwrap();
        assert_eq!(resp.status().as_u16(), 201);
        assert_eq!(resp.headers()["x-from"], "agent");
        assert_eq!(resp.text().await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn relay_answers_ping_with_pong() {
        let relay = start_relay().await;
        let mut ws = dial(relay.addr, "/ws/pinger").await;
        send(&mut ws, Frame::Control(ControlFrame::ping())).await;
        let Some(Frame::Control(c)) = next_frame(&mut ws).await else {
            panic!("expected pong");
        };
        assert_eq!(c.kind, ControlKind::Pong);
    }

    #[tokio::test]
    async fn duplicate_connection_gets_409_and_first_survives() {
        let relay = start_relay().await;
        let mut first = dial(relay.addr, "/ws/taken").await;
        // Wait for the first session to be in the registry.
        send(&mut first, Frame::Control(ControlFrame::ping())).await;
        let _ = next_frame(&mut first).await;

        let mut second = dial(relay.addr, "/ws/taken").await;
        let Some(Frame::Control(c)) = next_frame(&mut second).await else {
            panic!("expected error frame");
        };
        assert_eq!(c.kind, ControlKind::Error);
        let e: crate::burrow::tunnel::protocol::ControlError = c.payload_as().unwrap();
        assert_eq!(e.code, 409);
        assert!(next_frame(&mut second).await.is_none());

        send(&mut first, Frame::Control(ControlFrame::register(&register_req("taken")))).await;
        let Some(Frame::Control(ack)) = next_frame(&mut first).await else {
            panic!("expected ack");
        };
        assert_eq!(ack.kind, ControlKind::RegisterAck);
    }

    #[tokio::test]
    async fn side_channel_register_endpoint() {
        let relay = start_relay().await;
        let client = reqwest::Client::new();
        let url = format!("http://{}/register", relay.addr);

        let resp = client.post(&url).json(&register_req("ghost")).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "error");

        let resp = client
            .post(&url)
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);

        let mut ws = dial(relay.addr, "/ws/side").await;
        send(&mut ws, Frame::Control(ControlFrame::ping())).await;
        let _ = next_frame(&mut ws).await;

        let resp = client.post(&url).json(&register_req("side")).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let ack: RegisterAck = resp.json().await.unwrap();
        assert_eq!(ack.status, "success");

        let resp = client.post(&url).json(&register_req("side")).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn garbage_frame_closes_only_that_session() {
        let relay = start_relay().await;
        let mut good = dial(relay.addr, "/ws/good-one").await;
        send(&mut good, Frame::Control(ControlFrame::ping())).await;
        let _ = next_frame(&mut good).await;

        let mut bad = dial(relay.addr, "/ws/bad-one").await;
        bad.send(WsMessage::Text("{{{".into())).await.unwrap();
        let Some(Frame::Control(c)) = next_frame(&mut bad).await else {
            panic!("expected error frame");
        };
        assert_eq!(c.kind, ControlKind::Error);
        assert!(next_frame(&mut bad).await.is_none());

        send(&mut good, Frame::Control(ControlFrame::ping())).await;
        assert!(matches!(next_frame(&mut good).await, Some(Frame::Control(_))));
        assert!(relay.state.registry.get(&"good-one".parse().unwrap()).is_some());
    }

    #[tokio::test]
    async fn rejected_in_band_registration_ends_session() {
        let relay = start_relay().await;
        let mut ws = dial(relay.addr, "/ws/lonely").await;
        let mut req = register_req("lonely");
        req.protocol = "udp".into();
        send(&mut ws, Frame::Control(ControlFrame::register(&req))).await;

        let Some(Frame::Control(c)) = next_frame(&mut ws).await else {
            panic!("expected error frame");
        };
        let e: crate::burrow::tunnel::protocol::ControlError = c.payload_as().unwrap();
        assert_eq!(e.code, 400);
        assert!(next_frame(&mut ws).await.is_none());
        assert!(relay.state.registry.get(&"lonely".parse().unwrap()).is_none());
    }

    #[tokio::test]
    async fn invalid_ws_path_is_rejected() {
        let relay = start_relay().await;
        let res = tokio_tungstenite::connect_async(format!("ws://{}/ws/x", relay.addr)).await;
        assert!(res.is_err());
    }
}
