use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
};

use crate::burrow::{
    net::{self, LocalTarget},
    telemetry,
    tunnel::route::RouteKey,
};

/// Read size of each splice loop.
pub const SPLICE_CHUNK_BYTES: usize = 16 * 1024;

const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum TcpTunnelError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Opens public listeners for TCP routes.
#[derive(Debug, Clone)]
pub struct TcpTunnelEngine {
    bind_host: String,
}

impl TcpTunnelEngine {
    pub fn new(bind_host: impl Into<String>) -> Self {
        let mut bind_host: String = bind_host.into();
        if bind_host.trim().is_empty() {
            bind_host = "0.0.0.0".into();
        }
        Self { bind_host }
    }

    /// Binds an ephemeral port and starts accepting public connections for `key`.
    pub async fn open(&self, key: RouteKey, target: LocalTarget) -> Result<TcpRoute, TcpTunnelError> {
        let host = self.bind_host.trim();
        let addr = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:0")
        } else {
            format!("{host}:0")
        };
        let bind_addr = net::normalize_bind_addr(&addr).into_owned();
        let ln = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| TcpTunnelError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let port = ln
            .local_addr()
            .map_err(|source| TcpTunnelError::Bind {
                addr: bind_addr.clone(),
                source,
            })?
            .port();

        let (stop_tx, stop_rx) = watch::channel(false);
        let active: Arc<DashMap<u64, SocketAddr>> = Arc::new(DashMap::new());

        tracing::info!(route=%key, port, target=%target, "tcp: route listening");

        let task = tokio::spawn(accept_loop(ln, key.clone(), target, active.clone(), stop_rx));

        Ok(TcpRoute {
            key,
            port,
            stop: stop_tx,
            active,
            task,
        })
    }
}

/// Public listener of one TCP route plus its in-flight pipes.
///
/// Dropping the route closes the listener and every pipe.
#[derive(Debug)]
pub struct TcpRoute {
    key: RouteKey,
    port: u16,
    stop: watch::Sender<bool>,
    active: Arc<DashMap<u64, SocketAddr>>,
    task: JoinHandle<()>,
}

impl TcpRoute {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn active_connections(&self) -> usize {
        self.active.len()
    }

    pub fn close(&self) {
        if !self.stop.send_replace(true) {
            tracing::info!(route=%self.key, port=self.port, "tcp: route closed");
        }
        self.task.abort();
    }
}

impl Drop for TcpRoute {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    ln: TcpListener,
    key: RouteKey,
    target: LocalTarget,
    active: Arc<DashMap<u64, SocketAddr>>,
    mut stop: watch::Receiver<bool>,
) {
    let seq = AtomicU64::new(1);
    loop {
        tokio::select! {
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(route=%key, err=%err, "tcp: accept failed");
                        continue;
                    }
                };
                let id = seq.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(handle_conn(
                    id,
                    conn,
                    peer,
                    key.clone(),
                    target.clone(),
                    active.clone(),
                    stop.clone(),
                ));
            }
        }
    }
}

struct ActivePipe {
    id: u64,
    active: Arc<DashMap<u64, SocketAddr>>,
}

impl Drop for ActivePipe {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

async fn handle_conn(
    id: u64,
    public: TcpStream,
    peer: SocketAddr,
    key: RouteKey,
    target: LocalTarget,
    active: Arc<DashMap<u64, SocketAddr>>,
    mut stop: watch::Receiver<bool>,
) {
    metrics::counter!("burrow_tcp_connections_total").increment(1);

    // One attempt per public connection; on failure the public side is dropped.
    let dial = tokio::time::timeout(
        LOCAL_DIAL_TIMEOUT,
        TcpStream::connect((target.host.as_str(), target.port)),
    );
    let local = tokio::select! {
        biased;
        _ = crate::burrow::signalled(&mut stop) => {
            tracing::debug!(route=%key, peer=%peer, "tcp: route closed before local dial finished");
            return;
        }
        res = dial => match res {
            Ok(Ok(c)) => c,
            Ok(Err(err)) => {
                tracing::debug!(route=%key, peer=%peer, target=%target, err=%err, "tcp: local dial failed");
                return;
            }
            Err(_) => {
                tracing::debug!(route=%key, peer=%peer, target=%target, "tcp: local dial timeout");
                return;
            }
        },
    };

    active.insert(id, peer);
    let _pipe = ActivePipe {
        id,
        active: active.clone(),
    };
    let _gauge = telemetry::GaugeGuard::new("burrow_tcp_pipes_active");

    tracing::debug!(route=%key, peer=%peer, "tcp: pipe opened");

    tokio::select! {
        _ = crate::burrow::signalled(&mut stop) => {
            tracing::debug!(route=%key, peer=%peer, "tcp: pipe closed by route teardown");
        }
        res = splice(public, local) => {
            tracing::debug!(route=%key, peer=%peer, ingress=res.0, egress=res.1, "tcp: pipe closed");
        }
    }
}

/// Copies both directions until one of them ends, then closes both sockets.
async fn splice(public: TcpStream, local: TcpStream) -> (u64, u64) {
    let (mut pr, mut pw) = public.into_split();
    let (mut lr, mut lw) = local.into_split();

    let ingress = AtomicU64::new(0);
    let egress = AtomicU64::new(0);

    tokio::select! {
        _ = copy_chunks(&mut pr, &mut lw, &ingress) => {}
        _ = copy_chunks(&mut lr, &mut pw, &egress) => {}
    }

    let _ = lw.shutdown().await;
    let _ = pw.shutdown().await;

    let ingress = ingress.load(Ordering::Relaxed);
    let egress = egress.load(Ordering::Relaxed);
    metrics::counter!("burrow_bytes_ingress_total").increment(ingress);
    metrics::counter!("burrow_bytes_egress_total").increment(egress);
    (ingress, egress)
}

async fn copy_chunks<R, W>(r: &mut R, w: &mut W, counter: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; SPLICE_CHUNK_BYTES];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        w.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
