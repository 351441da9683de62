use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::mpsc;

use crate::burrow::{
    net::{self, LocalTarget},
    tunnel::{
        auth::Authenticator,
        protocol::{Frame, RegisterAck, RegisterRequest},
        route::{RouteKey, Scheme},
        session::{Registration, SessionSnapshot, TunnelSession},
        tcp::{TcpTunnelEngine, TcpTunnelError},
    },
};

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("{0}")]
    Validation(String),
    #[error("tunnel {0} is not connected")]
    NotConnected(RouteKey),
    #[error("tunnel {0} is already registered")]
    AlreadyRegistered(RouteKey),
    #[error("project {0} is already in use")]
    Conflict(RouteKey),
    #[error("invalid credentials")]
    Unauthorized,
    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),
    #[error("open tcp route: {0}")]
    Listen(#[from] TcpTunnelError),
}

impl RegistrationError {
    /// HTTP status reported to the registering client.
    pub fn status_code(&self) -> u16 {
        match self {
            RegistrationError::Validation(_)
            | RegistrationError::NotConnected(_)
            | RegistrationError::AlreadyRegistered(_)
            | RegistrationError::UnsupportedProtocol(_) => 400,
            RegistrationError::Unauthorized => 401,
            RegistrationError::Conflict(_) => 409,
            RegistrationError::Listen(_) => 500,
        }
    }
}

/// Live sessions by route key.
///
/// At most one session per key. A second connection for a taken key is
/// refused; the existing session is never replaced.
pub struct SessionRegistry {
    sessions: DashMap<RouteKey, Arc<TunnelSession>>,
    tcp: TcpTunnelEngine,
    auth: Arc<dyn Authenticator>,
    public_base_url: String,
    tcp_public_host: String,
    max_body_bytes: Option<usize>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("public_base_url", &self.public_base_url)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    pub fn new(tcp: TcpTunnelEngine, auth: Arc<dyn Authenticator>, public_base_url: &str) -> Self {
        let public_base_url = public_base_url.trim().trim_end_matches('/').to_string();
        let tcp_public_host = net::host_of_base_url(&public_base_url).to_string();
        Self {
            sessions: DashMap::new(),
            tcp,
            auth,
            public_base_url,
            tcp_public_host,
            max_body_bytes: None,
        }
    }

    /// Advertises the relay's body limit to agents in the register ack.
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = Some(max_body_bytes);
        self
    }

    /// Inserts a fresh session for `key` unless one is already live.
    pub fn open(
        &self,
        key: RouteKey,
    ) -> Result<(Arc<TunnelSession>, mpsc::UnboundedReceiver<Frame>), RegistrationError> {
        match self.sessions.entry(key.clone()) {
            Entry::Occupied(_) => Err(RegistrationError::Conflict(key)),
            Entry::Vacant(v) => {
                let (session, rx) = TunnelSession::new(key);
                v.insert(session.clone());
                metrics::gauge!("burrow_sessions_active").increment(1.0);
                tracing::info!(route=%session.key(), id=session.id(), "registry: session opened");
                Ok((session, rx))
            }
        }
    }

    pub fn get(&self, key: &RouteKey) -> Option<Arc<TunnelSession>> {
        self.sessions.get(key).map(|s| s.value().clone())
    }

    /// Session for `key` that finished registration.
    pub fn get_registered(&self, key: &RouteKey) -> Option<Arc<TunnelSession>> {
        self.get(key).filter(|s| s.is_registered())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Removes the mapping (only if it still points at `session`) and closes
    /// the session.
    pub fn close(&self, session: &TunnelSession) {
        let removed = self
            .sessions
            .remove_if(session.key(), |_, s| s.id() == session.id())
            .is_some();
        if removed {
            metrics::gauge!("burrow_sessions_active").decrement(1.0);
        }
        session.close();
    }

    pub fn close_all(&self) {
        let all: Vec<Arc<TunnelSession>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for s in all {
            self.close(&s);
        }
    }

    /// Registration through `POST /register`: the named tunnel must already be
    /// connected.
    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterAck, RegistrationError> {
        let key = self.key_of(req)?;
        self.check_credentials(req)?;
        let session = self
            .get(&key)
            .filter(|s| !s.is_closed())
            .ok_or_else(|| RegistrationError::NotConnected(key.clone()))?;
        self.complete(&session, req).await
    }

    /// Registration sent in-band on an open session.
    pub async fn register_session(
        &self,
        session: &TunnelSession,
        req: &RegisterRequest,
    ) -> Result<RegisterAck, RegistrationError> {
        let key = self.key_of(req)?;
        self.check_credentials(req)?;
        if &key != session.key() {
            if self.get(&key).is_some() {
                return Err(RegistrationError::Conflict(key));
            }
            return Err(RegistrationError::Validation(format!(
                "project {key} does not match connection {}",
                session.key()
            )));
        }
        self.complete(session, req).await
    }

    fn key_of(&self, req: &RegisterRequest) -> Result<RouteKey, RegistrationError> {
        RouteKey::from_parts(req.username.as_deref(), &req.project_name)
            .map_err(|e| RegistrationError::Validation(e.to_string()))
    }

    fn check_credentials(&self, req: &RegisterRequest) -> Result<(), RegistrationError> {
        if self.auth.authenticate(
            req.username.as_deref(),
            req.password.as_deref(),
            req.project_name.trim(),
        ) {
            Ok(())
        } else {
            Err(RegistrationError::Unauthorized)
        }
    }

    async fn complete(
        &self,
        session: &TunnelSession,
        req: &RegisterRequest,
    ) -> Result<RegisterAck, RegistrationError> {
        let target: LocalTarget = req
            .local_url
            .parse()
            .map_err(|e: net::InvalidTarget| RegistrationError::Validation(e.to_string()))?;
        let scheme: Scheme = match req.protocol.trim() {
            "" => Scheme::Http,
            p => p
                .parse()
                .map_err(|_| RegistrationError::UnsupportedProtocol(p.to_string()))?,
        };

        if !session.try_claim_registration() {
            return Err(RegistrationError::AlreadyRegistered(session.key().clone()));
        }

        let key = session.key().clone();
        let (route, tcp_port) = match scheme {
            Scheme::Tcp => match self.tcp.open(key.clone(), target.clone()).await {
                Ok(route) => {
                    let port = route.port();
                    (Some(route), Some(port))
                }
                Err(err) => {
                    session.abandon_registration();
                    return Err(err.into());
                }
            },
            Scheme::Http | Scheme::Https => (None, None),
        };

        session.complete_registration(
            Registration {
                target: target.clone(),
                scheme,
                tcp_port,
            },
            route,
        );
        session.mark_open();

        let public_url = match tcp_port {
            Some(port) => format!("tcp://{}:{port}", self.tcp_public_host),
            None => format!("{}/{key}/", self.public_base_url),
        };
        tracing::info!(route=%key, scheme=%scheme, target=%target, public_url=%public_url, "registry: tunnel registered");

        Ok(RegisterAck {
            status: "success".into(),
            tcp_port,
            public_url: Some(public_url),
            max_body_bytes: self.max_body_bytes,
        })
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut out: Vec<SessionSnapshot> = self.sessions.iter().map(|e| e.value().snapshot()).collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}
