use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{sync::watch, task::JoinSet};

use crate::burrow::{
    admin,
    agent::Agent,
    config::{self, Config, RelayConfig},
    logging, net, telemetry,
    tunnel::{
        auth::StaticUsers,
        http_proxy::HttpProxyEngine,
        registry::SessionRegistry,
        server::{self, RelayState},
        tcp::TcpTunnelEngine,
    },
};

/// Command-line values that win over the `[agent]` config section.
#[derive(Debug, Clone, Default)]
pub struct AgentOverrides {
    pub relay_url: Option<String>,
    pub project: Option<String>,
    pub local_url: Option<String>,
    pub protocol: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

struct Bootstrap {
    config_path: PathBuf,
    cfg: Config,
    prom: Arc<PrometheusHandle>,
    _logging: logging::LoggingRuntime,
}

fn bootstrap(config_path: Option<PathBuf>) -> anyhow::Result<Bootstrap> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let prom = Arc::new(telemetry::init_prometheus()?);

    Ok(Bootstrap {
        config_path: resolved.path,
        cfg,
        prom,
        _logging: logrt,
    })
}

/// Relay state wired from config.
pub fn build_relay_state(cfg: &RelayConfig) -> Arc<RelayState> {
    let users = StaticUsers::new(cfg.users.clone());
    if users.is_open() {
        tracing::warn!("relay: no users configured; any agent may register");
    }
    let registry = Arc::new(SessionRegistry::new(
        TcpTunnelEngine::new(cfg.tcp_bind_host.clone()),
        Arc::new(users),
        &cfg.public_base_url,
    )
    .with_max_body_bytes(cfg.max_body_bytes));
    Arc::new(RelayState {
        proxy: HttpProxyEngine::new(registry.clone(), cfg.request_timeout, cfg.max_body_bytes),
        registry,
        register_timeout: cfg.register_timeout,
    })
}

fn spawn_admin(
    tasks: &mut JoinSet<anyhow::Result<()>>,
    boot: &Bootstrap,
    registry: Option<Arc<SessionRegistry>>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if boot.cfg.admin_addr.trim().is_empty() {
        return Ok(());
    }
    let admin_addr = net::normalize_bind_addr(&boot.cfg.admin_addr);
    let addr: SocketAddr = admin_addr
        .parse()
        .with_context(|| format!("invalid admin_addr: {}", boot.cfg.admin_addr))?;
    let state = admin::AdminState {
        prom: boot.prom.clone(),
        config_path: boot.config_path.clone(),
        registry,
    };
    tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    Ok(())
}

pub async fn run_relay(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let boot = bootstrap(config_path)?;
    let relay_cfg = boot.cfg.relay.clone();

    tracing::info!(
        config = %boot.config_path.display(),
        listen_addr = %relay_cfg.listen_addr,
        public_base_url = %relay_cfg.public_base_url,
        admin_addr = %boot.cfg.admin_addr,
        users = relay_cfg.users.len(),
        request_timeout = %humantime::format_duration(relay_cfg.request_timeout),
        "burrow: starting relay"
    );

    let state = build_relay_state(&relay_cfg);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    spawn_admin(&mut tasks, &boot, Some(state.registry.clone()), shutdown_rx.clone())?;

    {
        let listen_addr = net::normalize_bind_addr(&relay_cfg.listen_addr).into_owned();
        let shutdown = shutdown_rx.clone();
        let state = state.clone();
        tasks.spawn(async move { server::serve_with_shutdown(&listen_addr, state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    state.registry.close_all();
    drain(tasks).await;
    Ok(())
}

pub async fn run_agent(config_path: Option<PathBuf>, overrides: AgentOverrides) -> anyhow::Result<()> {
    let boot = bootstrap(config_path)?;
    let mut agent_cfg = boot.cfg.agent.clone();

    if let Some(v) = overrides.relay_url {
        agent_cfg.relay_url = v.trim().trim_end_matches('/').to_string();
    }
    if let Some(v) = overrides.project {
        agent_cfg.project = v.trim().to_string();
    }
    if let Some(v) = overrides.local_url {
        agent_cfg.local_url = v.trim().to_string();
    }
    if let Some(v) = overrides.protocol {
        agent_cfg.protocol = config::parse_protocol(&v).context("--protocol")?;
    }
    if let Some(v) = overrides.username {
        agent_cfg.username = Some(v.trim().to_string()).filter(|s| !s.is_empty());
    }
    if let Some(v) = overrides.password {
        agent_cfg.password = Some(v).filter(|s| !s.is_empty());
    }
    if agent_cfg.project.is_empty() {
        anyhow::bail!("agent: project is required (set agent.project or --project)");
    }
    if agent_cfg.local_url.is_empty() {
        anyhow::bail!("agent: local_url is required (set agent.local_url or --local-url)");
    }

    tracing::info!(
        config = %boot.config_path.display(),
        relay_url = %agent_cfg.relay_url,
        project = %agent_cfg.project,
        local_url = %agent_cfg.local_url,
        "burrow: starting agent"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    spawn_admin(&mut tasks, &boot, None, shutdown_rx.clone())?;

    let agent = Agent::new(agent_cfg.options());
    {
        let mut status = agent.subscribe();
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    res = status.changed() => {
                        if res.is_err() {
                            break;
                        }
                        let s = status.borrow_and_update().clone();
                        tracing::info!(status = %s, "agent: status changed");
                    }
                }
            }
            Ok(())
        });
    }

    let handle = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            agent.disconnect();
            let _ = shutdown_tx.send(true);
            drain(tasks).await;
            return Ok(());
        }
        res = agent.connect(&agent_cfg.project, &agent_cfg.local_url) => match res {
            Ok(h) => h,
            Err(err) => {
                let _ = shutdown_tx.send(true);
                drain(tasks).await;
                return Err(err.into());
            }
        },
    };

    for (url, label) in handle.links() {
        tracing::info!(url = %url, label = %label, "agent: link");
    }

    let closed = handle.wait();
    tokio::pin!(closed);
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            agent.disconnect();
            let _ = tokio::time::timeout(Duration::from_secs(5), &mut closed).await;
        }
        _ = &mut closed => {
            tracing::warn!("agent: tunnel closed");
        }
    }

    let _ = shutdown_tx.send(true);
    drain(tasks).await;
    Ok(())
}

/// Waits for tasks to observe shutdown; aborts whatever is still running after 5s.
async fn drain(mut tasks: JoinSet<anyhow::Result<()>>) {
    let wait = async {
        while let Some(_res) = tasks.join_next().await {
            // Tasks are expected to observe shutdown; errors during teardown are ignored.
        }
    };

    // Hard cap so `docker stop` doesn't stall indefinitely.
    if tokio::time::timeout(Duration::from_secs(5), wait).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
