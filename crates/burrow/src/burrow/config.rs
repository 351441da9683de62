use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::burrow::{
    agent::{AgentOptions, dialer::RetryPolicy},
    net,
    tunnel::route::Scheme,
};

pub const CONFIG_ENV: &str = "BURROW_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    // clap fills the flag from BURROW_CONFIG too; tell the two apart for the log line.
    let from_env = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty());

    if let Some(p) = explicit_flag_path {
        let source = match &from_env {
            Some(env) if Path::new(env) == p => ConfigPathSource::Env,
            _ => ConfigPathSource::Flag,
        };
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source,
        });
    }

    if let Some(p) = from_env {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(Path::new(&p))?,
            source: ConfigPathSource::Env,
        });
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("burrow.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["burrow.toml", "burrow.yaml", "burrow.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no burrow.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/burrow/burrow.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "burrow", "burrow")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("burrow.toml"))
    }
}

/// Writes the default template to `path` unless a file is already there.
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: String,
    /// Prefix of public URLs handed back on registration.
    pub public_base_url: String,
    pub tcp_bind_host: String,
    pub request_timeout: Duration,
    pub register_timeout: Duration,
    pub max_body_bytes: usize,
    /// username -> password. Empty means registrations need no credentials.
    pub users: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub relay_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub project: String,
    pub local_url: String,
    pub protocol: Option<Scheme>,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub keepalive_interval: Duration,
    pub probe_timeout: Duration,
    pub forward_timeout: Duration,
    pub register_timeout: Duration,
    pub max_response_bytes: usize,
}

impl AgentConfig {
    pub fn options(&self) -> AgentOptions {
        AgentOptions {
            relay_url: self.relay_url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            protocol: self.protocol,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                backoff_base: self.backoff_base,
            },
            keepalive_interval: self.keepalive_interval,
            probe_timeout: self.probe_timeout,
            forward_timeout: self.forward_timeout,
            register_timeout: self.register_timeout,
            max_response_bytes: self.max_response_bytes,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    relay: Option<FileRelay>,
    agent: Option<FileAgent>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRelay {
    listen_addr: Option<String>,
    public_base_url: Option<String>,
    tcp_bind_host: Option<String>,
    request_timeout_ms: Option<i64>,
    register_timeout_ms: Option<i64>,
    max_body_bytes: Option<i64>,
    #[serde(default)]
    users: Vec<FileUser>,
}

#[derive(Debug, Deserialize)]
struct FileUser {
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAgent {
    relay_url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    project: Option<String>,
    local_url: Option<String>,
    protocol: Option<String>,
    max_attempts: Option<i64>,
    backoff_base_ms: Option<i64>,
    keepalive_interval_ms: Option<i64>,
    probe_timeout_ms: Option<i64>,
    forward_timeout_ms: Option<i64>,
    register_timeout_ms: Option<i64>,
    max_response_bytes: Option<i64>,
}

/// Non-positive or missing values fall back to `default_ms`.
fn duration_ms(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default_ms),
    }
}

fn trimmed(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parses an optional scheme; empty or `auto` means "probe".
pub fn parse_protocol(s: &str) -> anyhow::Result<Option<Scheme>> {
    match s.trim().to_ascii_lowercase().as_str() {
        "" | "auto" => Ok(None),
        other => Ok(Some(other.parse()?)),
    }
}

impl Default for Config {
    fn default() -> Self {
        let listen_addr = ":8000".to_string();
        Config {
            admin_addr: String::new(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            relay: RelayConfig {
                public_base_url: net::default_public_base_url(&listen_addr),
                listen_addr,
                tcp_bind_host: "0.0.0.0".into(),
                request_timeout: Duration::from_secs(30),
                register_timeout: Duration::from_secs(60),
                max_body_bytes: 10 * 1024 * 1024,
                users: HashMap::new(),
            },
            agent: AgentConfig {
                relay_url: "ws://127.0.0.1:8000".into(),
                username: None,
                password: None,
                project: String::new(),
                local_url: String::new(),
                protocol: None,
                max_attempts: 5,
                backoff_base: Duration::from_secs(2),
                keepalive_interval: Duration::from_secs(15),
                probe_timeout: Duration::from_secs(5),
                forward_timeout: Duration::from_secs(60),
                register_timeout: Duration::from_secs(10),
                max_response_bytes: 10 * 1024 * 1024,
            },
        }
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            ..Config::default()
        };

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = trimmed(&l.level) {
                cfg.logging.level = level;
            }
            if let Some(fmt) = trimmed(&l.format) {
                cfg.logging.format = fmt;
            }
            if let Some(out) = trimmed(&l.output) {
                cfg.logging.output = out;
            }
            cfg.logging.add_source = l.add_source;
        }

        // --- Relay ---
        if let Some(r) = &fc.relay {
            let relay = &mut cfg.relay;
            if let Some(addr) = trimmed(&r.listen_addr) {
                relay.listen_addr = addr;
            }
            relay.public_base_url = trimmed(&r.public_base_url)
                .unwrap_or_else(|| net::default_public_base_url(&relay.listen_addr))
                .trim_end_matches('/')
                .to_string();
            if let Some(host) = trimmed(&r.tcp_bind_host) {
                relay.tcp_bind_host = host;
            }
            relay.request_timeout = duration_ms(r.request_timeout_ms, 30_000);
            relay.register_timeout = duration_ms(r.register_timeout_ms, 60_000);
            if let Some(n) = r.max_body_bytes.filter(|n| *n > 0) {
                relay.max_body_bytes = n as usize;
            }

            for (i, u) in r.users.iter().enumerate() {
                let name = u.username.trim();
                if name.is_empty() {
                    anyhow::bail!("config: relay.users[{}] missing username", i);
                }
                if relay
                    .users
                    .insert(name.to_string(), u.password.clone())
                    .is_some()
                {
                    anyhow::bail!("config: relay.users[{}] duplicate username {:?}", i, name);
                }
            }
        }

        // --- Agent ---
        if let Some(a) = &fc.agent {
            let agent = &mut cfg.agent;
            if let Some(url) = trimmed(&a.relay_url) {
                agent.relay_url = url.trim_end_matches('/').to_string();
            }
            agent.username = trimmed(&a.username);
            agent.password = a.password.clone().filter(|p| !p.is_empty());
            agent.project = trimmed(&a.project).unwrap_or_default();
            agent.local_url = trimmed(&a.local_url).unwrap_or_default();
            agent.protocol = parse_protocol(a.protocol.as_deref().unwrap_or(""))
                .context("config: agent.protocol")?;
            if let Some(n) = a.max_attempts.filter(|n| *n > 0) {
                agent.max_attempts = n.min(u32::MAX as i64) as u32;
            }
            agent.backoff_base = duration_ms(a.backoff_base_ms, 2_000);
            agent.keepalive_interval = duration_ms(a.keepalive_interval_ms, 15_000);
            agent.probe_timeout = duration_ms(a.probe_timeout_ms, 5_000);
            agent.forward_timeout = duration_ms(a.forward_timeout_ms, 60_000);
            agent.register_timeout = duration_ms(a.register_timeout_ms, 10_000);
            if let Some(n) = a.max_response_bytes.filter(|n| *n > 0) {
                agent.max_response_bytes = n as usize;
            }
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# burrow configuration (auto-generated)
#
# This file was created because burrow could not find a configuration file at
# the resolved config path. It runs a relay on :8000 as-is.
#
# `burrow relay` reads [relay]; `burrow agent` reads [agent].

admin_addr = ":9090"

[relay]
listen_addr = ":8000"
# public_base_url = "https://tunnel.example.com"
tcp_bind_host = "0.0.0.0"
request_timeout_ms = 30000
register_timeout_ms = 60000
max_body_bytes = 10485760

# [[relay.users]]
# username = "alice"
# password = "change-me"

[agent]
relay_url = "ws://127.0.0.1:8000"
project = ""
local_url = "localhost:3000"
protocol = "" # "" (probe) | http | https | tcp
max_attempts = 5
backoff_base_ms = 2000
keepalive_interval_ms = 15000
max_response_bytes = 10485760

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# burrow configuration (auto-generated)
#
# This file was created because burrow could not find a configuration file at
# the resolved config path. It runs a relay on :8000 as-is.
#
# `burrow relay` reads relay; `burrow agent` reads agent.

admin_addr: ":9090"

relay:
  listen_addr: ":8000"
  # public_base_url: "https://tunnel.example.com"
  tcp_bind_host: "0.0.0.0"
  request_timeout_ms: 30000
  register_timeout_ms: 60000
  max_body_bytes: 10485760
  users: []

agent:
  relay_url: "ws://127.0.0.1:8000"
  project: ""
  local_url: "localhost:3000"
  protocol: "" # "" (probe) | http | https | tcp
  max_attempts: 5
  backoff_base_ms: 2000
  keepalive_interval_ms: 15000
  max_response_bytes: 10485760

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "burrow_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn templates_load_with_defaults() {
        for name in ["burrow.toml", "burrow.yaml"] {
            let dir = temp_dir("templates");
            let cfg_path = dir.join(name);
            assert!(ensure_config_file(&cfg_path).expect("ensure"));
            assert!(!ensure_config_file(&cfg_path).expect("ensure again"));

            let cfg = load_config(&cfg_path).expect("load_config");
            assert_eq!(cfg.admin_addr, ":9090");
            assert_eq!(cfg.relay.listen_addr, ":8000");
            assert_eq!(cfg.relay.public_base_url, "http://localhost:8000");
            assert_eq!(cfg.relay.request_timeout, Duration::from_secs(30));
            assert!(cfg.relay.users.is_empty());
            assert_eq!(cfg.agent.protocol, None);
            assert_eq!(cfg.agent.max_attempts, 5);
            assert_eq!(cfg.agent.local_url, "localhost:3000");
            assert_eq!(cfg.agent.max_response_bytes, 10 * 1024 * 1024);

            let _ = std::fs::remove_dir_all(&dir);
        }
    }

    #[test]
    fn relay_users_and_overrides() {
        let dir = temp_dir("relay");
        let cfg_path = dir.join("burrow.toml");

        let toml = r#"
[relay]
listen_addr = "127.0.0.1:9000"
public_base_url = "https://t.example.com/"
request_timeout_ms = 0

[[relay.users]]
username = " alice "
password = "pw"
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.relay.public_base_url, "https://t.example.com");
        assert_eq!(cfg.relay.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.relay.users.get("alice").map(String::as_str), Some("pw"));

        let dup = r#"
[[relay.users]]
username = "a"
[[relay.users]]
username = "a"
"#;
        std::fs::write(&cfg_path, format!("[relay]\n{dup}")).expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate username"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn agent_protocol_is_validated() {
        let dir = temp_dir("agent_proto");
        let cfg_path = dir.join("burrow.yaml");

        std::fs::write(
            &cfg_path,
            "agent:\n  protocol: TCP\n  backoff_base_ms: 50\n  max_response_bytes: 4096\n",
        )
        .expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.agent.options().max_response_bytes, 4096);
        assert_eq!(cfg.agent.protocol, Some(Scheme::Tcp));
        assert_eq!(cfg.agent.backoff_base, Duration::from_millis(50));
        assert_eq!(cfg.agent.options().retry.backoff_base, Duration::from_millis(50));

        std::fs::write(&cfg_path, "agent:\n  protocol: udp\n").expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        assert!(format!("{err:#}").contains("agent.protocol"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reject_unknown_top_level_fields() {
        let dir = temp_dir("unknown");
        let cfg_path = dir.join("burrow.toml");

        std::fs::write(&cfg_path, "routes = []\n").expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        let msg = format!("{err:#}").to_ascii_lowercase();
        assert!(msg.contains("routes"), "expected error mentioning routes, got: {msg}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_directory_resolves_to_burrow_toml() {
        let dir = temp_dir("explicit_dir");
        let resolved = normalize_explicit_path(&dir).expect("normalize");
        assert_eq!(resolved, dir.join("burrow.toml"));

        let bare = dir.join("custom");
        assert_eq!(
            normalize_explicit_path(&bare).expect("normalize"),
            dir.join("custom.toml")
        );

        let _ = std::fs::remove_dir_all(&dir);
    }
}
