use std::{borrow::Cow, fmt, str::FromStr, sync::LazyLock};

use regex::Regex;

static LOCAL_TARGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w.-]+:\d+$").expect("valid local target regex"));

/// Normalize a bind/listen address.
///
/// Configs commonly use the shorthand `":PORT"` to mean "bind on all interfaces".
/// Tokio bind APIs do not accept `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Public base URL used when the relay config does not set one.
pub fn default_public_base_url(listen_addr: &str) -> String {
    let addr = normalize_bind_addr(listen_addr);
    let addr = addr
        .strip_prefix("0.0.0.0")
        .map(|rest| format!("localhost{rest}"))
        .unwrap_or_else(|| addr.to_string());
    format!("http://{addr}")
}

/// Host part of a base URL such as `https://relay.example.com:8443/`.
pub fn host_of_base_url(base: &str) -> &str {
    let rest = base
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(base);
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.starts_with('[') {
        return authority
            .split_once(']')
            .map(|(h, _)| &h[1..])
            .unwrap_or(authority);
    }
    authority.split(':').next().unwrap_or(authority)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid local target {0:?} (expected host:port)")]
pub struct InvalidTarget(pub String);

/// `host:port` address of the service the agent exposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalTarget {
    pub host: String,
    pub port: u16,
}

impl FromStr for LocalTarget {
    type Err = InvalidTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if !LOCAL_TARGET_RE.is_match(s) {
            return Err(InvalidTarget(s.to_string()));
        }
        let (host, port) = s.rsplit_once(':').ok_or_else(|| InvalidTarget(s.to_string()))?;
        let port: u16 = port.parse().map_err(|_| InvalidTarget(s.to_string()))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for LocalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
    }

    #[test]
    fn local_target_accepts_host_port() {
        let t: LocalTarget = "localhost:3000".parse().unwrap();
        assert_eq!(t.host, "localhost");
        assert_eq!(t.port, 3000);
        assert_eq!(t.to_string(), "localhost:3000");

        let t: LocalTarget = " my-box.lan:8080 ".parse().unwrap();
        assert_eq!(t.host, "my-box.lan");
    }

    #[test]
    fn local_target_rejects_garbage() {
        for bad in ["localhost", "http://localhost:3000", ":80", "host:port", "a:99999", ""] {
            assert!(bad.parse::<LocalTarget>().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn base_url_helpers() {
        assert_eq!(default_public_base_url(":8000"), "http://localhost:8000");
        assert_eq!(
            default_public_base_url("10.0.0.5:80"),
            "http://10.0.0.5:80"
        );
        assert_eq!(host_of_base_url("https://relay.example.com:8443/x"), "relay.example.com");
        assert_eq!(host_of_base_url("http://[::1]:80"), "::1");
        assert_eq!(host_of_base_url("relay.local"), "relay.local");
    }
}
