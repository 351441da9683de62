use std::{fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

static SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{3,50}$").expect("valid route segment regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid route name {0:?} (use 3-50 letters, digits, '_' or '-')")]
pub struct InvalidRouteKey(pub String);

pub fn is_valid_segment(s: &str) -> bool {
    SEGMENT_RE.is_match(s)
}

/// Identifies one tunnel: `project` or `username/project`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RouteKey(String);

impl RouteKey {
    pub fn project(project: &str) -> Result<Self, InvalidRouteKey> {
        let project = project.trim();
        if !is_valid_segment(project) {
            return Err(InvalidRouteKey(project.to_string()));
        }
        Ok(Self(project.to_string()))
    }

    pub fn scoped(username: &str, project: &str) -> Result<Self, InvalidRouteKey> {
        let username = username.trim();
        if !is_valid_segment(username) {
            return Err(InvalidRouteKey(username.to_string()));
        }
        let project = Self::project(project)?;
        Ok(Self(format!("{username}/{}", project.0)))
    }

    /// Builds a key from an optional username (empty means unscoped).
    pub fn from_parts(username: Option<&str>, project: &str) -> Result<Self, InvalidRouteKey> {
        match username.map(str::trim).filter(|u| !u.is_empty()) {
            Some(u) => Self::scoped(u, project),
            None => Self::project(project),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn username(&self) -> Option<&str> {
        self.0.split_once('/').map(|(u, _)| u)
    }
}

impl FromStr for RouteKey {
    type Err = InvalidRouteKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('/') {
            Some((u, p)) => Self::scoped(u, p),
            None => Self::project(s),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the relay reaches the exposed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
    Tcp,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Tcp => "tcp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported protocol {0:?} (expected http|https|tcp)")]
pub struct UnsupportedScheme(pub String);

impl FromStr for Scheme {
    type Err = UnsupportedScheme;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "tcp" => Ok(Scheme::Tcp),
            _ => Err(UnsupportedScheme(s.to_string())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
