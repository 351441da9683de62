use std::collections::HashMap;

/// Decides whether a registration may claim a route.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, username: Option<&str>, password: Option<&str>, project: &str) -> bool;
}

/// Fixed username/password table from the relay config.
///
/// An empty table accepts everyone. Otherwise a known username with the
/// matching password is required.
#[derive(Debug, Clone, Default)]
pub struct StaticUsers {
    users: HashMap<String, String>,
}

impl StaticUsers {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    pub fn is_open(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authenticator for StaticUsers {
    fn authenticate(&self, username: Option<&str>, password: Option<&str>, _project: &str) -> bool {
        if self.users.is_empty() {
            return true;
        }
        let Some(username) = username.map(str::trim).filter(|u| !u.is_empty()) else {
            return false;
        };
        match self.users.get(username) {
            Some(expected) => password.unwrap_or_default() == expected.as_str(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_allows_anonymous() {
        let a = StaticUsers::default();
        assert!(a.is_open());
        assert!(a.authenticate(None, None, "demo"));
    }

    #[test]
    fn configured_users_require_matching_password() {
        let a = StaticUsers::new(HashMap::from([("alice".to_string(), "s3cret".to_string())]));
        assert!(a.authenticate(Some("alice"), Some("s3cret"), "demo"));
        assert!(!a.authenticate(Some("alice"), Some("wrong"), "demo"));
        assert!(!a.authenticate(Some("alice"), None, "demo"));
        assert!(!a.authenticate(Some("bob"), Some("s3cret"), "demo"));
        assert!(!a.authenticate(None, None, "demo"));
    }
}
