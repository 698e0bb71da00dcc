//! Per-connection session state and tenant key namespacing.

use crate::storage::pattern;

/// State owned by a single client connection.
///
/// With authentication enabled every key a client names is rewritten to
/// `"<user>:<key>"`, so two tenants never share a key. Without it keys pass
/// through untouched.
#[derive(Debug, Clone, Default)]
pub struct Session {
    auth_enabled: bool,
    /// Authenticated user; empty while unauthenticated
    user: String,
}

impl Session {
    pub fn new(auth_enabled: bool) -> Self {
        Self {
            auth_enabled,
            user: String::new(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Bind the session to `user`
    pub fn login(&mut self, user: impl Into<String>) {
        self.user = user.into();
    }

    /// Drop any authenticated user
    pub fn logout(&mut self) {
        self.user.clear();
    }

    /// Whether commands other than AUTH and QUIT may run
    pub fn is_authorized(&self) -> bool {
        !self.auth_enabled || !self.user.is_empty()
    }

    /// Storage key for a client-supplied key
    pub fn namespaced(&self, key: &str) -> String {
        if !self.auth_enabled {
            return key.to_string();
        }
        let mut out = String::with_capacity(self.user.len() + 1 + key.len());
        out.push_str(&self.user);
        out.push(':');
        out.push_str(key);
        out
    }

    /// Storage pattern for a client-supplied KEYS/SCAN pattern. The tenant
    /// prefix is escaped so it only ever matches literally.
    pub fn namespaced_pattern(&self, glob: &str) -> String {
        if !self.auth_enabled {
            return glob.to_string();
        }
        format!("{}:{}", pattern::escape(&self.user), glob)
    }

    /// Length of the prefix [`Session::namespaced`] adds
    pub fn prefix_len(&self) -> usize {
        if self.auth_enabled {
            self.user.len() + 1
        } else {
            0
        }
    }

    /// Client-visible form of a storage key
    pub fn strip<'a>(&self, key: &'a str) -> &'a str {
        key.get(self.prefix_len()..).unwrap_or(key)
    }
}
