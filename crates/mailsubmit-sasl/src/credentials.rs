//! Credentials and the pull-based provider interface.

use std::fmt;

/// Username and secret (password or access token).
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Authentication identity.
    pub username: String,
    /// Password, or the bearer token for the OAuth mechanisms.
    pub password: String,
}

impl Credentials {
    /// Creates credentials from a username and password.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Source of credentials consulted on demand.
///
/// Implementations typically prompt the user or read a keyring. The engine
/// calls [`get_credentials`](Self::get_credentials) at most once per session
/// and never caches the result beyond it.
pub trait CredentialProvider: Send {
    /// Returns credentials, or `None` if the user declined.
    ///
    /// `username` carries the configured username, if any, so a prompt can
    /// be pre-filled.
    fn get_credentials(&mut self, username: Option<&str>) -> Option<Credentials>;
}

/// Provider returning fixed credentials.
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    /// Creates a provider that always answers with `credentials`.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

impl CredentialProvider for StaticCredentials {
    fn get_credentials(&mut self, _username: Option<&str>) -> Option<Credentials> {
        Some(self.0.clone())
    }
}

impl<F> CredentialProvider for F
where
    F: FnMut(Option<&str>) -> Option<Credentials> + Send,
{
    fn get_credentials(&mut self, username: Option<&str>) -> Option<Credentials> {
        self(username)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new("user@example.com", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("user@example.com"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_closure_provider_sees_username_hint() {
        let mut provider = |hint: Option<&str>| {
            hint.map(|user| Credentials::new(user, "secret"))
        };
        let creds = provider.get_credentials(Some("alice")).unwrap();
        assert_eq!(creds.username, "alice");
        assert!(provider.get_credentials(None).is_none());
    }

    #[test]
    fn test_static_provider() {
        let mut provider = StaticCredentials::new(Credentials::new("a", "b"));
        assert_eq!(
            provider.get_credentials(None),
            Some(Credentials::new("a", "b"))
        );
    }
}
