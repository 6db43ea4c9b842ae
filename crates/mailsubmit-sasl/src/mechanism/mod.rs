//! Built-in SASL mechanisms.

mod cram_md5;
mod login;
mod oauth;
mod plain;

use crate::error::{Error, Result};
use crate::{Authenticator, SaslClient};

pub use cram_md5::{CramMd5, cram_md5_response};
pub use login::Login;
pub use oauth::{OAuthBearer, XOAuth2, oauthbearer_response, xoauth2_response};
pub use plain::{Plain, plain_response};

/// SASL mechanism implemented by [`BuiltinAuthenticator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// PLAIN - plaintext authentication
    Plain,
    /// LOGIN - legacy plaintext
    Login,
    /// CRAM-MD5 - challenge-response
    CramMd5,
    /// `XOAUTH2` - `OAuth2` (Google/Microsoft)
    XOAuth2,
    /// `OAUTHBEARER` - RFC 7628 `OAuth2`
    OAuthBearer,
}

impl Mechanism {
    /// Order used when negotiating automatically, strongest first.
    pub const PREFERENCE: [Self; 5] = [
        Self::CramMd5,
        Self::Plain,
        Self::Login,
        Self::XOAuth2,
        Self::OAuthBearer,
    ];

    /// Parses a mechanism name (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "CRAM-MD5" => Some(Self::CramMd5),
            "XOAUTH2" => Some(Self::XOAuth2),
            "OAUTHBEARER" => Some(Self::OAuthBearer),
            _ => None,
        }
    }

    /// Returns the mechanism name as sent on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
            Self::XOAuth2 => "XOAUTH2",
            Self::OAuthBearer => "OAUTHBEARER",
        }
    }

    /// Picks the preferred mechanism among `offered`.
    #[must_use]
    pub fn select(offered: &[String]) -> Option<Self> {
        let offered: Vec<Self> = offered.iter().filter_map(|m| Self::parse(m)).collect();
        Self::PREFERENCE
            .into_iter()
            .find(|mech| offered.contains(mech))
    }

    fn client(self, host: &str) -> Box<dyn SaslClient> {
        match self {
            Self::Plain => Box::new(Plain::default()),
            Self::Login => Box::new(Login::default()),
            Self::CramMd5 => Box::new(CramMd5::default()),
            Self::XOAuth2 => Box::new(XOAuth2::default()),
            Self::OAuthBearer => Box::new(OAuthBearer::new(host)),
        }
    }
}

impl std::fmt::Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// [`Authenticator`] backed by the mechanisms in this module.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinAuthenticator;

impl BuiltinAuthenticator {
    /// Creates the built-in authenticator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Authenticator for BuiltinAuthenticator {
    fn new_client(
        &self,
        mechanisms: &[String],
        service: &str,
        host: &str,
    ) -> Result<Box<dyn SaslClient>> {
        let mechanism = Mechanism::select(mechanisms)
            .ok_or_else(|| Error::NoUsableMechanism(mechanisms.join(" ")))?;
        tracing::debug!(%mechanism, service, host, "selected SASL mechanism");
        Ok(mechanism.client(host))
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

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Mechanism::parse("plain"), Some(Mechanism::Plain));
        assert_eq!(Mechanism::parse("Cram-Md5"), Some(Mechanism::CramMd5));
        assert_eq!(Mechanism::parse("GSSAPI"), None);
    }

    #[test]
    fn as_str() {
        assert_eq!(Mechanism::Plain.as_str(), "PLAIN");
        assert_eq!(Mechanism::Login.as_str(), "LOGIN");
        assert_eq!(Mechanism::CramMd5.as_str(), "CRAM-MD5");
        assert_eq!(Mechanism::XOAuth2.as_str(), "XOAUTH2");
        assert_eq!(Mechanism::OAuthBearer.as_str(), "OAUTHBEARER");
    }

    #[test]
    fn select_prefers_strongest() {
        let offered = names(&["LOGIN", "PLAIN", "CRAM-MD5"]);
        assert_eq!(Mechanism::select(&offered), Some(Mechanism::CramMd5));

        let offered = names(&["LOGIN", "PLAIN"]);
        assert_eq!(Mechanism::select(&offered), Some(Mechanism::Plain));
    }

    #[test]
    fn select_skips_unknown() {
        let offered = names(&["GSSAPI", "NTLM", "login"]);
        assert_eq!(Mechanism::select(&offered), Some(Mechanism::Login));
        assert_eq!(Mechanism::select(&names(&["GSSAPI"])), None);
    }

    #[test]
    fn builtin_reports_unusable_list() {
        let err = BuiltinAuthenticator::new()
            .new_client(&names(&["GSSAPI", "NTLM"]), "smtp", "mx.example.com")
            .unwrap_err();
        assert_eq!(err, Error::NoUsableMechanism("GSSAPI NTLM".into()));
    }

    #[test]
    fn builtin_forced_mechanism() {
        let client = BuiltinAuthenticator::new()
            .new_client(&names(&["XOAUTH2"]), "smtp", "mx.example.com")
            .unwrap();
        assert_eq!(client.mechanism(), "XOAUTH2");
    }
}
