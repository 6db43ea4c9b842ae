//! Connection configuration types.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// Port for message submission with STARTTLS (RFC 6409).
pub const SUBMISSION_PORT: u16 = 587;

/// Port for submission over implicit TLS (RFC 8314).
pub const SUBMISSIONS_PORT: u16 = 465;

/// Whether to use STARTTLS on a plaintext connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Upgrade if the server offers STARTTLS.
    #[default]
    UseIfAvailable,
    /// Always send STARTTLS, even if not advertised; fail if refused.
    Force,
    /// Never send STARTTLS. **Not recommended outside tests.**
    ForceNone,
}

/// What a rejected recipient does to the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecipientPolicy {
    /// Any rejected recipient fails the whole message.
    #[default]
    RejectAny,
    /// Deliver to the accepted recipients and report the rejected ones.
    AllowPartial,
}

/// SMTP session configuration.
#[derive(Clone)]
pub struct Config {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// TLS from the first byte (port 465).
    pub implicit_tls: bool,
    /// STARTTLS policy for plaintext connections.
    pub tls_policy: TlsPolicy,
    /// Name sent with EHLO/HELO. Defaults to the local address literal.
    pub local_hostname: Option<String>,
    /// Force a SASL mechanism instead of negotiating.
    pub sasl_mechanism: Option<String>,
    /// Username for AUTH.
    pub username: Option<String>,
    /// Password (or OAuth token) for AUTH.
    pub password: Option<String>,
    /// Allow pipelining when the server advertises it.
    pub pipelining: bool,
    /// Handling of rejected recipients.
    pub recipient_policy: RecipientPolicy,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Timeout for each line read from the server.
    pub io_timeout: Duration,
}

impl Config {
    /// Creates a configuration for `host` with defaults (port 587, STARTTLS
    /// if available).
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        ConfigBuilder::new(host).build()
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(host)
    }

    /// Checks the values that end up verbatim on a command line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the EHLO name or the forced
    /// mechanism is empty or contains whitespace or control characters.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.local_hostname {
            check_token("local hostname", name)?;
        }
        if let Some(mechanism) = &self.sasl_mechanism {
            check_token("SASL mechanism", mechanism)?;
        }
        Ok(())
    }
}

fn check_token(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidRequest(format!("The {what} is empty.")));
    }
    if value
        .bytes()
        .any(|b| b.is_ascii_control() || b.is_ascii_whitespace())
    {
        return Err(Error::InvalidRequest(format!(
            "The {what} contains forbidden characters: {value:?}"
        )));
    }
    Ok(())
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("implicit_tls", &self.implicit_tls)
            .field("tls_policy", &self.tls_policy)
            .field("local_hostname", &self.local_hostname)
            .field("sasl_mechanism", &self.sasl_mechanism)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("pipelining", &self.pipelining)
            .field("recipient_policy", &self.recipient_policy)
            .field("connect_timeout", &self.connect_timeout)
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
    port: Option<u16>,
}

impl ConfigBuilder {
    /// Creates a new builder with the given hostname.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            config: Config {
                host: host.into(),
                port: SUBMISSION_PORT,
                implicit_tls: false,
                tls_policy: TlsPolicy::UseIfAvailable,
                local_hostname: None,
                sasl_mechanism: None,
                username: None,
                password: None,
                pipelining: true,
                recipient_policy: RecipientPolicy::RejectAny,
                connect_timeout: Duration::from_secs(30),
                io_timeout: Duration::from_secs(60),
            },
            port: None,
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Uses TLS from the first byte.
    #[must_use]
    pub const fn implicit_tls(mut self, enabled: bool) -> Self {
        self.config.implicit_tls = enabled;
        self
    }

    /// Sets the STARTTLS policy.
    #[must_use]
    pub const fn tls_policy(mut self, policy: TlsPolicy) -> Self {
        self.config.tls_policy = policy;
        self
    }

    /// Sets the name sent with EHLO/HELO.
    #[must_use]
    pub fn local_hostname(mut self, name: impl Into<String>) -> Self {
        self.config.local_hostname = Some(name.into());
        self
    }

    /// Forces a SASL mechanism.
    #[must_use]
    pub fn sasl_mechanism(mut self, mechanism: impl Into<String>) -> Self {
        self.config.sasl_mechanism = Some(mechanism.into());
        self
    }

    /// Sets username and password.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self.config.password = Some(password.into());
        self
    }

    /// Sets only the username; the password is requested on demand.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    /// Enables or disables pipelining.
    #[must_use]
    pub const fn pipelining(mut self, enabled: bool) -> Self {
        self.config.pipelining = enabled;
        self
    }

    /// Sets the recipient policy.
    #[must_use]
    pub const fn recipient_policy(mut self, policy: RecipientPolicy) -> Self {
        self.config.recipient_policy = policy;
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets the I/O timeout.
    #[must_use]
    pub const fn io_timeout(mut self, timeout: Duration) -> Self {
        self.config.io_timeout = timeout;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        let default_port = if self.config.implicit_tls {
            SUBMISSIONS_PORT
        } else {
            SUBMISSION_PORT
        };
        Config {
            port: self.port.unwrap_or(default_port),
            ..self.config
        }
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
    fn test_defaults() {
        let config = Config::new("smtp.example.com");
        assert_eq!(config.host, "smtp.example.com");
        assert_eq!(config.port, 587);
        assert!(!config.implicit_tls);
        assert_eq!(config.tls_policy, TlsPolicy::UseIfAvailable);
        assert!(config.pipelining);
        assert_eq!(config.recipient_policy, RecipientPolicy::RejectAny);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.io_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_implicit_tls_port() {
        let config = Config::builder("smtp.example.com").implicit_tls(true).build();
        assert_eq!(config.port, 465);

        let config = Config::builder("smtp.example.com")
            .implicit_tls(true)
            .port(2465)
            .build();
        assert_eq!(config.port, 2465);
    }

    #[test]
    fn test_builder_setters() {
        let config = Config::builder("smtp.example.com")
            .tls_policy(TlsPolicy::Force)
            .local_hostname("client.example.org")
            .sasl_mechanism("LOGIN")
            .credentials("user", "pass")
            .pipelining(false)
            .recipient_policy(RecipientPolicy::AllowPartial)
            .io_timeout(Duration::from_secs(5))
            .build();
        assert_eq!(config.tls_policy, TlsPolicy::Force);
        assert_eq!(config.local_hostname.as_deref(), Some("client.example.org"));
        assert_eq!(config.sasl_mechanism.as_deref(), Some("LOGIN"));
        assert_eq!(config.username.as_deref(), Some("user"));
        assert!(!config.pipelining);
        assert_eq!(config.recipient_policy, RecipientPolicy::AllowPartial);
        assert_eq!(config.io_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_validate_accepts_names_and_literals() {
        let config = Config::builder("h")
            .local_hostname("client.example.org")
            .sasl_mechanism("CRAM-MD5")
            .build();
        assert!(config.validate().is_ok());
        assert!(Config::builder("h").local_hostname("[IPv6:::1]").build().validate().is_ok());
        assert!(Config::new("h").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_command_injection() {
        for name in ["evil\r\nRSET", "two words", "tab\there", ""] {
            let err = Config::builder("h").local_hostname(name).build().validate().unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRequest, "{name:?}");
        }
        let err = Config::builder("h")
            .sasl_mechanism("PLAIN\r\nQUIT")
            .build()
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("SASL mechanism"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = Config::builder("h").credentials("user", "hunter2").build();
        let debug = format!("{config:?}");
        assert!(debug.contains("user"));
        assert!(!debug.contains("hunter2"));
    }
}
