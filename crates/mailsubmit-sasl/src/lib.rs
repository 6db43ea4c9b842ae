//! # mailsubmit-sasl
//!
//! Client-side SASL for mail submission.
//!
//! The SMTP engine never produces mechanism bytes itself. It asks an
//! [`Authenticator`] for a [`SaslClient`] matching the mechanisms on offer,
//! then drives the client one [`Step`] at a time, feeding it decoded server
//! challenges. A client that cannot continue without a username and password
//! answers [`Step::NeedsCredentials`]; the engine pulls them from a
//! [`CredentialProvider`] and hands them back with
//! [`SaslClient::set_credentials`].
//!
//! ## Built-in mechanisms
//!
//! - PLAIN (RFC 4616)
//! - LOGIN (draft-murchison-sasl-login)
//! - CRAM-MD5 (RFC 2195)
//! - XOAUTH2 (Google/Microsoft proprietary)
//! - OAUTHBEARER (RFC 7628)
//!
//! ## Example
//!
//! ```
//! use mailsubmit_sasl::{Authenticator, BuiltinAuthenticator, Credentials, SaslClient, Step};
//!
//! let offered = vec!["LOGIN".to_string(), "PLAIN".to_string()];
//! let mut client = BuiltinAuthenticator::new()
//!     .new_client(&offered, "smtp", "smtp.example.com")
//!     .unwrap();
//! assert_eq!(client.mechanism(), "PLAIN");
//!
//! assert_eq!(client.step(None).unwrap(), Step::NeedsCredentials);
//! client.set_credentials(Credentials::new("user", "pass"));
//! assert_eq!(client.step(None).unwrap(), Step::Done(b"\0user\0pass".to_vec()));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod credentials;
mod error;
pub mod mechanism;

use std::fmt;

pub use credentials::{CredentialProvider, Credentials, StaticCredentials};
pub use error::{Error, Result};
pub use mechanism::{BuiltinAuthenticator, Mechanism};

/// Outcome of one client step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send these bytes and expect another challenge.
    Continue(Vec<u8>),
    /// Send these bytes; the client has nothing further to say.
    Done(Vec<u8>),
    /// The client needs a username and password before it can answer.
    NeedsCredentials,
}

/// One in-progress SASL exchange.
pub trait SaslClient: Send + fmt::Debug {
    /// Name of the mechanism as sent after `AUTH`.
    fn mechanism(&self) -> &str;

    /// Supplies credentials after [`Step::NeedsCredentials`].
    fn set_credentials(&mut self, credentials: Credentials);

    /// Advances the exchange.
    ///
    /// `challenge` is `None` for the initial response and the decoded
    /// server challenge afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the mechanism cannot produce a response.
    fn step(&mut self, challenge: Option<&[u8]>) -> Result<Step>;
}

/// Factory for SASL clients.
pub trait Authenticator: Send + Sync {
    /// Creates a client for the best mechanism in `mechanisms`.
    ///
    /// `service` is the GSSAPI-style service name (`"smtp"`), `host` the
    /// server's fully qualified name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoUsableMechanism`] if nothing in the list is supported.
    fn new_client(
        &self,
        mechanisms: &[String],
        service: &str,
        host: &str,
    ) -> Result<Box<dyn SaslClient>>;
}
