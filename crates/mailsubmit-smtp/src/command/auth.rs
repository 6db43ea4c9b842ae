//! AUTH (RFC 4954) negotiation loop.
//!
//! Mechanism bytes come from a [`SaslClient`]; this module only frames
//! them, decodes `334` challenges and pulls credentials on demand.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use mailsubmit_sasl::{CredentialProvider, Credentials, SaslClient, Step};

use crate::error::{Error, ErrorKind, Result};
use crate::transaction::{TransactionState, reply_code};
use crate::types::{Capabilities, Reply, ReplyCode};

/// Where AUTH gets credentials from.
///
/// A complete configured pair is used as is. Otherwise the provider is
/// asked, once for the lifetime of the slot, with the configured username
/// as a hint.
#[derive(Default)]
pub struct CredentialSlot {
    username: Option<String>,
    password: Option<String>,
    provider: Option<Box<dyn CredentialProvider>>,
    consulted: bool,
}

impl CredentialSlot {
    /// Creates a slot from configured values.
    #[must_use]
    pub const fn new(username: Option<String>, password: Option<String>) -> Self {
        Self {
            username,
            password,
            provider: None,
            consulted: false,
        }
    }

    /// Sets the interactive provider.
    pub fn set_provider(&mut self, provider: Box<dyn CredentialProvider>) {
        self.provider = Some(provider);
    }

    /// Configured username, if any.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// True if credentials could be produced without asking anyone, or a
    /// provider is available to ask.
    #[must_use]
    pub fn has_source(&self) -> bool {
        self.password.is_some() || (self.provider.is_some() && !self.consulted)
    }

    /// True once the provider has been asked.
    #[must_use]
    pub const fn was_consulted(&self) -> bool {
        self.consulted
    }

    /// Returns credentials, asking the provider if needed.
    pub fn obtain(&mut self) -> Option<Credentials> {
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            return Some(Credentials::new(user.clone(), pass.clone()));
        }
        if self.consulted {
            return None;
        }
        let provider = self.provider.as_mut()?;
        self.consulted = true;
        tracing::debug!(username = ?self.username, "requesting credentials");
        let creds = provider.get_credentials(self.username.as_deref())?;
        // Keep them: a later AUTH in this session must not prompt again.
        self.username = Some(creds.username.clone());
        self.password = Some(creds.password.clone());
        Some(creds)
    }
}

impl fmt::Debug for CredentialSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSlot")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("provider", &self.provider.is_some())
            .field("consulted", &self.consulted)
            .finish()
    }
}

/// State of one AUTH exchange.
#[derive(Debug)]
pub struct Auth {
    client: Box<dyn SaslClient>,
    challenge: Option<Vec<u8>>,
    initial_sent: bool,
    sent_initial_response: bool,
    got_challenge: bool,
}

impl Auth {
    /// Wraps a SASL client.
    #[must_use]
    pub fn new(client: Box<dyn SaslClient>) -> Self {
        Self {
            client,
            challenge: None,
            initial_sent: false,
            sent_initial_response: false,
            got_challenge: false,
        }
    }

    /// Mechanism name.
    #[must_use]
    pub fn mechanism(&self) -> &str {
        self.client.mechanism()
    }

    /// Produces the next line: `AUTH <mech> [<initial-response>]` first,
    /// then one base64 response per challenge.
    pub(crate) fn next_line(&mut self, credentials: &mut CredentialSlot) -> Result<Vec<u8>> {
        let challenge = self.challenge.take();
        let (bytes, more_expected) = match self.step(challenge.as_deref(), credentials)? {
            Step::Continue(bytes) => (bytes, true),
            Step::Done(bytes) => (bytes, false),
            Step::NeedsCredentials => {
                return Err(Error::Auth("No authentication details supplied.".into()));
            }
        };

        let mut line = Vec::with_capacity(bytes.len() * 4 / 3 + 32);
        if self.initial_sent {
            line.extend_from_slice(BASE64.encode(&bytes).as_bytes());
        } else {
            self.initial_sent = true;
            line.extend_from_slice(b"AUTH ");
            line.extend_from_slice(self.client.mechanism().as_bytes());
            if !bytes.is_empty() {
                self.sent_initial_response = true;
                line.push(b' ');
                line.extend_from_slice(BASE64.encode(&bytes).as_bytes());
            } else if !more_expected {
                // RFC 4954: "=" is an empty initial response.
                self.sent_initial_response = true;
                line.extend_from_slice(b" =");
            }
        }
        line.extend_from_slice(b"\r\n");
        Ok(line)
    }

    fn step(&mut self, challenge: Option<&[u8]>, credentials: &mut CredentialSlot) -> Result<Step> {
        match self.client.step(challenge)? {
            Step::NeedsCredentials => {
                let Some(creds) = credentials.obtain() else {
                    return Ok(Step::NeedsCredentials);
                };
                self.client.set_credentials(creds);
                self.client.step(challenge).map_err(Error::from)
            }
            step => Ok(step),
        }
    }

    /// Handles a reply. Returns `Some(true)` when another round trip is
    /// needed, `Some(false)` when done, `None` on failure (recorded in `tx`).
    pub(crate) fn on_reply(
        &mut self,
        reply: &Reply,
        capabilities: &Capabilities,
        tx: &mut TransactionState,
    ) -> Option<bool> {
        if reply.is(ReplyCode::AUTH_CONTINUE) {
            let text = reply.lines().first().map_or("", |l| l.text.trim());
            let Ok(challenge) = BASE64.decode(text) else {
                tx.fail(
                    ErrorKind::AuthenticationFailed,
                    ReplyCode::AUTH_CONTINUE,
                    format!("Invalid base64 in authentication challenge: {text:?}"),
                );
                return None;
            };
            self.got_challenge = true;
            self.challenge = Some(challenge);
            return Some(true);
        }

        if reply.is_success() {
            return Some(false);
        }

        let code = reply_code(reply);
        let mech = self.client.mechanism();
        let untried = !self.got_challenge && !self.sent_initial_response;
        let message = if untried || code == ReplyCode::PARAMETER_NOT_IMPLEMENTED {
            if capabilities.have("AUTH") {
                format!(
                    "Your SMTP server does not support {mech}. \
                     Choose a different authentication method. {}",
                    reply.error_message()
                )
            } else {
                format!(
                    "Your SMTP server does not support authentication. {}",
                    reply.error_message()
                )
            }
        } else {
            format!(
                "Authentication failed. Most likely the password is wrong. {}",
                reply.error_message()
            )
        };
        tx.fail(ErrorKind::AuthenticationFailed, code, message);
        None
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
    use crate::connection::RecipientPolicy;
    use mailsubmit_sasl::mechanism::{CramMd5, Login, Plain};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reply(code: u16, text: &str) -> Reply {
        Reply::single(ReplyCode::new(code), text)
    }

    fn auth_caps() -> Capabilities {
        let mut r = Reply::new();
        r.parse_line(b"250-mx\r\n");
        r.parse_line(b"250 AUTH PLAIN LOGIN\r\n");
        Capabilities::from_ehlo(&r)
    }

    #[test]
    fn test_plain_initial_response() {
        let mut slot = CredentialSlot::new(Some("user".into()), Some("pass".into()));
        let mut auth = Auth::new(Box::new(Plain::default()));
        let line = auth.next_line(&mut slot).unwrap();
        assert_eq!(line, b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n");
        assert!(!slot.was_consulted());
    }

    #[test]
    fn test_login_round_trips() {
        let mut slot = CredentialSlot::new(Some("alice".into()), Some("wonderland".into()));
        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);
        let caps = auth_caps();
        let mut auth = Auth::new(Box::new(Login::default()));

        assert_eq!(auth.next_line(&mut slot).unwrap(), b"AUTH LOGIN\r\n");
        assert_eq!(
            auth.on_reply(&reply(334, "VXNlcm5hbWU6"), &caps, &mut tx),
            Some(true)
        );
        assert_eq!(auth.next_line(&mut slot).unwrap(), b"YWxpY2U=\r\n");
        assert_eq!(
            auth.on_reply(&reply(334, "UGFzc3dvcmQ6"), &caps, &mut tx),
            Some(true)
        );
        assert_eq!(auth.next_line(&mut slot).unwrap(), b"d29uZGVybGFuZA==\r\n");
        assert_eq!(
            auth.on_reply(&reply(235, "2.7.0 Authentication successful"), &caps, &mut tx),
            Some(false)
        );
        assert!(!tx.failed());
    }

    #[test]
    fn test_cram_md5_exchange() {
        let mut slot = CredentialSlot::new(Some("tim".into()), Some("tanstaaftanstaaf".into()));
        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);
        let caps = auth_caps();
        let mut auth = Auth::new(Box::new(CramMd5::default()));

        assert_eq!(auth.next_line(&mut slot).unwrap(), b"AUTH CRAM-MD5\r\n");
        let challenge = BASE64.encode(b"<1896.697170952@postoffice.reston.mci.net>");
        assert_eq!(
            auth.on_reply(&reply(334, &challenge), &caps, &mut tx),
            Some(true)
        );
        let line = auth.next_line(&mut slot).unwrap();
        let expected = BASE64.encode(b"tim b913a602c7eda7a495b4e6e7334d3890");
        assert_eq!(line, format!("{expected}\r\n").into_bytes());
    }

    #[test]
    fn test_provider_asked_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut slot = CredentialSlot::new(Some("hint".into()), None);
        slot.set_provider(Box::new(move |user: Option<&str>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(Credentials::new(user.unwrap_or("nobody"), "secret"))
        }));
        assert!(slot.has_source());

        let first = slot.obtain().unwrap();
        assert_eq!(first.username, "hint");
        let second = slot.obtain().unwrap();
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_declined_prompt_is_auth_error() {
        let mut slot = CredentialSlot::default();
        slot.set_provider(Box::new(|_: Option<&str>| -> Option<Credentials> { None }));
        let mut auth = Auth::new(Box::new(Plain::default()));
        let err = auth.next_line(&mut slot).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert!(err.to_string().contains("No authentication details supplied"));
        assert!(!slot.has_source());
    }

    #[test]
    fn test_wrong_password_message() {
        let mut slot = CredentialSlot::new(Some("u".into()), Some("p".into()));
        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);
        let mut auth = Auth::new(Box::new(Plain::default()));
        auth.next_line(&mut slot).unwrap();
        assert_eq!(
            auth.on_reply(&reply(535, "5.7.8 bad credentials"), &auth_caps(), &mut tx),
            None
        );
        let err = tx.error().unwrap();
        assert_eq!(err.kind, ErrorKind::AuthenticationFailed);
        assert!(err.message.starts_with("Authentication failed. Most likely the password is wrong."));
    }

    #[test]
    fn test_unsupported_mechanism_message() {
        let mut slot = CredentialSlot::new(Some("u".into()), Some("p".into()));
        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);
        let mut auth = Auth::new(Box::new(Login::default()));
        auth.next_line(&mut slot).unwrap();
        auth.on_reply(&reply(504, "unrecognized"), &auth_caps(), &mut tx);
        assert!(
            tx.error()
                .unwrap()
                .message
                .starts_with("Your SMTP server does not support LOGIN.")
        );

        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);
        let mut auth = Auth::new(Box::new(Login::default()));
        auth.next_line(&mut slot).unwrap();
        auth.on_reply(&reply(502, "no"), &Capabilities::default(), &mut tx);
        assert!(
            tx.error()
                .unwrap()
                .message
                .starts_with("Your SMTP server does not support authentication.")
        );
    }

    #[test]
    fn test_bad_base64_challenge() {
        let mut slot = CredentialSlot::new(Some("u".into()), Some("p".into()));
        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);
        let mut auth = Auth::new(Box::new(Login::default()));
        auth.next_line(&mut slot).unwrap();
        assert_eq!(auth.on_reply(&reply(334, "!!!"), &auth_caps(), &mut tx), None);
        assert!(tx.failed());
    }

    #[test]
    fn test_slot_debug_redacts() {
        let slot = CredentialSlot::new(Some("u".into()), Some("hunter2".into()));
        assert!(!format!("{slot:?}").contains("hunter2"));
    }
}
