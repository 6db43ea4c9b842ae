//! PLAIN (RFC 4616).

use crate::error::{Error, Result};
use crate::{Credentials, SaslClient, Step};

/// Builds the PLAIN message: `\0<username>\0<password>`.
///
/// The first NUL separates the empty authorization identity, which the
/// server then derives from the authentication identity.
#[must_use]
pub fn plain_response(username: &str, password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(username.len() + password.len() + 2);
    out.push(0);
    out.extend_from_slice(username.as_bytes());
    out.push(0);
    out.extend_from_slice(password.as_bytes());
    out
}

/// PLAIN client. Sends everything as the initial response.
#[derive(Debug, Default)]
pub struct Plain {
    credentials: Option<Credentials>,
    sent: bool,
}

impl SaslClient for Plain {
    fn mechanism(&self) -> &str {
        "PLAIN"
    }

    fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
    }

    fn step(&mut self, challenge: Option<&[u8]>) -> Result<Step> {
        // A server that did not take the initial response asks with an
        // empty challenge; anything else after we sent is an error.
        if self.sent && challenge.is_some_and(|c| !c.is_empty()) {
            return Err(Error::AlreadyComplete("PLAIN"));
        }
        let Some(creds) = &self.credentials else {
            return Ok(Step::NeedsCredentials);
        };
        self.sent = true;
        Ok(Step::Done(plain_response(&creds.username, &creds.password)))
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
    fn test_plain_response_format() {
        assert_eq!(plain_response("test", "pass"), b"\0test\0pass");
    }

    #[test]
    fn test_plain_response_special_chars() {
        assert_eq!(plain_response("user", "pass@word!"), b"\0user\0pass@word!");
    }

    #[test]
    fn test_plain_asks_for_credentials_first() {
        let mut client = Plain::default();
        assert_eq!(client.step(None).unwrap(), Step::NeedsCredentials);
        client.set_credentials(Credentials::new("user", "pass"));
        assert_eq!(
            client.step(None).unwrap(),
            Step::Done(b"\0user\0pass".to_vec())
        );
    }

    #[test]
    fn test_plain_answers_empty_challenge() {
        let mut client = Plain::default();
        client.set_credentials(Credentials::new("user", "pass"));
        assert_eq!(
            client.step(Some(b"")).unwrap(),
            Step::Done(b"\0user\0pass".to_vec())
        );
    }

    #[test]
    fn test_plain_rejects_challenge_after_done() {
        let mut client = Plain::default();
        client.set_credentials(Credentials::new("user", "pass"));
        client.step(None).unwrap();
        assert!(client.step(Some(b"more?")).is_err());
    }
}
