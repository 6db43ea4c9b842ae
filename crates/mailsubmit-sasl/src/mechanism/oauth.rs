//! OAuth 2.0 bearer-token mechanisms.
//!
//! Both carry the access token in [`Credentials::password`]. On a failed
//! token the server answers with a base64 JSON error challenge and waits
//! for a dummy response before sending the final 535; the clients answer
//! that challenge so the exchange can finish.

use crate::error::{Error, Result};
use crate::{Credentials, SaslClient, Step};

/// `XOAUTH2` initial response: `user=<user>\x01auth=Bearer <token>\x01\x01`.
#[must_use]
pub fn xoauth2_response(user: &str, token: &str) -> Vec<u8> {
    format!("user={user}\x01auth=Bearer {token}\x01\x01").into_bytes()
}

/// `OAUTHBEARER` initial response (RFC 7628).
///
/// Format: `n,a=<user>,\x01host=<host>\x01auth=Bearer <token>\x01\x01`.
/// The `host` pair is left out when `host` is empty.
#[must_use]
pub fn oauthbearer_response(user: &str, host: &str, token: &str) -> Vec<u8> {
    let host_kv = if host.is_empty() {
        String::new()
    } else {
        format!("host={host}\x01")
    };
    format!("n,a={user},\x01{host_kv}auth=Bearer {token}\x01\x01").into_bytes()
}

/// Google/Microsoft `XOAUTH2` client.
#[derive(Debug, Default)]
pub struct XOAuth2 {
    credentials: Option<Credentials>,
    sent: bool,
    finished: bool,
}

impl SaslClient for XOAuth2 {
    fn mechanism(&self) -> &str {
        "XOAUTH2"
    }

    fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
    }

    fn step(&mut self, challenge: Option<&[u8]>) -> Result<Step> {
        if self.finished {
            return Err(Error::AlreadyComplete("XOAUTH2"));
        }
        if self.sent {
            // Error details arrive as a challenge; an empty reply ends it.
            self.finished = true;
            return Ok(Step::Done(Vec::new()));
        }
        if challenge.is_some_and(|c| !c.is_empty()) {
            return Err(Error::unexpected("XOAUTH2", "challenge before initial response"));
        }
        let Some(creds) = &self.credentials else {
            return Ok(Step::NeedsCredentials);
        };
        self.sent = true;
        Ok(Step::Done(xoauth2_response(&creds.username, &creds.password)))
    }
}

/// RFC 7628 `OAUTHBEARER` client.
#[derive(Debug)]
pub struct OAuthBearer {
    host: String,
    credentials: Option<Credentials>,
    sent: bool,
    finished: bool,
}

impl OAuthBearer {
    /// Creates a client for the given server host.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            credentials: None,
            sent: false,
            finished: false,
        }
    }
}

impl SaslClient for OAuthBearer {
    fn mechanism(&self) -> &str {
        "OAUTHBEARER"
    }

    fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
    }

    fn step(&mut self, challenge: Option<&[u8]>) -> Result<Step> {
        if self.finished {
            return Err(Error::AlreadyComplete("OAUTHBEARER"));
        }
        if self.sent {
            // RFC 7628 section 3.2.3: respond to the error with a lone %x01.
            self.finished = true;
            return Ok(Step::Done(vec![0x01]));
        }
        if challenge.is_some_and(|c| !c.is_empty()) {
            return Err(Error::unexpected(
                "OAUTHBEARER",
                "challenge before initial response",
            ));
        }
        let Some(creds) = &self.credentials else {
            return Ok(Step::NeedsCredentials);
        };
        self.sent = true;
        Ok(Step::Done(oauthbearer_response(
            &creds.username,
            &self.host,
            &creds.password,
        )))
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
    fn test_xoauth2_response_format() {
        assert_eq!(
            xoauth2_response("test@test.com", "abc"),
            b"user=test@test.com\x01auth=Bearer abc\x01\x01"
        );
    }

    #[test]
    fn test_oauthbearer_response_format() {
        assert_eq!(
            oauthbearer_response("test@test.com", "", "abc"),
            b"n,a=test@test.com,\x01auth=Bearer abc\x01\x01"
        );
        assert_eq!(
            oauthbearer_response("u", "smtp.example.com", "t"),
            b"n,a=u,\x01host=smtp.example.com\x01auth=Bearer t\x01\x01"
        );
    }

    #[test]
    fn test_xoauth2_error_challenge_gets_empty_answer() {
        let mut client = XOAuth2::default();
        assert_eq!(client.step(None).unwrap(), Step::NeedsCredentials);
        client.set_credentials(Credentials::new("user@example.com", "ya29.token"));
        assert!(matches!(client.step(None).unwrap(), Step::Done(_)));
        assert_eq!(
            client.step(Some(br#"{"status":"401"}"#)).unwrap(),
            Step::Done(Vec::new())
        );
        assert!(client.step(Some(b"")).is_err());
    }

    #[test]
    fn test_oauthbearer_error_challenge_gets_ctrl_a() {
        let mut client = OAuthBearer::new("mx.example.com");
        client.set_credentials(Credentials::new("user", "tok"));
        assert_eq!(
            client.step(None).unwrap(),
            Step::Done(b"n,a=user,\x01host=mx.example.com\x01auth=Bearer tok\x01\x01".to_vec())
        );
        assert_eq!(
            client.step(Some(br#"{"status":"invalid_token"}"#)).unwrap(),
            Step::Done(vec![0x01])
        );
    }
}
