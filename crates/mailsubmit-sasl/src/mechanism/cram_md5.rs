//! CRAM-MD5 (RFC 2195).

use std::fmt::Write as _;

use hmac::{Hmac, Mac};
use md5::Md5;

use crate::error::{Error, Result};
use crate::{Credentials, SaslClient, Step};

type HmacMd5 = Hmac<Md5>;

/// Computes `<username> <hex hmac-md5(password, challenge)>`.
///
/// # Errors
///
/// Returns [`Error::InvalidCredentials`] if the key is rejected by HMAC.
pub fn cram_md5_response(username: &str, password: &str, challenge: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacMd5::new_from_slice(password.as_bytes())
        .map_err(|e| Error::InvalidCredentials(e.to_string()))?;
    mac.update(challenge);
    let digest = mac.finalize().into_bytes();

    let mut out = String::with_capacity(username.len() + 1 + digest.len() * 2);
    out.push_str(username);
    out.push(' ');
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    Ok(out.into_bytes())
}

/// CRAM-MD5 client. Has no initial response.
#[derive(Debug, Default)]
pub struct CramMd5 {
    credentials: Option<Credentials>,
    started: bool,
    finished: bool,
}

impl SaslClient for CramMd5 {
    fn mechanism(&self) -> &str {
        "CRAM-MD5"
    }

    fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
    }

    fn step(&mut self, challenge: Option<&[u8]>) -> Result<Step> {
        if self.finished {
            return Err(Error::AlreadyComplete("CRAM-MD5"));
        }
        let Some(challenge) = challenge else {
            if self.started {
                return Err(Error::unexpected("CRAM-MD5", "missing challenge"));
            }
            self.started = true;
            return Ok(Step::Continue(Vec::new()));
        };
        if challenge.is_empty() {
            return Err(Error::unexpected("CRAM-MD5", "empty challenge"));
        }
        let Some(creds) = &self.credentials else {
            return Ok(Step::NeedsCredentials);
        };
        let response = cram_md5_response(&creds.username, &creds.password, challenge)?;
        self.finished = true;
        Ok(Step::Done(response))
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

    const CHALLENGE: &[u8] = b"<1896.697170952@postoffice.reston.mci.net>";

    #[test]
    fn test_rfc2195_vector() {
        let response = cram_md5_response("tim", "tanstaaftanstaaf", CHALLENGE).unwrap();
        assert_eq!(response, b"tim b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn test_client_exchange() {
        let mut client = CramMd5::default();
        assert_eq!(client.step(None).unwrap(), Step::Continue(Vec::new()));
        assert_eq!(client.step(Some(CHALLENGE)).unwrap(), Step::NeedsCredentials);

        client.set_credentials(Credentials::new("tim", "tanstaaftanstaaf"));
        assert_eq!(
            client.step(Some(CHALLENGE)).unwrap(),
            Step::Done(b"tim b913a602c7eda7a495b4e6e7334d3890".to_vec())
        );
        assert_eq!(
            client.step(Some(CHALLENGE)).unwrap_err(),
            Error::AlreadyComplete("CRAM-MD5")
        );
    }

    #[test]
    fn test_empty_challenge_rejected() {
        let mut client = CramMd5::default();
        client.step(None).unwrap();
        assert!(client.step(Some(b"")).is_err());
    }
}
