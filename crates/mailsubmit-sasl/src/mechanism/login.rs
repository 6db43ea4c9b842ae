//! LOGIN (draft-murchison-sasl-login).
//!
//! The server prompts with `Username:` and `Password:` challenges. Prompt
//! texts vary between servers, so the answers follow the order of the
//! challenges rather than their content.

use crate::error::{Error, Result};
use crate::{Credentials, SaslClient, Step};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Stage {
    #[default]
    Initial,
    Username,
    Password,
    Done,
}

/// LOGIN client.
#[derive(Debug, Default)]
pub struct Login {
    credentials: Option<Credentials>,
    stage: Stage,
}

impl SaslClient for Login {
    fn mechanism(&self) -> &str {
        "LOGIN"
    }

    fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
    }

    fn step(&mut self, challenge: Option<&[u8]>) -> Result<Step> {
        match (self.stage, challenge) {
            // No initial response: wait for the username prompt.
            (Stage::Initial, None) => {
                self.stage = Stage::Username;
                Ok(Step::Continue(Vec::new()))
            }
            (Stage::Initial | Stage::Username, Some(_)) => {
                let Some(creds) = &self.credentials else {
                    self.stage = Stage::Username;
                    return Ok(Step::NeedsCredentials);
                };
                self.stage = Stage::Password;
                Ok(Step::Continue(creds.username.clone().into_bytes()))
            }
            (Stage::Password, Some(_)) => {
                let Some(creds) = &self.credentials else {
                    return Ok(Step::NeedsCredentials);
                };
                self.stage = Stage::Done;
                Ok(Step::Done(creds.password.clone().into_bytes()))
            }
            (Stage::Username | Stage::Password, None) => {
                Err(Error::unexpected("LOGIN", "missing server prompt"))
            }
            (Stage::Done, _) => Err(Error::AlreadyComplete("LOGIN")),
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
    fn test_login_full_exchange() {
        let mut client = Login::default();
        assert_eq!(client.step(None).unwrap(), Step::Continue(Vec::new()));

        assert_eq!(
            client.step(Some(b"Username:")).unwrap(),
            Step::NeedsCredentials
        );
        client.set_credentials(Credentials::new("alice", "wonderland"));
        assert_eq!(
            client.step(Some(b"Username:")).unwrap(),
            Step::Continue(b"alice".to_vec())
        );
        assert_eq!(
            client.step(Some(b"Password:")).unwrap(),
            Step::Done(b"wonderland".to_vec())
        );
        assert!(client.step(Some(b"??")).is_err());
    }

    #[test]
    fn test_login_ignores_prompt_text() {
        let mut client = Login::default();
        client.set_credentials(Credentials::new("bob", "builder"));
        client.step(None).unwrap();
        assert_eq!(
            client.step(Some(b"whatever")).unwrap(),
            Step::Continue(b"bob".to_vec())
        );
        assert_eq!(
            client.step(Some(b"")).unwrap(),
            Step::Done(b"builder".to_vec())
        );
    }
}
