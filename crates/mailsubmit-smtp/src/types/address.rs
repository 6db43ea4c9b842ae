//! Envelope addresses.

use crate::error::{Error, Result};

/// Address for the SMTP envelope (`MAIL FROM` / `RCPT TO`).
///
/// Stored without angle brackets. The empty address is only valid as a
/// sender, for bounces, and is created with [`Address::null`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    /// Creates a new address from a string.
    ///
    /// Surrounding angle brackets are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid.
    pub fn new(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        let trimmed = addr
            .trim()
            .strip_prefix('<')
            .and_then(|a| a.strip_suffix('>'))
            .unwrap_or_else(|| addr.trim());
        Self::validate(trimmed)?;
        Ok(Self(trimmed.to_string()))
    }

    /// The null reverse-path `<>`.
    #[must_use]
    pub const fn null() -> Self {
        Self(String::new())
    }

    /// Returns true for the null reverse-path.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(addr: &str) -> Result<()> {
        if addr.is_empty() {
            return Err(Error::InvalidAddress("Address cannot be empty".into()));
        }

        // Anything that could end the command line early or inject another.
        if addr
            .bytes()
            .any(|b| b.is_ascii_control() || b == b' ' || b == b'<' || b == b'>')
        {
            return Err(Error::InvalidAddress(format!(
                "Address contains forbidden characters: {addr:?}"
            )));
        }

        let Some((local, domain)) = addr.rsplit_once('@') else {
            return Err(Error::InvalidAddress("Address must contain @".into()));
        };

        if local.is_empty() || domain.is_empty() {
            return Err(Error::InvalidAddress(
                "Local and domain parts cannot be empty".into(),
            ));
        }

        Ok(())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

impl std::str::FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_address() {
        let addr = Address::new("user@example.com").unwrap();
        assert_eq!(addr.as_str(), "user@example.com");
        assert_eq!(addr.to_string(), "<user@example.com>");
    }

    #[test]
    fn test_brackets_stripped() {
        let addr: Address = " <a@x> ".parse().unwrap();
        assert_eq!(addr.as_str(), "a@x");
    }

    #[test]
    fn test_quoted_local_part_with_at() {
        let addr = Address::new("\"odd@local\"@example.com").unwrap();
        assert_eq!(addr.as_str(), "\"odd@local\"@example.com");
    }

    #[test]
    fn test_invalid_address_no_at() {
        assert!(Address::new("userexample.com").is_err());
    }

    #[test]
    fn test_invalid_address_empty() {
        assert!(Address::new("").is_err());
        assert!(Address::new("<>").is_err());
    }

    #[test]
    fn test_invalid_address_empty_parts() {
        assert!(Address::new("@example.com").is_err());
        assert!(Address::new("user@").is_err());
    }

    #[test]
    fn test_rejects_crlf_injection() {
        assert!(Address::new("a@x>\r\nRCPT TO:<b@y").is_err());
        assert!(Address::new("a b@x").is_err());
    }

    #[test]
    fn test_null_sender() {
        let null = Address::null();
        assert!(null.is_null());
        assert_eq!(null.to_string(), "<>");
    }
}
