//! Error types for SASL operations.

/// Result type alias for SASL operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SASL error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// None of the offered mechanisms is implemented.
    #[error("No usable SASL mechanism among: {0}")]
    NoUsableMechanism(String),

    /// The server sent a challenge the mechanism cannot answer.
    #[error("Unexpected {mechanism} challenge: {reason}")]
    UnexpectedChallenge {
        /// Mechanism name.
        mechanism: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The mechanism was asked to continue after it finished.
    #[error("{0} exchange already complete")]
    AlreadyComplete(&'static str),

    /// Credentials were rejected locally (e.g. empty key for CRAM-MD5).
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),
}

impl Error {
    /// Creates an unexpected-challenge error.
    #[must_use]
    pub fn unexpected(mechanism: &'static str, reason: impl Into<String>) -> Self {
        Self::UnexpectedChallenge {
            mechanism,
            reason: reason.into(),
        }
    }
}
