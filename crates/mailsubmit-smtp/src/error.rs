//! Error types for SMTP submission.

use std::io;
use std::time::Duration;

use crate::types::ReplyCode;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failure.
///
/// The session decides between RSET and closing the connection purely on
/// [`ErrorKind::is_fatal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The server greeting was not 2xx.
    GreetingRejected,
    /// A session-level command (EHLO/HELO, QUIT, ...) was refused.
    CommandRejected,
    /// STARTTLS was refused or the handshake failed.
    TlsNegotiationFailed,
    /// AUTH was refused, or no credentials were available.
    AuthenticationFailed,
    /// MAIL FROM was refused.
    SenderRejected,
    /// RCPT TO was refused.
    RecipientRejected,
    /// DATA, or the message body, was refused.
    MessageRejected,
    /// Malformed or unexpected reply; the stream can no longer be trusted.
    ProtocolDesync,
    /// A connect or read timed out.
    Timeout,
    /// The transport failed or the peer closed the connection.
    ConnectionBroken,
    /// Reading the caller's message failed mid-transfer.
    MessageSource,
    /// The request was refused locally before anything was sent.
    InvalidRequest,
    /// The session is closed.
    NotConnected,
}

impl ErrorKind {
    /// Returns true if the connection must be torn down.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        !matches!(
            self,
            Self::SenderRejected
                | Self::RecipientRejected
                | Self::MessageRejected
                | Self::InvalidRequest
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::GreetingRejected => "greeting rejected",
            Self::CommandRejected => "command rejected",
            Self::TlsNegotiationFailed => "TLS negotiation failed",
            Self::AuthenticationFailed => "authentication failed",
            Self::SenderRejected => "sender rejected",
            Self::RecipientRejected => "recipient rejected",
            Self::MessageRejected => "message rejected",
            Self::ProtocolDesync => "protocol desync",
            Self::Timeout => "timeout",
            Self::ConnectionBroken => "connection broken",
            Self::MessageSource => "message source failed",
            Self::InvalidRequest => "invalid request",
            Self::NotConnected => "not connected",
        };
        f.write_str(name)
    }
}

/// SMTP error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// STARTTLS or the handshake could not be completed.
    #[error("TLS negotiation failed: {0}")]
    TlsNegotiation(String),

    /// Server refused a command.
    #[error("SMTP error {code} ({kind}): {message}")]
    SmtpError {
        /// What was refused.
        kind: ErrorKind,
        /// Reply code (e.g., 550).
        code: ReplyCode,
        /// Error message from server.
        message: String,
    },

    /// Authentication could not be carried out locally.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// SASL mechanism failure.
    #[error("SASL error: {0}")]
    Sasl(#[from] mailsubmit_sasl::Error),

    /// Protocol error (malformed or unexpected response).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// Request refused before sending.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Reading the message failed.
    #[error("Could not read message data: {0}")]
    MessageSource(#[source] io::Error),

    /// Timed out waiting for the server.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Operation on a closed session.
    #[error("Not connected")]
    NotConnected,

    /// Invalid state for operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),
}

impl Error {
    /// Creates an SMTP error from a kind, reply code and message.
    #[must_use]
    pub fn smtp_error(kind: ErrorKind, code: ReplyCode, message: impl Into<String>) -> Self {
        Self::SmtpError {
            kind,
            code,
            message: message.into(),
        }
    }

    /// Returns the error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(e) if e.kind() == io::ErrorKind::TimedOut => ErrorKind::Timeout,
            Self::Io(_) => ErrorKind::ConnectionBroken,
            Self::Tls(_) | Self::TlsNegotiation(_) => ErrorKind::TlsNegotiationFailed,
            Self::SmtpError { kind, .. } => *kind,
            Self::Auth(_) | Self::Sasl(_) => ErrorKind::AuthenticationFailed,
            Self::Protocol(_) => ErrorKind::ProtocolDesync,
            Self::InvalidAddress(_) | Self::InvalidRequest(_) | Self::InvalidState(_) => {
                ErrorKind::InvalidRequest
            }
            Self::MessageSource(_) => ErrorKind::MessageSource,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::NotConnected => ErrorKind::NotConnected,
        }
    }

    /// Returns true if the session cannot continue after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    /// Returns the server reply code, if the error came from a reply.
    #[must_use]
    pub const fn code(&self) -> Option<ReplyCode> {
        match self {
            Self::SmtpError { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::SmtpError { code, .. } if code.is_permanent())
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::SmtpError { code, .. } if code.is_transient())
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
    fn test_fatal_classification() {
        assert!(ErrorKind::GreetingRejected.is_fatal());
        assert!(ErrorKind::AuthenticationFailed.is_fatal());
        assert!(ErrorKind::ProtocolDesync.is_fatal());
        assert!(ErrorKind::Timeout.is_fatal());
        assert!(!ErrorKind::SenderRejected.is_fatal());
        assert!(!ErrorKind::RecipientRejected.is_fatal());
        assert!(!ErrorKind::MessageRejected.is_fatal());
        assert!(!ErrorKind::InvalidRequest.is_fatal());
    }

    #[test]
    fn test_permanent_and_transient() {
        let err = Error::smtp_error(
            ErrorKind::RecipientRejected,
            ReplyCode::MAILBOX_UNAVAILABLE,
            "no such user",
        );
        assert!(err.is_permanent());
        assert!(!err.is_transient());
        assert!(!err.is_fatal());
        assert_eq!(err.code(), Some(ReplyCode::MAILBOX_UNAVAILABLE));

        let err = Error::smtp_error(ErrorKind::SenderRejected, ReplyCode::LOCAL_ERROR, "later");
        assert!(err.is_transient());
    }

    #[test]
    fn test_kind_mapping() {
        let eof = Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "closed"));
        assert_eq!(eof.kind(), ErrorKind::ConnectionBroken);
        assert_eq!(
            Error::Protocol("bad".into()).kind(),
            ErrorKind::ProtocolDesync
        );
        assert_eq!(
            Error::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            Error::InvalidAddress("x".into()).kind(),
            ErrorKind::InvalidRequest
        );
        assert!(Error::NotConnected.is_fatal());
        assert!(Error::Io(io::Error::other("x")).code().is_none());
    }

    #[test]
    fn test_display_includes_code_and_kind() {
        let err = Error::smtp_error(ErrorKind::MessageRejected, ReplyCode::new(554), "spam");
        assert_eq!(err.to_string(), "SMTP error 554 (message rejected): spam");
    }
}
