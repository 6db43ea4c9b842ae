//! State of one mail transaction (MAIL FROM through the end of DATA).
//!
//! Commands record their outcome here instead of returning errors, and the
//! session reads it afterwards to choose between carrying on, RSET and
//! closing the connection.

use crate::connection::RecipientPolicy;
use crate::error::{Error, ErrorKind};
use crate::types::{Address, Reply, ReplyCode};

/// Why a transaction failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionError {
    /// Failure class.
    pub kind: ErrorKind,
    /// Reply code that caused it.
    pub code: ReplyCode,
    /// Human-readable description including the server's text.
    pub message: String,
}

impl From<TransactionError> for Error {
    fn from(e: TransactionError) -> Self {
        Self::smtp_error(e.kind, e.code, e.message)
    }
}

/// A recipient refused by RCPT TO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientRejection {
    /// The refused address.
    pub recipient: Address,
    /// Reply code.
    pub code: ReplyCode,
    /// Server's explanation.
    pub message: String,
}

/// Outcome tracking for one transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionState {
    policy: RecipientPolicy,
    failed: bool,
    failed_fatally: bool,
    error: Option<TransactionError>,
    mail_from_failed: bool,
    rejected_recipients: Vec<RecipientRejection>,
    recipient_accepted: bool,
    data_command_issued: bool,
    data_command_succeeded: bool,
    complete: bool,
    final_reply: Option<Reply>,
    bytes_transferred: u64,
}

impl TransactionState {
    /// Creates a fresh transaction.
    #[must_use]
    pub fn new(policy: RecipientPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// True once anything failed.
    #[must_use]
    pub const fn failed(&self) -> bool {
        self.failed
    }

    /// True if the connection must be closed.
    #[must_use]
    pub const fn failed_fatally(&self) -> bool {
        self.failed_fatally
    }

    /// The recorded failure, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&TransactionError> {
        self.error.as_ref()
    }

    /// Converts the recorded failure into an [`Error`].
    #[must_use]
    pub fn to_error(&self) -> Option<Error> {
        self.error.clone().map(Error::from)
    }

    /// Marks the transaction failed; the connection stays usable.
    ///
    /// The first failure's description is kept.
    pub fn fail(&mut self, kind: ErrorKind, code: ReplyCode, message: impl Into<String>) {
        self.failed = true;
        if self.error.is_none() {
            self.error = Some(TransactionError {
                kind,
                code,
                message: message.into(),
            });
        }
    }

    /// Marks the transaction failed and the connection unusable.
    ///
    /// A fatal description replaces any soft one recorded earlier.
    pub fn fail_fatally(&mut self, kind: ErrorKind, code: ReplyCode, message: impl Into<String>) {
        self.failed = true;
        let keep = self
            .error
            .as_ref()
            .is_some_and(|e| self.failed_fatally && e.kind.is_fatal());
        self.failed_fatally = true;
        if !keep {
            self.error = Some(TransactionError {
                kind,
                code,
                message: message.into(),
            });
        }
    }

    /// Makes the recorded failure fatal.
    ///
    /// Used for commands whose failure leaves the connection unusable
    /// even though the reply itself was well formed.
    pub const fn escalate(&mut self) {
        if self.failed {
            self.failed_fatally = true;
        }
    }

    /// Records a refused MAIL FROM.
    pub fn set_mail_from_failed(&mut self, sender: &Address, reply: &Reply) {
        self.mail_from_failed = true;
        self.fail(
            ErrorKind::SenderRejected,
            reply_code(reply),
            format!(
                "The server did not accept the sender address {sender}. {}",
                reply.error_message()
            ),
        );
    }

    /// True if MAIL FROM was refused.
    #[must_use]
    pub const fn mail_from_failed(&self) -> bool {
        self.mail_from_failed
    }

    /// Records an accepted RCPT TO.
    pub const fn set_recipient_accepted(&mut self) {
        self.recipient_accepted = true;
    }

    /// True if at least one recipient was accepted.
    #[must_use]
    pub const fn recipient_accepted(&self) -> bool {
        self.recipient_accepted
    }

    /// Records a refused RCPT TO. Under [`RecipientPolicy::RejectAny`]
    /// this fails the transaction.
    pub fn add_rejected_recipient(&mut self, recipient: &Address, reply: &Reply) {
        let code = reply_code(reply);
        let message = reply.error_message();
        if self.policy == RecipientPolicy::RejectAny {
            self.fail(
                ErrorKind::RecipientRejected,
                code,
                format!("The server did not accept the recipient {recipient}. {message}"),
            );
        }
        self.rejected_recipients.push(RecipientRejection {
            recipient: recipient.clone(),
            code,
            message,
        });
    }

    /// Recipients refused so far.
    #[must_use]
    pub fn rejected_recipients(&self) -> &[RecipientRejection] {
        &self.rejected_recipients
    }

    /// Records that DATA was put on the wire.
    pub const fn set_data_command_issued(&mut self) {
        self.data_command_issued = true;
    }

    /// True if DATA was sent.
    #[must_use]
    pub const fn data_command_issued(&self) -> bool {
        self.data_command_issued
    }

    /// Records the reply to DATA.
    ///
    /// A `354` for a transaction that already failed means the server now
    /// expects a body that will never come: that is fatal.
    pub fn set_data_command_succeeded(&mut self, succeeded: bool, reply: &Reply) {
        self.data_command_succeeded = succeeded;
        if !succeeded {
            self.fail(
                ErrorKind::MessageRejected,
                reply_code(reply),
                format!(
                    "The server refused to accept message data. {}",
                    reply.error_message()
                ),
            );
        } else if self.failed {
            self.fail_fatally(
                ErrorKind::ProtocolDesync,
                reply_code(reply),
                "The server accepted DATA for a transaction that had already failed.",
            );
        }
    }

    /// True if DATA got its `354`.
    #[must_use]
    pub const fn data_command_succeeded(&self) -> bool {
        self.data_command_succeeded
    }

    /// Records the final reply to the message body.
    pub fn set_complete(&mut self, reply: Reply) {
        self.complete = true;
        self.final_reply = Some(reply);
    }

    /// True once the server answered the end of data.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    /// Reply to the end of data, if received.
    #[must_use]
    pub const fn final_reply(&self) -> Option<&Reply> {
        self.final_reply.as_ref()
    }

    /// Adds to the count of message bytes read from the source.
    pub const fn record_transferred(&mut self, bytes: u64) {
        self.bytes_transferred = self.bytes_transferred.saturating_add(bytes);
    }

    /// Message bytes read from the source so far.
    #[must_use]
    pub const fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Takes the final reply and the rejected recipients, leaving the
    /// state empty.
    pub(crate) fn take_outcome(&mut self) -> (Option<Reply>, Vec<RecipientRejection>) {
        (
            self.final_reply.take(),
            std::mem::take(&mut self.rejected_recipients),
        )
    }
}

/// Code of a reply, or `0` for a reply that never carried one.
pub(crate) fn reply_code(reply: &Reply) -> ReplyCode {
    reply.code().unwrap_or(ReplyCode::new(0))
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

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn reply(code: u16, text: &str) -> Reply {
        Reply::single(ReplyCode::new(code), text)
    }

    #[test]
    fn test_fresh_state() {
        let tx = TransactionState::new(RecipientPolicy::RejectAny);
        assert!(!tx.failed());
        assert!(!tx.failed_fatally());
        assert!(tx.error().is_none());
        assert!(!tx.is_complete());
    }

    #[test]
    fn test_sender_rejection_is_soft() {
        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);
        tx.set_mail_from_failed(&addr("a@x"), &reply(553, "not allowed"));
        assert!(tx.failed());
        assert!(!tx.failed_fatally());
        assert!(tx.mail_from_failed());
        let err = tx.error().unwrap();
        assert_eq!(err.kind, ErrorKind::SenderRejected);
        assert_eq!(err.code, ReplyCode::MAILBOX_NAME_INVALID);
        assert!(err.message.contains("<a@x>"));
    }

    #[test]
    fn test_reject_any_fails_on_one_recipient() {
        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);
        tx.set_recipient_accepted();
        tx.add_rejected_recipient(&addr("b@y"), &reply(550, "no such user"));
        assert!(tx.failed());
        assert_eq!(tx.rejected_recipients().len(), 1);
        assert_eq!(tx.error().unwrap().kind, ErrorKind::RecipientRejected);
    }

    #[test]
    fn test_allow_partial_keeps_going() {
        let mut tx = TransactionState::new(RecipientPolicy::AllowPartial);
        tx.set_recipient_accepted();
        tx.add_rejected_recipient(&addr("b@y"), &reply(550, "no such user"));
        assert!(!tx.failed());
        assert_eq!(tx.rejected_recipients()[0].recipient, addr("b@y"));
    }

    #[test]
    fn test_data_accepted_after_failure_is_fatal() {
        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);
        tx.add_rejected_recipient(&addr("b@y"), &reply(550, "no"));
        tx.set_data_command_issued();
        tx.set_data_command_succeeded(true, &reply(354, "go ahead"));
        assert!(tx.failed_fatally());
        assert!(tx.error().unwrap().kind.is_fatal());
    }

    #[test]
    fn test_data_refused_is_soft() {
        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);
        tx.set_data_command_succeeded(false, &reply(554, "no valid recipients"));
        assert!(tx.failed());
        assert!(!tx.failed_fatally());
        assert_eq!(tx.error().unwrap().kind, ErrorKind::MessageRejected);
    }

    #[test]
    fn test_first_soft_error_kept_fatal_replaces() {
        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);
        tx.fail(ErrorKind::SenderRejected, ReplyCode::new(550), "first");
        tx.fail(ErrorKind::RecipientRejected, ReplyCode::new(550), "second");
        assert_eq!(tx.error().unwrap().message, "first");

        tx.fail_fatally(ErrorKind::ProtocolDesync, ReplyCode::new(421), "closing");
        tx.fail_fatally(ErrorKind::Timeout, ReplyCode::new(421), "later");
        assert_eq!(tx.error().unwrap().message, "closing");

        let err = tx.to_error().unwrap();
        assert_eq!(err.kind(), ErrorKind::ProtocolDesync);
        assert!(err.is_transient());
    }

    #[test]
    fn test_escalate_only_after_failure() {
        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);
        tx.escalate();
        assert!(!tx.failed_fatally());
        tx.fail(ErrorKind::CommandRejected, ReplyCode::new(502), "no");
        tx.escalate();
        assert!(tx.failed_fatally());
        assert_eq!(tx.error().unwrap().kind, ErrorKind::CommandRejected);
    }
}
