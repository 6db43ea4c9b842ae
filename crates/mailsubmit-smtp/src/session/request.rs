//! Caller-facing submission request and receipt.

use std::fmt;

use tokio::io::AsyncRead;

use crate::command::{Command, ProgressFn, Transfer};
use crate::error::{Error, Result};
use crate::transaction::RecipientRejection;
use crate::types::{Address, Capabilities, Reply};

/// One message to submit.
///
/// The body is read from an [`AsyncRead`] while it is being sent and must
/// already be a complete RFC 5322 message. Line endings may be `LF` or
/// `CRLF`; dot-stuffing is applied on the way out.
///
/// # Example
///
/// ```
/// use mailsubmit_smtp::{Address, SubmissionRequest};
///
/// let request = SubmissionRequest::from_bytes(
///     Address::new("alice@example.org").unwrap(),
///     b"Subject: hi\r\n\r\nHello\r\n".to_vec(),
/// )
/// .to(Address::new("bob@example.net").unwrap())
/// .bcc(Address::new("archive@example.org").unwrap());
///
/// assert_eq!(request.recipients().count(), 2);
/// ```
pub struct SubmissionRequest {
    sender: Address,
    to: Vec<Address>,
    cc: Vec<Address>,
    bcc: Vec<Address>,
    source: Box<dyn AsyncRead + Send + Unpin>,
    size: Option<u64>,
    eight_bit: bool,
    progress: Option<ProgressFn>,
}

impl SubmissionRequest {
    /// Creates a request reading the message from `source`.
    #[must_use]
    pub fn new(sender: Address, source: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            sender,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            source: Box::new(source),
            size: None,
            eight_bit: false,
            progress: None,
        }
    }

    /// Creates a request for an in-memory message. The size is filled in.
    #[must_use]
    pub fn from_bytes(sender: Address, message: impl Into<Vec<u8>>) -> Self {
        let message = message.into();
        let size = message.len() as u64;
        Self::new(sender, std::io::Cursor::new(message)).size(size)
    }

    /// Adds a `To` recipient.
    #[must_use]
    pub fn to(mut self, recipient: Address) -> Self {
        self.to.push(recipient);
        self
    }

    /// Adds a `Cc` recipient.
    #[must_use]
    pub fn cc(mut self, recipient: Address) -> Self {
        self.cc.push(recipient);
        self
    }

    /// Adds a `Bcc` recipient.
    #[must_use]
    pub fn bcc(mut self, recipient: Address) -> Self {
        self.bcc.push(recipient);
        self
    }

    /// Declares the message size, sent as `SIZE=` when the server supports it.
    #[must_use]
    pub const fn size(mut self, bytes: u64) -> Self {
        self.size = Some(bytes);
        self
    }

    /// Marks the body as 8-bit, sent as `BODY=8BITMIME`.
    #[must_use]
    pub const fn eight_bit(mut self, eight_bit: bool) -> Self {
        self.eight_bit = eight_bit;
        self
    }

    /// Registers a callback receiving the cumulative number of message
    /// bytes read.
    #[must_use]
    pub fn on_progress(mut self, progress: impl FnMut(u64) + Send + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Reverse path.
    #[must_use]
    pub const fn sender(&self) -> &Address {
        &self.sender
    }

    /// All envelope recipients: `To`, then `Cc`, then `Bcc`.
    pub fn recipients(&self) -> impl Iterator<Item = &Address> {
        self.to.iter().chain(&self.cc).chain(&self.bcc)
    }

    /// Refuses requests the server is known to reject.
    pub(crate) fn check(&self, capabilities: &Capabilities, host: &str) -> Result<()> {
        if self.recipients().next().is_none() {
            return Err(Error::InvalidRequest(
                "The message has no recipients.".to_string(),
            ));
        }
        if self.recipients().any(Address::is_null) {
            return Err(Error::InvalidRequest(
                "The null address <> cannot be a recipient.".to_string(),
            ));
        }
        if self.eight_bit && !capabilities.have("8BITMIME") {
            return Err(Error::InvalidRequest(format!(
                "Your server ({host}) does not support sending of 8-bit messages. \
                 Please use base64 or quoted-printable encoding."
            )));
        }
        if let (Some(size), Some(max)) = (self.size, capabilities.max_size())
            && size > max
        {
            return Err(Error::InvalidRequest(format!(
                "The message is {size} bytes but the server ({host}) accepts at most {max} bytes."
            )));
        }
        Ok(())
    }

    /// Commands for one transaction: MAIL, RCPT per recipient, DATA, body.
    pub(crate) fn into_commands(self) -> Vec<Command> {
        let Self {
            sender,
            to,
            cc,
            bcc,
            source,
            size,
            eight_bit,
            progress,
        } = self;

        let mut commands = Vec::with_capacity(to.len() + cc.len() + bcc.len() + 3);
        commands.push(Command::mail_from(sender, size, eight_bit));
        commands.extend(
            to.into_iter()
                .chain(cc)
                .chain(bcc)
                .map(Command::rcpt_to),
        );
        commands.push(Command::data());
        commands.push(Command::transfer(
            Transfer::new(source).with_progress(progress),
        ));
        commands
    }
}

impl fmt::Debug for SubmissionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionRequest")
            .field("sender", &self.sender)
            .field("to", &self.to)
            .field("cc", &self.cc)
            .field("bcc", &self.bcc)
            .field("size", &self.size)
            .field("eight_bit", &self.eight_bit)
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful submission.
#[derive(Debug, Clone)]
pub struct Receipt {
    /// Server's final reply to the message body (usually carries a queue id).
    pub reply: Reply,
    /// Recipients refused under [`RecipientPolicy::AllowPartial`](crate::RecipientPolicy::AllowPartial).
    pub rejected_recipients: Vec<RecipientRejection>,
    /// Message bytes read from the source.
    pub bytes_sent: u64,
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
    use crate::command::CommandKind;
    use crate::error::ErrorKind;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn caps(keywords: &[&str]) -> Capabilities {
        let mut reply = Reply::new();
        reply.parse_line(b"250-mx\r\n");
        for kw in keywords {
            reply.parse_line(format!("250-{kw}\r\n").as_bytes());
        }
        reply.parse_line(b"250 HELP\r\n");
        Capabilities::from_ehlo(&reply)
    }

    #[test]
    fn test_recipient_order() {
        let request = SubmissionRequest::from_bytes(addr("a@x"), b"body".to_vec())
            .bcc(addr("d@x"))
            .to(addr("b@x"))
            .cc(addr("c@x"));
        let all: Vec<&str> = request.recipients().map(Address::as_str).collect();
        assert_eq!(all, ["b@x", "c@x", "d@x"]);
    }

    #[test]
    fn test_commands_in_transaction_order() {
        let request = SubmissionRequest::from_bytes(addr("a@x"), b"body".to_vec())
            .to(addr("b@x"))
            .to(addr("c@x"));
        let commands = request.into_commands();
        let names: Vec<&str> = commands.iter().map(Command::name).collect();
        assert_eq!(names, ["MAIL FROM", "RCPT TO", "RCPT TO", "DATA", "message body"]);
        assert!(matches!(
            commands[0].kind(),
            CommandKind::MailFrom { size: Some(4), eight_bit: false, .. }
        ));
    }

    #[test]
    fn test_no_recipients_refused() {
        let request = SubmissionRequest::from_bytes(addr("a@x"), b"body".to_vec());
        let err = request.check(&caps(&[]), "mx").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_eight_bit_needs_extension() {
        let request = SubmissionRequest::from_bytes(addr("a@x"), "héllo".as_bytes().to_vec())
            .to(addr("b@x"))
            .eight_bit(true);
        let err = request.check(&caps(&[]), "mx.example.com").unwrap_err();
        assert!(err.to_string().contains("does not support sending of 8-bit messages"));
        assert!(request.check(&caps(&["8BITMIME"]), "mx").is_ok());
    }

    #[test]
    fn test_size_limit() {
        let request = SubmissionRequest::from_bytes(addr("a@x"), vec![b'x'; 2048]).to(addr("b@x"));
        assert!(request.check(&caps(&["SIZE 1024"]), "mx").is_err());
        assert!(request.check(&caps(&["SIZE 4096"]), "mx").is_ok());
        assert!(request.check(&caps(&["SIZE"]), "mx").is_ok());
    }

    #[test]
    fn test_null_sender_allowed() {
        let request = SubmissionRequest::from_bytes(Address::null(), b"bounce".to_vec()).to(addr("b@x"));
        assert!(request.check(&caps(&[]), "mx").is_ok());
    }

    #[test]
    fn test_null_recipient_refused() {
        let request = SubmissionRequest::from_bytes(addr("a@x"), b"body".to_vec())
            .to(addr("b@x"))
            .bcc(Address::null());
        let err = request.check(&caps(&[]), "mx").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(err.to_string().contains("cannot be a recipient"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_debug_omits_body() {
        let request = SubmissionRequest::from_bytes(addr("a@x"), b"secret body".to_vec());
        let debug = format!("{request:?}");
        assert!(debug.contains("a@x"));
        assert!(!debug.contains("secret"));
    }
}
