//! SMTP commands.
//!
//! A [`Command`] renders itself to wire bytes one line (or body chunk) at a
//! time and interprets the replies addressed to it. Failures are recorded in
//! the [`TransactionState`] rather than returned, so the pipeline can keep
//! routing replies in order and the session can decide what a failure means.

mod auth;
mod transfer;

pub use auth::{Auth, CredentialSlot};
pub use transfer::{CHUNK_SIZE, Chunk, DotStuffer, ProgressFn, Transfer};

use crate::error::{ErrorKind, Result};
use crate::transaction::{TransactionState, reply_code};
use crate::types::{Address, Capabilities, Reply, ReplyCode};

/// Session data a command may read or replace while running.
#[derive(Debug)]
pub struct CommandContext<'a> {
    /// Current capability table. EHLO replaces it.
    pub capabilities: &'a mut Capabilities,
    /// Credential source for AUTH.
    pub credentials: &'a mut CredentialSlot,
}

/// Command payloads.
#[derive(Debug)]
pub enum CommandKind {
    /// EHLO, falling back to HELO on `500`/`502`.
    Ehlo {
        /// Client hostname or address literal.
        hostname: String,
        /// True once EHLO was refused and HELO is in use.
        helo: bool,
    },
    /// STARTTLS.
    StartTls,
    /// AUTH exchange.
    Auth(Box<Auth>),
    /// MAIL FROM.
    MailFrom {
        /// Reverse path.
        sender: Address,
        /// Message size for the `SIZE` parameter.
        size: Option<u64>,
        /// Request `BODY=8BITMIME`.
        eight_bit: bool,
    },
    /// RCPT TO, one per recipient.
    RcptTo {
        /// Forward path.
        recipient: Address,
    },
    /// DATA, up to the `354`.
    Data,
    /// Message body and end-of-data marker.
    Transfer(Box<Transfer>),
    /// RSET.
    Rset,
    /// QUIT.
    Quit,
    /// NOOP.
    Noop,
}

/// One queued SMTP command.
#[derive(Debug)]
pub struct Command {
    kind: CommandKind,
    complete: bool,
    needs_response: bool,
}

impl Command {
    const fn from_kind(kind: CommandKind) -> Self {
        Self {
            kind,
            complete: false,
            needs_response: false,
        }
    }

    /// `EHLO <hostname>`.
    #[must_use]
    pub fn ehlo(hostname: impl Into<String>) -> Self {
        Self::from_kind(CommandKind::Ehlo {
            hostname: hostname.into(),
            helo: false,
        })
    }

    /// `STARTTLS`.
    #[must_use]
    pub const fn start_tls() -> Self {
        Self::from_kind(CommandKind::StartTls)
    }

    /// `AUTH` driven by `auth`.
    #[must_use]
    pub fn auth(auth: Auth) -> Self {
        Self::from_kind(CommandKind::Auth(Box::new(auth)))
    }

    /// `MAIL FROM:<sender>`.
    #[must_use]
    pub const fn mail_from(sender: Address, size: Option<u64>, eight_bit: bool) -> Self {
        Self::from_kind(CommandKind::MailFrom {
            sender,
            size,
            eight_bit,
        })
    }

    /// `RCPT TO:<recipient>`.
    #[must_use]
    pub const fn rcpt_to(recipient: Address) -> Self {
        Self::from_kind(CommandKind::RcptTo { recipient })
    }

    /// `DATA`.
    #[must_use]
    pub const fn data() -> Self {
        Self::from_kind(CommandKind::Data)
    }

    /// Message body transfer.
    #[must_use]
    pub fn transfer(transfer: Transfer) -> Self {
        Self::from_kind(CommandKind::Transfer(Box::new(transfer)))
    }

    /// `RSET`.
    #[must_use]
    pub const fn rset() -> Self {
        Self::from_kind(CommandKind::Rset)
    }

    /// `QUIT`.
    #[must_use]
    pub const fn quit() -> Self {
        Self::from_kind(CommandKind::Quit)
    }

    /// `NOOP`.
    #[must_use]
    pub const fn noop() -> Self {
        Self::from_kind(CommandKind::Noop)
    }

    /// Payload.
    #[must_use]
    pub const fn kind(&self) -> &CommandKind {
        &self.kind
    }

    /// Verb used in logs and error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match &self.kind {
            CommandKind::Ehlo { helo: false, .. } => "EHLO",
            CommandKind::Ehlo { helo: true, .. } => "HELO",
            CommandKind::StartTls => "STARTTLS",
            CommandKind::Auth(_) => "AUTH",
            CommandKind::MailFrom { .. } => "MAIL FROM",
            CommandKind::RcptTo { .. } => "RCPT TO",
            CommandKind::Data => "DATA",
            CommandKind::Transfer(_) => "message body",
            CommandKind::Rset => "RSET",
            CommandKind::Quit => "QUIT",
            CommandKind::Noop => "NOOP",
        }
    }

    /// True when nothing is left to send and the last reply was handled.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    /// True while the command waits for a reply before producing more.
    #[must_use]
    pub const fn needs_response(&self) -> bool {
        self.needs_response
    }

    /// Lines that must never reach the log verbatim.
    #[must_use]
    pub const fn is_sensitive(&self) -> bool {
        matches!(self.kind, CommandKind::Auth(_))
    }

    /// Nothing may be batched before this command.
    #[must_use]
    pub const fn must_be_first_in_pipeline(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::Ehlo { .. }
                | CommandKind::StartTls
                | CommandKind::Auth(_)
                | CommandKind::Transfer(_)
        )
    }

    /// Nothing may be batched after this command.
    #[must_use]
    pub const fn must_be_last_in_pipeline(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::Ehlo { .. }
                | CommandKind::StartTls
                | CommandKind::Auth(_)
                | CommandKind::Data
                | CommandKind::Quit
        )
    }

    /// A failure of this command leaves the connection unusable.
    #[must_use]
    pub const fn close_connection_on_error(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::Ehlo { .. } | CommandKind::StartTls | CommandKind::Auth(_)
        )
    }

    /// True if the command should be dropped without being sent.
    #[must_use]
    pub const fn do_not_execute(&self, tx: &TransactionState) -> bool {
        match self.kind {
            CommandKind::RcptTo { .. } => tx.failed_fatally() || tx.mail_from_failed(),
            CommandKind::Data | CommandKind::Transfer(_) => tx.failed(),
            _ => false,
        }
    }

    /// Produces the next chunk of wire bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if AUTH cannot produce a response or the message
    /// source fails. Both are fatal to the session.
    pub async fn next_command_line(
        &mut self,
        ctx: &mut CommandContext<'_>,
        tx: &mut TransactionState,
    ) -> Result<Vec<u8>> {
        let mut complete = true;
        let mut needs_response = true;

        let line = match &mut self.kind {
            CommandKind::Ehlo { hostname, helo } => {
                let verb = if *helo { "HELO" } else { "EHLO" };
                format!("{verb} {hostname}\r\n").into_bytes()
            }
            CommandKind::StartTls => b"STARTTLS\r\n".to_vec(),
            CommandKind::Auth(auth) => auth.next_line(ctx.credentials)?,
            CommandKind::MailFrom {
                sender,
                size,
                eight_bit,
            } => {
                let mut line = format!("MAIL FROM:{sender}");
                if *eight_bit && ctx.capabilities.have("8BITMIME") {
                    line.push_str(" BODY=8BITMIME");
                }
                if let Some(size) = size.filter(|_| ctx.capabilities.have("SIZE")) {
                    line.push_str(&format!(" SIZE={size}"));
                }
                line.push_str("\r\n");
                line.into_bytes()
            }
            CommandKind::RcptTo { recipient } => format!("RCPT TO:{recipient}\r\n").into_bytes(),
            CommandKind::Data => {
                tx.set_data_command_issued();
                b"DATA\r\n".to_vec()
            }
            CommandKind::Transfer(transfer) => {
                let before = transfer.bytes_read();
                match transfer.next_chunk().await? {
                    Chunk::Body(bytes) => {
                        complete = false;
                        needs_response = false;
                        tx.record_transferred(transfer.bytes_read().saturating_sub(before));
                        bytes
                    }
                    Chunk::End(terminator) => terminator.to_vec(),
                }
            }
            CommandKind::Rset => b"RSET\r\n".to_vec(),
            CommandKind::Quit => b"QUIT\r\n".to_vec(),
            CommandKind::Noop => b"NOOP\r\n".to_vec(),
        };

        self.complete = complete;
        self.needs_response = needs_response;
        Ok(line)
    }

    /// Interprets a reply addressed to this command.
    ///
    /// Returns false on failure, with details in `tx`. A command that needs
    /// another round trip (HELO fallback, AUTH challenge) comes back
    /// incomplete.
    pub fn process_response(
        &mut self,
        reply: &Reply,
        ctx: &mut CommandContext<'_>,
        tx: &mut TransactionState,
    ) -> bool {
        self.needs_response = false;

        if reply.is(ReplyCode::SERVICE_UNAVAILABLE) {
            tx.fail_fatally(
                ErrorKind::ProtocolDesync,
                ReplyCode::SERVICE_UNAVAILABLE,
                format!(
                    "The server is closing the connection in response to {}. {}",
                    self.name(),
                    reply.error_message()
                ),
            );
            return false;
        }

        let code = reply_code(reply);
        match &mut self.kind {
            CommandKind::Ehlo { helo, .. } => {
                if code == ReplyCode::SYNTAX_ERROR || code == ReplyCode::NOT_IMPLEMENTED {
                    if *helo {
                        tx.fail(
                            ErrorKind::CommandRejected,
                            code,
                            "The server rejected both EHLO and HELO commands as unknown \
                             or unimplemented. Please contact the server's system \
                             administrator.",
                        );
                        return false;
                    }
                    tracing::debug!("EHLO refused, falling back to HELO");
                    *helo = true;
                    self.complete = false;
                    return true;
                }
                if reply.is_success() {
                    *ctx.capabilities = if *helo {
                        Capabilities::default()
                    } else {
                        Capabilities::from_ehlo(reply)
                    };
                    return true;
                }
                let verb = if *helo { "HELO" } else { "EHLO" };
                tx.fail(
                    ErrorKind::CommandRejected,
                    code,
                    format!(
                        "Unexpected server response to {verb} command. {}",
                        reply.error_message()
                    ),
                );
                false
            }
            CommandKind::StartTls => {
                if reply.is(ReplyCode::SERVICE_READY) {
                    return true;
                }
                tx.fail(
                    ErrorKind::TlsNegotiationFailed,
                    code,
                    format!(
                        "Your SMTP server does not support TLS. Disable TLS if you \
                         want to connect without encryption. {}",
                        reply.error_message()
                    ),
                );
                false
            }
            CommandKind::Auth(auth) => match auth.on_reply(reply, ctx.capabilities, tx) {
                Some(more) => {
                    self.complete = !more;
                    true
                }
                None => false,
            },
            CommandKind::MailFrom { sender, .. } => {
                if reply.is_success() {
                    return true;
                }
                tx.set_mail_from_failed(sender, reply);
                false
            }
            CommandKind::RcptTo { recipient } => {
                if reply.is_success() {
                    tx.set_recipient_accepted();
                    return true;
                }
                tx.add_rejected_recipient(recipient, reply);
                false
            }
            CommandKind::Data => {
                let ok = reply.is(ReplyCode::START_DATA);
                tx.set_data_command_succeeded(ok, reply);
                ok
            }
            CommandKind::Transfer(_) => {
                let ok = reply.is_success();
                if !ok {
                    tx.fail(
                        ErrorKind::MessageRejected,
                        code,
                        format!(
                            "The message content was not accepted. {}",
                            reply.error_message()
                        ),
                    );
                }
                tx.set_complete(reply.clone());
                ok
            }
            CommandKind::Rset | CommandKind::Noop => {
                if reply.is_success() {
                    return true;
                }
                tx.fail(
                    ErrorKind::CommandRejected,
                    code,
                    format!(
                        "Unexpected server response to {} command. {}",
                        self.name(),
                        reply.error_message()
                    ),
                );
                false
            }
            // Whatever the server says, the session ends.
            CommandKind::Quit => true,
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
    use crate::connection::RecipientPolicy;

    struct Fixture {
        caps: Capabilities,
        creds: CredentialSlot,
        tx: TransactionState,
    }

    impl Fixture {
        fn new(ehlo_lines: &[&str]) -> Self {
            let mut caps = Capabilities::default();
            if !ehlo_lines.is_empty() {
                let mut r = Reply::new();
                let last = ehlo_lines.len() - 1;
                for (i, l) in ehlo_lines.iter().enumerate() {
                    let sep = if i == last { ' ' } else { '-' };
                    r.parse_line(format!("250{sep}{l}\r\n").as_bytes());
                }
                caps = Capabilities::from_ehlo(&r);
            }
            Self {
                caps,
                creds: CredentialSlot::default(),
                tx: TransactionState::new(RecipientPolicy::RejectAny),
            }
        }

        async fn line(&mut self, cmd: &mut Command) -> String {
            let mut ctx = CommandContext {
                capabilities: &mut self.caps,
                credentials: &mut self.creds,
            };
            let bytes = cmd.next_command_line(&mut ctx, &mut self.tx).await.unwrap();
            String::from_utf8(bytes).unwrap()
        }

        fn reply(&mut self, cmd: &mut Command, code: u16, text: &str) -> bool {
            let mut ctx = CommandContext {
                capabilities: &mut self.caps,
                credentials: &mut self.creds,
            };
            cmd.process_response(&Reply::single(ReplyCode::new(code), text), &mut ctx, &mut self.tx)
        }
    }

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_ehlo_replaces_capabilities() {
        let mut f = Fixture::new(&["old", "STARTTLS"]);
        let mut cmd = Command::ehlo("client.example.org");
        assert_eq!(f.line(&mut cmd).await, "EHLO client.example.org\r\n");
        assert!(cmd.is_complete());
        assert!(cmd.needs_response());

        let mut reply = Reply::new();
        reply.parse_line(b"250-mx.example.com\r\n");
        reply.parse_line(b"250 PIPELINING\r\n");
        let mut ctx = CommandContext {
            capabilities: &mut f.caps,
            credentials: &mut f.creds,
        };
        assert!(cmd.process_response(&reply, &mut ctx, &mut f.tx));
        assert!(f.caps.have("PIPELINING"));
        assert!(!f.caps.have("STARTTLS"));
    }

    #[tokio::test]
    async fn test_ehlo_falls_back_to_helo() {
        let mut f = Fixture::new(&["old", "STARTTLS"]);
        let mut cmd = Command::ehlo("client");
        f.line(&mut cmd).await;
        assert!(f.reply(&mut cmd, 502, "what?"));
        assert!(!cmd.is_complete());
        assert_eq!(cmd.name(), "HELO");

        assert_eq!(f.line(&mut cmd).await, "HELO client\r\n");
        assert!(f.reply(&mut cmd, 250, "hello"));
        assert!(cmd.is_complete());
        assert!(f.caps.is_empty());
    }

    #[tokio::test]
    async fn test_helo_refused_too() {
        let mut f = Fixture::new(&[]);
        let mut cmd = Command::ehlo("client");
        f.line(&mut cmd).await;
        assert!(f.reply(&mut cmd, 500, "no"));
        f.line(&mut cmd).await;
        assert!(!f.reply(&mut cmd, 500, "no"));
        assert_eq!(f.tx.error().unwrap().kind, ErrorKind::CommandRejected);
        assert!(cmd.close_connection_on_error());
    }

    #[tokio::test]
    async fn test_mail_from_parameters_follow_capabilities() {
        let mut f = Fixture::new(&["mx", "SIZE 1000000", "8BITMIME"]);
        let mut cmd = Command::mail_from(addr("a@x"), Some(1234), true);
        assert_eq!(
            f.line(&mut cmd).await,
            "MAIL FROM:<a@x> BODY=8BITMIME SIZE=1234\r\n"
        );

        let mut f = Fixture::new(&["mx"]);
        let mut cmd = Command::mail_from(addr("a@x"), Some(1234), true);
        assert_eq!(f.line(&mut cmd).await, "MAIL FROM:<a@x>\r\n");
    }

    #[tokio::test]
    async fn test_mail_from_rejection_is_soft() {
        let mut f = Fixture::new(&[]);
        let mut cmd = Command::mail_from(addr("a@x"), None, false);
        f.line(&mut cmd).await;
        assert!(!f.reply(&mut cmd, 553, "sender not allowed"));
        assert!(f.tx.failed());
        assert!(!f.tx.failed_fatally());
        assert!(Command::rcpt_to(addr("b@y")).do_not_execute(&f.tx));
    }

    #[tokio::test]
    async fn test_rcpt_rejection_skips_data() {
        let mut f = Fixture::new(&[]);
        let mut cmd = Command::rcpt_to(addr("b@y"));
        assert_eq!(f.line(&mut cmd).await, "RCPT TO:<b@y>\r\n");
        assert!(!f.reply(&mut cmd, 550, "no such user"));
        assert!(Command::data().do_not_execute(&f.tx));
        assert!(!Command::rcpt_to(addr("c@z")).do_not_execute(&f.tx));
    }

    #[tokio::test]
    async fn test_421_is_fatal_for_any_command() {
        let mut f = Fixture::new(&[]);
        let mut cmd = Command::rcpt_to(addr("b@y"));
        f.line(&mut cmd).await;
        assert!(!f.reply(&mut cmd, 421, "shutting down"));
        assert!(f.tx.failed_fatally());
        assert_eq!(f.tx.error().unwrap().kind, ErrorKind::ProtocolDesync);
    }

    #[tokio::test]
    async fn test_data_then_transfer() {
        let mut f = Fixture::new(&[]);
        let mut data = Command::data();
        assert_eq!(f.line(&mut data).await, "DATA\r\n");
        assert!(f.tx.data_command_issued());
        assert!(f.reply(&mut data, 354, "go ahead"));

        let body = b"Subject: x\n\n.\n".to_vec();
        let mut cmd = Command::transfer(Transfer::new(Box::new(std::io::Cursor::new(body))));
        assert_eq!(f.line(&mut cmd).await, "Subject: x\r\n\r\n..\r\n");
        assert!(!cmd.is_complete());
        assert!(!cmd.needs_response());
        assert_eq!(f.line(&mut cmd).await, ".\r\n");
        assert!(cmd.is_complete());
        assert!(cmd.needs_response());
        assert_eq!(f.tx.bytes_transferred(), 14);

        assert!(f.reply(&mut cmd, 250, "queued as 1234"));
        assert!(f.tx.is_complete());
        assert_eq!(f.tx.final_reply().unwrap().message_text(), "queued as 1234");
    }

    #[test]
    fn test_pipeline_flags() {
        assert!(Command::ehlo("h").must_be_first_in_pipeline());
        assert!(Command::ehlo("h").must_be_last_in_pipeline());
        assert!(Command::start_tls().must_be_last_in_pipeline());
        assert!(Command::data().must_be_last_in_pipeline());
        assert!(!Command::data().must_be_first_in_pipeline());
        assert!(!Command::rcpt_to(addr("a@x")).must_be_last_in_pipeline());
        assert!(!Command::mail_from(addr("a@x"), None, false).close_connection_on_error());
        let transfer = Command::transfer(Transfer::new(Box::new(std::io::Cursor::new(Vec::new()))));
        assert!(transfer.must_be_first_in_pipeline());
        assert!(!transfer.must_be_last_in_pipeline());
    }
}
