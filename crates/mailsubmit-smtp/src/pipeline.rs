//! Command pipelining (RFC 2920).
//!
//! Queued commands are packed into batches and each batch goes out in a
//! single write. Replies are then matched to the batch in FIFO order. A
//! batch ends at any command that needs a reply before the next one can be
//! written (EHLO, STARTTLS, AUTH, DATA), and without the `PIPELINING`
//! extension every command is a batch of its own.
//!
//! Message bodies are streamed: a body keeps adding chunks to the batch and
//! the batch is flushed whenever it grows past
//! [`PipelineConfig::flush_threshold`].
//!
//! # Example
//!
//! ```ignore
//! let mut pipeline = Pipeline::new(PipelineConfig::new().enabled(true));
//! pipeline.queue(Command::mail_from(sender, None, false));
//! pipeline.queue(Command::rcpt_to(recipient));
//! pipeline.queue(Command::data());
//! pipeline.execute_queued(&mut transport, &mut ctx, &mut tx, timeout).await?;
//! ```

// VecDeque operations keep most of these from being const.
#![allow(clippy::missing_const_for_fn)]

use std::collections::VecDeque;
use std::time::Duration;

use crate::command::{Command, CommandContext};
use crate::connection::Transport;
use crate::error::Result;
use crate::parser::read_reply;
use crate::transaction::TransactionState;

/// Batch size at which a message body is flushed.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 32 * 1024;

/// Batches larger than this are logged by size only.
const MAX_LOGGED_BATCH: usize = 4 * 1024;

/// Configuration for command pipelining.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Use pipelining when the server advertises `PIPELINING`.
    pub enabled: bool,

    /// Flush a message body once the pending batch reaches this size.
    pub flush_threshold: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables pipelining.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the body flush threshold.
    #[must_use]
    pub fn flush_threshold(mut self, bytes: usize) -> Self {
        self.flush_threshold = bytes.max(1);
        self
    }
}

/// Pending and in-flight command queues.
#[derive(Debug, Default)]
pub struct Pipeline {
    pending: VecDeque<Command>,
    sent: VecDeque<Command>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            pending: VecDeque::new(),
            sent: VecDeque::new(),
            config,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Appends a command to the queue.
    pub fn queue(&mut self, command: Command) {
        self.pending.push_back(command);
    }

    /// Number of commands not yet sent.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is queued or awaiting a reply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.sent.is_empty()
    }

    /// Drops every queued and in-flight command.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.sent.clear();
    }

    /// Runs every queued command.
    ///
    /// Returns `Ok` once the queue is drained or the transaction has failed;
    /// the failure itself is recorded in `tx`. Both queues are empty
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns transport, timeout, malformed-reply and message-source
    /// errors. Any of them leaves the connection unusable.
    pub async fn execute_queued<T: Transport>(
        &mut self,
        transport: &mut T,
        ctx: &mut CommandContext<'_>,
        tx: &mut TransactionState,
        timeout: Duration,
    ) -> Result<()> {
        let result = self.run(transport, ctx, tx, timeout).await;
        self.clear();
        result
    }

    async fn run<T: Transport>(
        &mut self,
        transport: &mut T,
        ctx: &mut CommandContext<'_>,
        tx: &mut TransactionState,
        timeout: Duration,
    ) -> Result<()> {
        while !self.pending.is_empty() {
            let batch = self.collect(ctx, tx).await?;
            if tx.failed() {
                break;
            }
            if batch.is_empty() {
                continue;
            }

            transport.write_all(&batch).await?;
            self.process_responses(transport, ctx, tx, timeout).await?;
            if tx.failed_fatally() {
                break;
            }
        }
        Ok(())
    }

    /// Moves commands from `pending` to `sent`, returning their wire bytes.
    async fn collect(
        &mut self,
        ctx: &mut CommandContext<'_>,
        tx: &mut TransactionState,
    ) -> Result<Vec<u8>> {
        let pipelining = self.config.enabled && ctx.capabilities.have("PIPELINING");
        let mut batch = Vec::new();

        while let Some(cmd) = self.pending.front_mut() {
            if cmd.do_not_execute(tx) {
                tracing::debug!(command = cmd.name(), "skipping command");
                self.pending.pop_front();
                if batch.is_empty() {
                    continue;
                }
                break;
            }

            if !batch.is_empty() && (cmd.must_be_first_in_pipeline() || !pipelining) {
                break;
            }

            loop {
                let line = cmd.next_command_line(ctx, tx).await?;
                log_line(cmd, &line);
                batch.extend_from_slice(&line);
                if cmd.is_complete() || cmd.needs_response() {
                    break;
                }
                if batch.len() >= self.config.flush_threshold {
                    // The body stays at the head of the queue.
                    return Ok(batch);
                }
            }

            let Some(cmd) = self.pending.pop_front() else {
                break;
            };
            let last = cmd.must_be_last_in_pipeline();
            self.sent.push_back(cmd);
            if last {
                break;
            }
        }

        Ok(batch)
    }

    /// Reads one reply for each command in `sent`, in order.
    async fn process_responses<T: Transport>(
        &mut self,
        transport: &mut T,
        ctx: &mut CommandContext<'_>,
        tx: &mut TransactionState,
        timeout: Duration,
    ) -> Result<()> {
        while let Some(mut cmd) = self.sent.pop_front() {
            let reply = read_reply(transport, timeout).await?;
            let ok = cmd.process_response(&reply, ctx, tx);
            if !ok && cmd.close_connection_on_error() {
                tx.escalate();
            }
            if tx.failed_fatally() {
                tracing::warn!(command = cmd.name(), "transaction failed fatally");
                return Ok(());
            }
            if !cmd.is_complete() {
                self.pending.push_front(cmd);
            }
        }
        Ok(())
    }
}

fn log_line(cmd: &Command, line: &[u8]) {
    if cmd.is_sensitive() {
        tracing::trace!(command = cmd.name(), "C: <authentication data>");
    } else if line.len() > MAX_LOGGED_BATCH {
        tracing::trace!(bytes = line.len(), "C: <message data>");
    } else {
        tracing::trace!(line = %String::from_utf8_lossy(line).trim_end(), "C:");
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
    use crate::command::{CredentialSlot, Transfer};
    use crate::connection::{FramedStream, RecipientPolicy};
    use crate::error::ErrorKind;
    use crate::types::{Address, Capabilities, Reply};
    use tokio_test::io::Builder;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn caps(keywords: &[&str]) -> Capabilities {
        let mut reply = Reply::new();
        reply.parse_line(b"250-mx.example.com\r\n");
        for kw in keywords {
            reply.parse_line(format!("250-{kw}\r\n").as_bytes());
        }
        reply.parse_line(b"250 HELP\r\n");
        Capabilities::from_ehlo(&reply)
    }

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn queue_envelope(pipeline: &mut Pipeline, recipients: &[&str]) {
        pipeline.queue(Command::mail_from(addr("a@example.org"), None, false));
        for r in recipients {
            pipeline.queue(Command::rcpt_to(addr(r)));
        }
        pipeline.queue(Command::data());
    }

    async fn run(
        pipeline: &mut Pipeline,
        mock: tokio_test::io::Mock,
        capabilities: &mut Capabilities,
        tx: &mut TransactionState,
    ) -> Result<()> {
        let mut framed = FramedStream::new(mock);
        let mut credentials = CredentialSlot::default();
        let mut ctx = CommandContext {
            capabilities,
            credentials: &mut credentials,
        };
        pipeline
            .execute_queued(&mut framed, &mut ctx, tx, TIMEOUT)
            .await
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new().enabled(false).flush_threshold(0);
        assert!(!config.enabled);
        assert_eq!(config.flush_threshold, 1);
        assert_eq!(PipelineConfig::default().flush_threshold, DEFAULT_FLUSH_THRESHOLD);
    }

    #[tokio::test]
    async fn test_envelope_in_one_batch() {
        let mock = Builder::new()
            .write(b"MAIL FROM:<a@example.org>\r\nRCPT TO:<b@example.net>\r\nRCPT TO:<c@example.net>\r\nDATA\r\n")
            .read(b"250 ok\r\n250 ok\r\n250 ok\r\n354 go ahead\r\n")
            .build();
        let mut pipeline = Pipeline::new(PipelineConfig::new());
        queue_envelope(&mut pipeline, &["b@example.net", "c@example.net"]);
        let mut caps = caps(&["PIPELINING"]);
        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);

        run(&mut pipeline, mock, &mut caps, &mut tx).await.unwrap();
        assert!(!tx.failed());
        assert!(tx.data_command_succeeded());
        assert!(pipeline.is_empty());
    }

    #[tokio::test]
    async fn test_one_command_per_batch_without_pipelining() {
        let mock = Builder::new()
            .write(b"MAIL FROM:<a@example.org>\r\n")
            .read(b"250 ok\r\n")
            .write(b"RCPT TO:<b@example.net>\r\n")
            .read(b"250 ok\r\n")
            .write(b"DATA\r\n")
            .read(b"354 go ahead\r\n")
            .build();
        // Advertised but disabled locally.
        let mut pipeline = Pipeline::new(PipelineConfig::new().enabled(false));
        queue_envelope(&mut pipeline, &["b@example.net"]);
        let mut caps = caps(&["PIPELINING"]);
        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);

        run(&mut pipeline, mock, &mut caps, &mut tx).await.unwrap();
        assert!(tx.data_command_succeeded());
    }

    #[tokio::test]
    async fn test_sender_rejection_drops_rest() {
        let mock = Builder::new()
            .write(b"MAIL FROM:<a@example.org>\r\n")
            .read(b"553 sender not allowed\r\n")
            .build();
        let mut pipeline = Pipeline::new(PipelineConfig::new());
        queue_envelope(&mut pipeline, &["b@example.net"]);
        let mut caps = caps(&[]);
        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);

        run(&mut pipeline, mock, &mut caps, &mut tx).await.unwrap();
        assert!(tx.failed());
        assert!(!tx.failed_fatally());
        assert_eq!(tx.error().unwrap().kind, ErrorKind::SenderRejected);
        assert!(pipeline.is_empty());
    }

    #[tokio::test]
    async fn test_data_accepted_after_failure_is_fatal() {
        let mock = Builder::new()
            .write(b"MAIL FROM:<a@example.org>\r\nRCPT TO:<b@example.net>\r\nDATA\r\n")
            .read(b"250 ok\r\n550 no such user\r\n354 go ahead\r\n")
            .build();
        let mut pipeline = Pipeline::new(PipelineConfig::new());
        queue_envelope(&mut pipeline, &["b@example.net"]);
        let mut caps = caps(&["PIPELINING"]);
        let mut tx = TransactionState::new(RecipientPolicy::RejectAny);

        run(&mut pipeline, mock, &mut caps, &mut tx).await.unwrap();
        assert!(tx.failed_fatally());
        assert_eq!(tx.rejected_recipients().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_recipients_continue() {
        let mock = Builder::new()
            .write(b"MAIL FROM:<a@example.org>\r\nRCPT TO:<b@example.net>\r\nRCPT TO:<c@example.net>\r\nDATA\r\n")
            .read(b"250 ok\r\n550 no such user\r\n250 ok\r\n354 go ahead\r\n")
            .build();
        let mut pipeline = Pipeline::new(PipelineConfig::new());
        queue_envelope(&mut pipeline, &["b@example.net", "c@example.net"]);
        let mut caps = caps(&["PIPELINING"]);
        let mut tx = TransactionState::new(RecipientPolicy::AllowPartial);

        run(&mut pipeline, mock, &mut caps, &mut tx).await.unwrap();
        assert!(!tx.failed());
        assert!(tx.recipient_accepted());
        assert_eq!(tx.rejected_recipients()[0].recipient.as_str(), "b@example.net");
    }

    #[tokio::test]
    async fn test_ehlo_retries_as_helo() {
        let mock = Builder::new()
            .write(b"EHLO client.example.org\r\n")
            .read(b"502 command not implemented\r\n")
            .write(b"HELO client.example.org\r\n")
            .read(b"250 hello\r\n")
            .build();
        let mut pipeline = Pipeline::new(PipelineConfig::new());
        pipeline.queue(Command::ehlo("client.example.org"));
        let mut caps = caps(&["PIPELINING"]);
        let mut tx = TransactionState::default();

        run(&mut pipeline, mock, &mut caps, &mut tx).await.unwrap();
        assert!(!tx.failed());
        assert!(caps.is_empty());
    }

    #[tokio::test]
    async fn test_ehlo_failure_is_fatal() {
        let mock = Builder::new()
            .write(b"EHLO client\r\n")
            .read(b"554 go away\r\n")
            .build();
        let mut pipeline = Pipeline::new(PipelineConfig::new());
        pipeline.queue(Command::ehlo("client"));
        let mut caps = Capabilities::default();
        let mut tx = TransactionState::default();

        run(&mut pipeline, mock, &mut caps, &mut tx).await.unwrap();
        assert!(tx.failed_fatally());
        assert_eq!(tx.error().unwrap().kind, ErrorKind::CommandRejected);
    }

    #[tokio::test]
    async fn test_421_stops_reading_replies() {
        let mock = Builder::new()
            .write(b"MAIL FROM:<a@example.org>\r\nRCPT TO:<b@example.net>\r\nDATA\r\n")
            .read(b"421 shutting down\r\n")
            .build();
        let mut pipeline = Pipeline::new(PipelineConfig::new());
        queue_envelope(&mut pipeline, &["b@example.net"]);
        let mut caps = caps(&["PIPELINING"]);
        let mut tx = TransactionState::default();

        run(&mut pipeline, mock, &mut caps, &mut tx).await.unwrap();
        assert!(tx.failed_fatally());
        assert_eq!(tx.error().unwrap().kind, ErrorKind::ProtocolDesync);
    }

    #[tokio::test]
    async fn test_large_body_is_flushed_in_batches() {
        let line = "x".repeat(99) + "\n";
        let body = line.repeat(1000);
        let mut wire = body.replace('\n', "\r\n").into_bytes();
        wire.extend_from_slice(b".\r\n");

        let mock = Builder::new()
            .write(&wire)
            .read(b"250 queued\r\n")
            .build();
        let mut pipeline = Pipeline::new(PipelineConfig::new());
        pipeline.queue(Command::transfer(Transfer::new(Box::new(
            std::io::Cursor::new(body.into_bytes()),
        ))));
        let mut caps = caps(&["PIPELINING"]);
        let mut tx = TransactionState::default();

        run(&mut pipeline, mock, &mut caps, &mut tx).await.unwrap();
        assert!(tx.is_complete());
        assert_eq!(tx.bytes_transferred(), 100_000);
    }

    #[tokio::test]
    async fn test_timeout_is_an_error() {
        tokio::time::pause();
        let mock = Builder::new()
            .write(b"NOOP\r\n")
            .wait(Duration::from_secs(10))
            .build();
        let mut pipeline = Pipeline::new(PipelineConfig::new());
        pipeline.queue(Command::noop());
        let mut caps = Capabilities::default();
        let mut tx = TransactionState::default();

        let err = run(&mut pipeline, mock, &mut caps, &mut tx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(pipeline.is_empty());
    }
}
