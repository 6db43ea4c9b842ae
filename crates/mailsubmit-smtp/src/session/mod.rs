//! Session state machine.
//!
//! A [`Session`] owns one connection and walks it through greeting, EHLO,
//! optional STARTTLS and AUTH, then any number of mail transactions:
//!
//! ```text
//! Initial -> EhloPreTls -> (StartTls -> EhloPostTls)? -> Authenticated
//!         -> Sending -> Done -> Sending -> ...
//! ```
//!
//! A soft failure (sender, recipient or message refused) sends RSET and
//! leaves the session in `Authenticated`, ready for the next message. A fatal
//! failure shuts the transport down and leaves it in `Closed`; every later
//! call returns [`Error::NotConnected`].

mod request;

use std::fmt;
use std::net::SocketAddr;

use mailsubmit_sasl::{Authenticator, BuiltinAuthenticator, CredentialProvider};

pub use request::{Receipt, SubmissionRequest};

use crate::command::{Auth, Command, CommandContext, CredentialSlot};
use crate::connection::{Config, SmtpStream, TlsPolicy, Transport, connect, connect_tls};
use crate::error::{Error, ErrorKind, Result};
use crate::parser::read_reply;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::transaction::{TransactionState, reply_code};
use crate::types::Capabilities;

/// EHLO argument when neither a hostname nor a local address is known.
const FALLBACK_HOSTNAME: &str = "localhost.invalid";

/// SASL service name.
const SASL_SERVICE: &str = "smtp";

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Connected, greeting not read yet.
    Initial,
    /// First EHLO.
    EhloPreTls,
    /// STARTTLS and the handshake.
    StartTls,
    /// EHLO over the encrypted channel.
    EhloPostTls,
    /// Ready for a transaction, authenticated if authentication was needed.
    Authenticated,
    /// A transaction is in progress.
    Sending,
    /// A failed transaction is being reset.
    Reset,
    /// The last transaction succeeded.
    Done,
    /// The connection is gone.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::EhloPreTls => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::EhloPostTls => "EHLO after STARTTLS",
            Self::Authenticated => "ready",
            Self::Sending => "sending",
            Self::Reset => "reset",
            Self::Done => "done",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One SMTP submission session.
///
/// # Example
///
/// ```ignore
/// let config = Config::builder("smtp.example.com")
///     .credentials("alice@example.com", "app-password")
///     .build();
/// let mut session = Session::connect(config).await?;
/// session.open().await?;
///
/// let request = SubmissionRequest::from_bytes(sender, message).to(recipient);
/// let receipt = session.submit(request).await?;
/// session.quit().await?;
/// ```
pub struct Session<T: Transport = SmtpStream> {
    transport: T,
    config: Config,
    capabilities: Capabilities,
    credentials: CredentialSlot,
    authenticator: Box<dyn Authenticator>,
    pipeline: Pipeline,
    state: SessionState,
    history: Vec<SessionState>,
}

impl Session<SmtpStream> {
    /// Opens a TCP connection (TLS from the start if `config.implicit_tls`).
    ///
    /// The returned session is in [`SessionState::Initial`]; call
    /// [`open`](Self::open) to read the greeting and negotiate.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or TLS handshake fails, or does
    /// not finish within `config.connect_timeout`.
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        let limit = config.connect_timeout;
        let stream = tokio::time::timeout(limit, async {
            if config.implicit_tls {
                connect_tls(&config.host, config.port).await
            } else {
                connect(&config.host, config.port).await
            }
        })
        .await
        .map_err(|_| Error::Timeout(limit))??;
        Ok(Self::new(stream, config))
    }
}

impl<T: Transport> Session<T> {
    /// Creates a session over an established transport.
    #[must_use]
    pub fn new(transport: T, config: Config) -> Self {
        let credentials = CredentialSlot::new(config.username.clone(), config.password.clone());
        let pipeline = Pipeline::new(PipelineConfig::new().enabled(config.pipelining));
        Self {
            transport,
            config,
            capabilities: Capabilities::default(),
            credentials,
            authenticator: Box::new(BuiltinAuthenticator::new()),
            pipeline,
            state: SessionState::Initial,
            history: vec![SessionState::Initial],
        }
    }

    /// Sets the provider asked for credentials when none are configured.
    #[must_use]
    pub fn with_credential_provider(mut self, provider: Box<dyn CredentialProvider>) -> Self {
        self.credentials.set_provider(provider);
        self
    }

    /// Replaces the built-in SASL mechanisms.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Box<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Every state entered so far, oldest first.
    #[must_use]
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Capabilities from the most recent EHLO.
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Session configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns true if the connection is encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.transport.is_encrypted()
    }

    /// Returns true once the session is usable for [`submit`](Self::submit).
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self.state, SessionState::Authenticated | SessionState::Done)
    }

    /// Reads the greeting and negotiates EHLO, STARTTLS and AUTH.
    ///
    /// # Errors
    ///
    /// An invalid [`Config`] is reported before any I/O and leaves the
    /// session in `Initial`. Any other error is fatal and closes the session.
    pub async fn open(&mut self) -> Result<()> {
        match self.state {
            SessionState::Initial => {}
            SessionState::Closed => return Err(Error::NotConnected),
            state => {
                return Err(Error::InvalidState(format!(
                    "session already opened (state: {state})"
                )));
            }
        }
        self.config.validate()?;
        let result = self.negotiate().await;
        self.settle(result).await
    }

    async fn negotiate(&mut self) -> Result<()> {
        let greeting = read_reply(&mut self.transport, self.config.io_timeout).await?;
        if !greeting.is_success() {
            return Err(Error::smtp_error(
                ErrorKind::GreetingRejected,
                reply_code(&greeting),
                format!(
                    "The server ({}) did not accept the connection. {}",
                    self.config.host,
                    greeting.error_message()
                ),
            ));
        }

        self.set_state(SessionState::EhloPreTls);
        self.ehlo().await?;

        if self.should_start_tls() {
            self.set_state(SessionState::StartTls);
            self.run_command(Command::start_tls()).await?;
            self.transport.start_tls(&self.config.host).await?;
            tracing::debug!(host = %self.config.host, "connection encrypted");

            self.set_state(SessionState::EhloPostTls);
            self.ehlo().await?;
        }

        if self.should_authenticate() {
            self.authenticate().await?;
        }

        self.set_state(SessionState::Authenticated);
        Ok(())
    }

    async fn ehlo(&mut self) -> Result<()> {
        let hostname = self.ehlo_hostname();
        self.run_command(Command::ehlo(hostname)).await?;
        tracing::debug!(
            capabilities = ?self.capabilities.iter().map(|(k, _)| k).collect::<Vec<_>>(),
            "capabilities updated"
        );
        Ok(())
    }

    fn ehlo_hostname(&self) -> String {
        if let Some(name) = &self.config.local_hostname {
            return name.clone();
        }
        self.transport
            .local_addr()
            .map_or_else(|| FALLBACK_HOSTNAME.to_string(), address_literal)
    }

    fn should_start_tls(&self) -> bool {
        if self.transport.is_encrypted() {
            return false;
        }
        match self.config.tls_policy {
            TlsPolicy::Force => true,
            TlsPolicy::UseIfAvailable => self.capabilities.have("STARTTLS"),
            TlsPolicy::ForceNone => false,
        }
    }

    fn should_authenticate(&self) -> bool {
        self.config.username.is_some()
            || self.config.sasl_mechanism.is_some()
            || (!self.capabilities.sasl_mechanisms().is_empty() && self.credentials.has_source())
    }

    async fn authenticate(&mut self) -> Result<()> {
        let mechanisms = self
            .config
            .sasl_mechanism
            .clone()
            .map_or_else(|| self.capabilities.sasl_mechanisms(), |forced| vec![forced]);
        if mechanisms.is_empty() {
            return Err(Error::Auth(
                "Your SMTP server does not support authentication.".to_string(),
            ));
        }

        let client = self
            .authenticator
            .new_client(&mechanisms, SASL_SERVICE, &self.config.host)?;
        tracing::debug!(mechanism = client.mechanism(), "authenticating");
        self.run_command(Command::auth(Auth::new(client))).await
    }

    /// Submits one message.
    ///
    /// A refused sender, recipient or message returns an error and leaves
    /// the session ready for another attempt. Requests the server is known
    /// to reject (no recipients, 8-bit body without `8BITMIME`, size over
    /// the `SIZE` limit) are refused before anything is sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] on a closed session, an
    /// [`ErrorKind::InvalidRequest`] error for a refused request, or the
    /// transaction's failure. Check [`Error::is_fatal`] to know whether
    /// the session survived.
    pub async fn submit(&mut self, request: SubmissionRequest) -> Result<Receipt> {
        self.ensure_ready()?;
        request.check(&self.capabilities, &self.config.host)?;

        self.set_state(SessionState::Sending);
        tracing::debug!(
            sender = %request.sender(),
            recipients = request.recipients().count(),
            "starting transaction"
        );

        let mut tx = TransactionState::new(self.config.recipient_policy);
        for command in request.into_commands() {
            self.pipeline.queue(command);
        }
        let result = self.run_queued(&mut tx).await;
        let result = self.settle(result).await;
        result?;

        if tx.failed_fatally() {
            let err = tx
                .to_error()
                .unwrap_or_else(|| Error::Protocol("transaction failed".to_string()));
            self.abort(&err).await;
            return Err(err);
        }

        if let Some(err) = tx.to_error() {
            tracing::debug!(error = %err, "transaction failed, resetting");
            self.reset().await;
            return Err(err);
        }

        if !tx.is_complete() {
            let err = Error::Protocol("message transfer did not complete".to_string());
            self.abort(&err).await;
            return Err(err);
        }

        self.set_state(SessionState::Done);
        let bytes_sent = tx.bytes_transferred();
        let (reply, rejected_recipients) = tx.take_outcome();
        Ok(Receipt {
            reply: reply.unwrap_or_default(),
            rejected_recipients,
            bytes_sent,
        })
    }

    async fn reset(&mut self) {
        self.set_state(SessionState::Reset);
        match self.run_command(Command::rset()).await {
            Ok(()) => self.set_state(SessionState::Authenticated),
            Err(err) => {
                tracing::warn!(error = %err, "RSET failed");
                self.abort(&err).await;
            }
        }
    }

    /// Sends NOOP.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] on a closed session or the server's
    /// refusal; a transport error closes the session.
    pub async fn noop(&mut self) -> Result<()> {
        self.ensure_ready()?;
        let result = self.run_command(Command::noop()).await;
        self.settle(result).await
    }

    /// Sends QUIT and closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the session is already closed, or
    /// the error from sending QUIT. The session is closed either way.
    pub async fn quit(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(Error::NotConnected);
        }
        let result = self.run_command(Command::quit()).await;
        self.shutdown().await;
        result
    }

    /// Closes the connection without sending anything.
    pub async fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.shutdown().await;
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            SessionState::Authenticated | SessionState::Done => Ok(()),
            SessionState::Closed => Err(Error::NotConnected),
            state => Err(Error::InvalidState(format!(
                "session is not ready (state: {state})"
            ))),
        }
    }

    /// Runs one command outside a mail transaction.
    async fn run_command(&mut self, command: Command) -> Result<()> {
        let mut tx = TransactionState::new(self.config.recipient_policy);
        self.pipeline.queue(command);
        self.run_queued(&mut tx).await?;
        tx.to_error().map_or(Ok(()), Err)
    }

    async fn run_queued(&mut self, tx: &mut TransactionState) -> Result<()> {
        let mut ctx = CommandContext {
            capabilities: &mut self.capabilities,
            credentials: &mut self.credentials,
        };
        self.pipeline
            .execute_queued(&mut self.transport, &mut ctx, tx, self.config.io_timeout)
            .await
    }

    /// Closes the session if `result` is a fatal error.
    async fn settle<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(err) = &result
            && err.is_fatal()
        {
            self.abort(err).await;
        }
        result
    }

    async fn abort(&mut self, err: &Error) {
        tracing::warn!(error = %err, state = %self.state, "closing connection");
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        self.pipeline.clear();
        if let Err(err) = self.transport.shutdown().await {
            tracing::debug!(error = %err, "shutdown failed");
        }
        self.set_state(SessionState::Closed);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "session state");
        }
        self.state = state;
        self.history.push(state);
    }
}

impl<T: Transport> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.config.host)
            .field("state", &self.state)
            .field("encrypted", &self.transport.is_encrypted())
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// EHLO address literal (RFC 5321 section 4.1.3).
fn address_literal(addr: SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => format!("[{}]", v4.ip()),
        SocketAddr::V6(v6) => format!("[IPv6:{}]", v6.ip()),
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
    use crate::connection::FramedStream;
    use crate::types::Address;
    use tokio_test::io::{Builder, Mock};

    fn config() -> Config {
        Config::builder("mx.example.com")
            .local_hostname("client.example.org")
            .build()
    }

    fn session(mock: Mock) -> Session<FramedStream<Mock>> {
        Session::new(FramedStream::new(mock), config())
    }

    fn request() -> SubmissionRequest {
        SubmissionRequest::from_bytes(Address::new("a@x.org").unwrap(), b"hi\r\n".to_vec())
            .to(Address::new("b@y.org").unwrap())
    }

    #[test]
    fn test_address_literal() {
        assert_eq!(address_literal("192.0.2.1:25".parse().unwrap()), "[192.0.2.1]");
        assert_eq!(address_literal("[2001:db8::1]:25".parse().unwrap()), "[IPv6:2001:db8::1]");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Authenticated.to_string(), "ready");
        assert_eq!(SessionState::Closed.to_string(), "closed");
    }

    #[tokio::test]
    async fn test_open_without_extensions() {
        let mock = Builder::new()
            .read(b"220 mx.example.com ESMTP\r\n")
            .write(b"EHLO client.example.org\r\n")
            .read(b"250 mx.example.com\r\n")
            .build();
        let mut session = session(mock);
        session.open().await.unwrap();
        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(
            session.history(),
            [
                SessionState::Initial,
                SessionState::EhloPreTls,
                SessionState::Authenticated
            ]
        );
        assert!(session.is_ready());
        assert!(!session.is_encrypted());
    }

    #[tokio::test]
    async fn test_fallback_hostname() {
        let mock = Builder::new()
            .read(b"220 hi\r\n")
            .write(b"EHLO localhost.invalid\r\n")
            .read(b"250 ok\r\n")
            .build();
        let mut session = Session::new(FramedStream::new(mock), Config::new("mx"));
        session.open().await.unwrap();
    }

    #[tokio::test]
    async fn test_greeting_rejected_closes() {
        let mock = Builder::new().read(b"554 no service\r\n").build();
        let mut session = session(mock);
        let err = session.open().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GreetingRejected);
        assert!(err.to_string().contains("did not accept the connection"));
        assert_eq!(session.state(), SessionState::Closed);

        let err = session.submit(request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
        assert_eq!(session.open().await.unwrap_err().kind(), ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_forced_tls_on_plain_transport_fails() {
        let mock = Builder::new()
            .read(b"220 hi\r\n")
            .write(b"EHLO client.example.org\r\n")
            .read(b"250 mx\r\n")
            .write(b"STARTTLS\r\n")
            .read(b"454 TLS not available\r\n")
            .build();
        let config = Config::builder("mx.example.com")
            .local_hostname("client.example.org")
            .tls_policy(TlsPolicy::Force)
            .build();
        let mut session = Session::new(FramedStream::new(mock), config);
        let err = session.open().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TlsNegotiationFailed);
        assert!(err.to_string().contains("does not support TLS"));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_username_without_auth_support() {
        let mock = Builder::new()
            .read(b"220 hi\r\n")
            .write(b"EHLO client.example.org\r\n")
            .read(b"250 mx\r\n")
            .build();
        let config = Config::builder("mx.example.com")
            .local_hostname("client.example.org")
            .credentials("user", "pass")
            .build();
        let mut session = Session::new(FramedStream::new(mock), config);
        let err = session.open().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_submit_before_open() {
        let mut session = session(Builder::new().build());
        let err = session.submit(request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(session.state(), SessionState::Initial);
    }

    #[tokio::test]
    async fn test_refused_request_sends_nothing() {
        let mock = Builder::new()
            .read(b"220 hi\r\n")
            .write(b"EHLO client.example.org\r\n")
            .read(b"250 mx\r\n")
            .build();
        let mut session = session(mock);
        session.open().await.unwrap();

        let err = session.submit(request().eight_bit(true)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_quit_then_not_connected() {
        let mock = Builder::new()
            .read(b"220 hi\r\n")
            .write(b"EHLO client.example.org\r\n")
            .read(b"250 mx\r\n")
            .write(b"QUIT\r\n")
            .read(b"221 bye\r\n")
            .build();
        let mut session = session(mock);
        session.open().await.unwrap();
        session.quit().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.noop().await.unwrap_err().kind(), ErrorKind::NotConnected);
        assert_eq!(session.quit().await.unwrap_err().kind(), ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_close_sends_nothing() {
        let mock = Builder::new()
            .read(b"220 hi\r\n")
            .write(b"EHLO client.example.org\r\n")
            .read(b"250 mx\r\n")
            .build();
        let mut session = session(mock);
        session.open().await.unwrap();
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }
}
