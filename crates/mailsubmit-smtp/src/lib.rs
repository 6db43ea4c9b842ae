//! # mailsubmit-smtp
//!
//! An SMTP message-submission client engine (RFC 5321, 6409).
//!
//! ## Features
//!
//! - **Pipelining** (RFC 2920): envelope commands go out in one batch when
//!   the server allows it, one at a time otherwise
//! - **TLS**: STARTTLS (RFC 3207) with a configurable policy, or implicit
//!   TLS on port 465
//! - **Authentication** (RFC 4954): pluggable SASL through
//!   [`mailsubmit_sasl`], credentials pulled on demand
//! - **Transactions**: refused senders and recipients are reset with RSET and
//!   the session stays usable; fatal errors close it
//! - **Streaming bodies**: the message is read, dot-stuffed and written in
//!   chunks, with progress reporting
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailsubmit_smtp::{Address, Config, Session, SubmissionRequest};
//!
//! #[tokio::main]
//! async fn main() -> mailsubmit_smtp::Result<()> {
//!     let config = Config::builder("smtp.example.com")
//!         .credentials("user@example.com", "password")
//!         .build();
//!
//!     let mut session = Session::connect(config).await?;
//!     session.open().await?;
//!
//!     let request = SubmissionRequest::from_bytes(
//!         Address::new("user@example.com")?,
//!         b"Subject: Test\r\n\r\nHello, World!\r\n".to_vec(),
//!     )
//!     .to(Address::new("recipient@example.com")?);
//!
//!     let receipt = session.submit(request).await?;
//!     println!("{}", receipt.reply.message_text());
//!
//!     session.quit().await
//! }
//! ```
//!
//! ## Session States
//!
//! ```text
//! Initial ─→ EhloPreTls ─┬─→ StartTls ─→ EhloPostTls ─┬─→ Authenticated ─→ Sending ─→ Done
//!                        └─────────────────────────────┘        ↑              │
//!                                                               └── Reset ←────┘ (soft failure)
//! ```
//!
//! Any fatal error moves the session to `Closed`.
//!
//! ## Modules
//!
//! - [`command`]: SMTP commands and their reply handling
//! - [`connection`]: Transport trait, TCP/TLS streams, configuration
//! - [`parser`]: Reply reader
//! - [`pipeline`]: Command batching
//! - [`transaction`]: Per-transaction outcome tracking
//! - [`types`]: Addresses, capabilities, replies

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
pub mod connection;
mod error;
pub mod parser;
pub mod pipeline;
mod session;
pub mod transaction;
pub mod types;

pub use connection::{
    Config, ConfigBuilder, RecipientPolicy, SmtpStream, TlsPolicy, Transport, connect,
    connect_tls,
};
pub use error::{Error, ErrorKind, Result};
pub use session::{Receipt, Session, SessionState, SubmissionRequest};
pub use transaction::{RecipientRejection, TransactionState};
pub use types::{Address, Capabilities, Reply, ReplyCode};

pub use mailsubmit_sasl::{
    Authenticator, BuiltinAuthenticator, CredentialProvider, Credentials, SaslClient,
};
