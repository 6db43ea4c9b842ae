//! Transport, streams and connection configuration.
//!
//! The engine talks to the network only through [`Transport`]. The default
//! implementation, [`SmtpStream`], is TCP with `rustls` for STARTTLS and
//! implicit TLS; tests substitute scripted transports.

mod config;
mod framed;
mod stream;

use std::future::Future;
use std::net::SocketAddr;

pub use config::{Config, ConfigBuilder, RecipientPolicy, TlsPolicy};
pub use framed::{FramedStream, MAX_LINE_LENGTH};
pub use stream::{SmtpStream, connect, connect_tls, create_tls_connector};

use crate::error::Result;

/// Byte transport underneath a session.
///
/// Every method is a suspension point. Implementations need not apply
/// timeouts; the session wraps each read in its own.
pub trait Transport: Send {
    /// Writes one pipeline batch and flushes it.
    fn write_all(&mut self, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Reads one line, terminator included.
    ///
    /// End of stream is an error.
    fn read_line(&mut self) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Upgrades the connection in place after the server accepted STARTTLS.
    fn start_tls(&mut self, server_name: &str) -> impl Future<Output = Result<()>> + Send;

    /// Returns true once the connection is encrypted.
    fn is_encrypted(&self) -> bool;

    /// Local socket address, used for the EHLO address literal.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Closes the connection. Best effort.
    fn shutdown(&mut self) -> impl Future<Output = Result<()>> + Send;
}
