//! TCP and TLS streams.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore},
};

use super::{FramedStream, Transport};
use crate::error::{Error, Result};

/// SMTP stream (TCP or TLS).
#[derive(Debug)]
pub enum SmtpStream {
    /// Plain TCP connection.
    Plain(FramedStream<TcpStream>),
    /// TLS-encrypted connection (boxed to reduce enum size).
    Tls(Box<FramedStream<TlsStream<TcpStream>>>),
    /// Closed, or lost during a failed TLS upgrade.
    Closed,
}

impl SmtpStream {
    fn closed_error() -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "stream is closed",
        ))
    }
}

impl Transport for SmtpStream {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(framed) => framed.write_all(data).await,
            Self::Tls(framed) => framed.write_all(data).await,
            Self::Closed => Err(Self::closed_error()),
        }
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        match self {
            Self::Plain(framed) => framed.read_line().await,
            Self::Tls(framed) => framed.read_line().await,
            Self::Closed => Err(Self::closed_error()),
        }
    }

    async fn start_tls(&mut self, server_name: &str) -> Result<()> {
        let framed = match std::mem::replace(self, Self::Closed) {
            Self::Plain(framed) => framed,
            other @ Self::Tls(_) => {
                *self = other;
                return Err(Error::TlsNegotiation("stream is already TLS".into()));
            }
            Self::Closed => return Err(Self::closed_error()),
        };

        // RFC 3207 section 4.2: anything the server sent before the
        // handshake must be discarded.
        if framed.has_buffered_data() {
            tracing::warn!("discarding plaintext received before TLS handshake");
        }
        let tcp = framed.into_inner();
        let tls = handshake(server_name, tcp).await?;
        *self = Self::Tls(Box::new(FramedStream::new(tls)));
        Ok(())
    }

    fn is_encrypted(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Plain(framed) => framed.get_ref().local_addr().ok(),
            Self::Tls(framed) => framed.get_ref().get_ref().0.local_addr().ok(),
            Self::Closed => None,
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        match std::mem::replace(self, Self::Closed) {
            Self::Plain(mut framed) => Transport::shutdown(&mut framed).await,
            Self::Tls(mut framed) => Transport::shutdown(framed.as_mut()).await,
            Self::Closed => Ok(()),
        }
    }
}

async fn handshake(hostname: &str, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
    let connector = create_tls_connector();
    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|_| Error::TlsNegotiation(format!("Invalid hostname: {hostname}")))?;

    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(handshake_error)?;
    Ok(tls)
}

/// Unwraps the `rustls` error tokio-rustls boxes inside `io::Error`.
fn handshake_error(err: io::Error) -> Error {
    let kind = err.kind();
    match err.into_inner() {
        Some(inner) => match inner.downcast::<rustls::Error>() {
            Ok(tls) => Error::Tls(*tls),
            Err(other) => Error::TlsNegotiation(other.to_string()),
        },
        None => Error::TlsNegotiation(io::Error::from(kind).to_string()),
    }
}

/// Connects to an SMTP server over plain TCP.
///
/// # Errors
///
/// Returns an error if the connection fails.
pub async fn connect(hostname: &str, port: u16) -> Result<SmtpStream> {
    let addr = format!("{hostname}:{port}");
    let stream = TcpStream::connect(&addr).await?;
    tracing::debug!(%addr, "connected");
    Ok(SmtpStream::Plain(FramedStream::new(stream)))
}

/// Connects to an SMTP server over TLS (implicit TLS on port 465).
///
/// # Errors
///
/// Returns an error if the connection or TLS handshake fails.
pub async fn connect_tls(hostname: &str, port: u16) -> Result<SmtpStream> {
    let addr = format!("{hostname}:{port}");
    let tcp = TcpStream::connect(&addr).await?;
    let tls = handshake(hostname, tcp).await?;
    tracing::debug!(%addr, "connected with implicit TLS");
    Ok(SmtpStream::Tls(Box::new(FramedStream::new(tls))))
}

/// Creates a TLS connector trusting the `webpki-roots` anchors.
#[must_use]
pub fn create_tls_connector() -> TlsConnector {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
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
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_closed_stream_refuses_io() {
        let mut stream = SmtpStream::Closed;
        assert!(!stream.is_encrypted());
        assert!(stream.local_addr().is_none());
        assert_eq!(
            stream.write_all(b"NOOP\r\n").await.unwrap_err().kind(),
            ErrorKind::ConnectionBroken
        );
        assert!(stream.read_line().await.is_err());
        assert!(stream.start_tls("mx.example.com").await.is_err());
        stream.shutdown().await.unwrap();
    }

    #[test]
    fn test_handshake_error_keeps_rustls_cause() {
        let wrapped = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::General("bad certificate".into()),
        );
        let err = handshake_error(wrapped);
        assert!(matches!(err, Error::Tls(rustls::Error::General(_))));
        assert_eq!(err.kind(), ErrorKind::TlsNegotiationFailed);
    }

    #[test]
    fn test_handshake_error_from_plain_io() {
        let err = handshake_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(err, Error::TlsNegotiation(ref msg) if msg == "reset"));
        assert_eq!(err.kind(), ErrorKind::TlsNegotiationFailed);

        let err = handshake_error(io::ErrorKind::UnexpectedEof.into());
        assert_eq!(err.kind(), ErrorKind::TlsNegotiationFailed);
    }

    #[tokio::test]
    async fn test_implicit_tls_against_plain_server_fails() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = sock.write_all(b"220 not speaking TLS here\r\n").await;
        });

        let err = connect_tls("127.0.0.1", port).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TlsNegotiationFailed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_stream_over_loopback() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"220 loopback ready\r\n").await.unwrap();
            let mut buf = [0u8; 6];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = connect("127.0.0.1", port).await.unwrap();
        assert!(stream.local_addr().is_some());
        assert_eq!(stream.read_line().await.unwrap(), b"220 loopback ready\r\n");
        stream.write_all(b"QUIT\r\n").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"QUIT\r\n");
        stream.shutdown().await.unwrap();
        assert!(matches!(stream, SmtpStream::Closed));
    }
}
