//! Line framing over an async byte stream.
//!
//! SMTP replies are CRLF-terminated lines. Reads may split a line at any
//! byte, or deliver several lines at once; [`FramedStream`] reassembles
//! them from its buffer.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::Transport;
use crate::error::{Error, Result};

/// Default buffer size for reading.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Maximum reply line length, terminator included.
///
/// RFC 5321 allows 512 octets; servers in the wild send longer ones.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Framed connection for SMTP.
pub struct FramedStream<S> {
    reader: BufReader<S>,
    line: BytesMut,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new framed stream.
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, stream),
            line: BytesMut::with_capacity(512),
        }
    }

    /// Reads a single line terminated by `LF` (normally `CRLF`).
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, end of stream, or a line longer
    /// than [`MAX_LINE_LENGTH`].
    pub async fn read_line(&mut self) -> Result<Vec<u8>> {
        self.line.clear();

        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )));
            }

            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                self.line.extend_from_slice(&buf[..=pos]);
                self.reader.consume(pos + 1);
                break;
            }

            let len = buf.len();
            self.line.extend_from_slice(buf);
            self.reader.consume(len);

            if self.line.len() > MAX_LINE_LENGTH {
                return Err(Error::Protocol("line too long".to_string()));
            }
        }

        if self.line.len() > MAX_LINE_LENGTH {
            return Err(Error::Protocol("line too long".to_string()));
        }
        Ok(self.line.to_vec())
    }

    /// Writes data to the stream and flushes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Returns true if bytes are buffered but not yet consumed.
    pub fn has_buffered_data(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    /// Gets a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        self.reader.get_ref()
    }

    /// Consumes the framed stream and returns the inner stream.
    ///
    /// Any buffered data is lost.
    pub fn into_inner(self) -> S {
        self.reader.into_inner()
    }
}

impl<S: AsyncRead> std::fmt::Debug for FramedStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedStream")
            .field("buffered", &self.reader.buffer().len())
            .finish_non_exhaustive()
    }
}

/// Plaintext transport over any byte stream. STARTTLS is refused.
impl<S> Transport for FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        Self::write_all(self, data).await
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        Self::read_line(self).await
    }

    async fn start_tls(&mut self, _server_name: &str) -> Result<()> {
        Err(Error::TlsNegotiation(
            "transport cannot be upgraded to TLS".to_string(),
        ))
    }

    fn is_encrypted(&self) -> bool {
        false
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.reader.get_mut().shutdown().await?;
        Ok(())
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
    use crate::error::ErrorKind;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_simple_line() {
        let mock = Builder::new().read(b"220 ready\r\n").build();
        let mut framed = FramedStream::new(mock);
        assert_eq!(framed.read_line().await.unwrap(), b"220 ready\r\n");
    }

    #[tokio::test]
    async fn test_read_line_split_across_reads() {
        let mock = Builder::new()
            .read(b"25")
            .read(b"0-mx.exa")
            .read(b"mple.com\r")
            .read(b"\n250 PIPE")
            .read(b"LINING\r\n")
            .build();
        let mut framed = FramedStream::new(mock);
        assert_eq!(framed.read_line().await.unwrap(), b"250-mx.example.com\r\n");
        assert_eq!(framed.read_line().await.unwrap(), b"250 PIPELINING\r\n");
    }

    #[tokio::test]
    async fn test_several_lines_in_one_read() {
        let mock = Builder::new().read(b"250 ok\r\n354 go\r\n").build();
        let mut framed = FramedStream::new(mock);
        assert_eq!(framed.read_line().await.unwrap(), b"250 ok\r\n");
        assert!(framed.has_buffered_data());
        assert_eq!(framed.read_line().await.unwrap(), b"354 go\r\n");
    }

    #[tokio::test]
    async fn test_bare_lf_terminator() {
        let mock = Builder::new().read(b"220 unix\n").build();
        let mut framed = FramedStream::new(mock);
        assert_eq!(framed.read_line().await.unwrap(), b"220 unix\n");
    }

    #[tokio::test]
    async fn test_eof_is_connection_broken() {
        let mock = Builder::new().read(b"220 partial").build();
        let mut framed = FramedStream::new(mock);
        let err = framed.read_line().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionBroken);
    }

    #[tokio::test]
    async fn test_line_length_limit() {
        let long_line = "A".repeat(MAX_LINE_LENGTH + 100);
        let mock = Builder::new().read(long_line.as_bytes()).build();
        let mut framed = FramedStream::new(mock);

        let err = framed.read_line().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolDesync);
        assert!(err.to_string().contains("line too long"));
    }

    #[tokio::test]
    async fn test_write_all() {
        let mock = Builder::new().write(b"EHLO client\r\n").build();
        let mut framed = FramedStream::new(mock);
        framed.write_all(b"EHLO client\r\n").await.unwrap();
    }

    #[tokio::test]
    async fn test_debug_reports_buffered_bytes() {
        let mock = Builder::new().read(b"250 ok\r\n354 go\r\n").build();
        let mut framed = FramedStream::new(mock);
        framed.read_line().await.unwrap();
        let debug = format!("{framed:?}");
        assert!(debug.starts_with("FramedStream"));
        assert!(debug.contains("buffered: 8"));
        assert_eq!(framed.read_line().await.unwrap(), b"354 go\r\n");
    }

    #[tokio::test]
    async fn test_plain_transport_refuses_starttls() {
        let mock = Builder::new().build();
        let mut framed = FramedStream::new(mock);
        let err = Transport::start_tls(&mut framed, "mx.example.com")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TlsNegotiationFailed);
        assert!(!Transport::is_encrypted(&framed));
    }
}
