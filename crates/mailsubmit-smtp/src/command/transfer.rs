//! Message body transfer after `354`.
//!
//! The body is read from the caller's source in bounded chunks and written
//! as it arrives, so a message is never held in memory whole.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Size of one read from the message source.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Callback receiving the cumulative number of message bytes read.
pub type ProgressFn = Box<dyn FnMut(u64) + Send>;

/// Dot-stuffing and `LF` to `CRLF` conversion, one chunk at a time.
///
/// State carries over between chunks so a line start split across two
/// reads is still recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DotStuffer {
    last: u8,
}

impl Default for DotStuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DotStuffer {
    /// Creates a stuffer positioned at the start of a line.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: b'\n' }
    }

    /// Appends the wire form of `input` to `out`.
    pub fn stuff(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.reserve(input.len() + input.len() / 64 + 2);
        for &b in input {
            if b == b'\n' && self.last != b'\r' {
                out.push(b'\r');
            } else if b == b'.' && self.last == b'\n' {
                out.push(b'.');
            }
            out.push(b);
            self.last = b;
        }
    }

    /// End-of-data marker for what has been stuffed so far.
    #[must_use]
    pub const fn terminator(&self) -> &'static [u8] {
        if self.last == b'\n' {
            b".\r\n"
        } else {
            b"\r\n.\r\n"
        }
    }
}

/// Streaming body of a DATA command.
pub struct Transfer {
    source: Box<dyn AsyncRead + Send + Unpin>,
    stuffer: DotStuffer,
    buf: Vec<u8>,
    bytes_read: u64,
    progress: Option<ProgressFn>,
}

/// Next piece of wire bytes from a [`Transfer`].
#[derive(Debug, PartialEq, Eq)]
pub enum Chunk {
    /// Stuffed body bytes; more may follow.
    Body(Vec<u8>),
    /// The end-of-data marker; the transfer is complete.
    End(&'static [u8]),
}

impl Transfer {
    /// Creates a transfer reading from `source`.
    #[must_use]
    pub fn new(source: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            source,
            stuffer: DotStuffer::new(),
            buf: vec![0; CHUNK_SIZE],
            bytes_read: 0,
            progress: None,
        }
    }

    /// Sets the progress callback.
    #[must_use]
    pub fn with_progress(mut self, progress: Option<ProgressFn>) -> Self {
        self.progress = progress;
        self
    }

    /// Message bytes read from the source so far.
    #[must_use]
    pub const fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Reads the next chunk from the source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageSource`] if the source fails.
    pub async fn next_chunk(&mut self) -> Result<Chunk> {
        let n = self
            .source
            .read(&mut self.buf)
            .await
            .map_err(Error::MessageSource)?;
        if n == 0 {
            return Ok(Chunk::End(self.stuffer.terminator()));
        }

        self.bytes_read += n as u64;
        if let Some(progress) = self.progress.as_mut() {
            progress(self.bytes_read);
        }

        let mut out = Vec::with_capacity(n + 64);
        self.stuffer.stuff(&self.buf[..n], &mut out);
        Ok(Chunk::Body(out))
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("stuffer", &self.stuffer)
            .field("bytes_read", &self.bytes_read)
            .finish_non_exhaustive()
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
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn stuff_all(chunks: &[&[u8]]) -> Vec<u8> {
        let mut stuffer = DotStuffer::new();
        let mut out = Vec::new();
        for chunk in chunks {
            stuffer.stuff(chunk, &mut out);
        }
        out.extend_from_slice(stuffer.terminator());
        out
    }

    /// What a compliant server does on receipt.
    fn unstuff(wire: &[u8]) -> Vec<u8> {
        let body = wire.strip_suffix(b".\r\n").unwrap();
        let mut out = Vec::new();
        let mut at_line_start = true;
        for &b in body {
            if at_line_start && b == b'.' {
                at_line_start = false;
                continue;
            }
            out.push(b);
            at_line_start = b == b'\n';
        }
        out
    }

    fn crlf(body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut last = b'\n';
        for &b in body {
            if b == b'\n' && last != b'\r' {
                out.push(b'\r');
            }
            out.push(b);
            last = b;
        }
        out
    }

    #[test]
    fn test_lone_dot_line_is_doubled() {
        assert_eq!(stuff_all(&[b"a\r\n.\r\nb\r\n"]), b"a\r\n..\r\nb\r\n.\r\n");
    }

    #[test]
    fn test_leading_dot_at_body_start() {
        assert_eq!(stuff_all(&[b".hidden\r\n"]), b"..hidden\r\n.\r\n");
    }

    #[test]
    fn test_lf_becomes_crlf() {
        assert_eq!(stuff_all(&[b"one\ntwo\n"]), b"one\r\ntwo\r\n.\r\n");
    }

    #[test]
    fn test_terminator_without_final_newline() {
        assert_eq!(stuff_all(&[b"no newline"]), b"no newline\r\n.\r\n");
    }

    #[test]
    fn test_empty_body() {
        assert_eq!(stuff_all(&[]), b".\r\n");
    }

    #[test]
    fn test_dot_after_chunk_boundary() {
        assert_eq!(stuff_all(&[b"line\n", b".dot\n"]), b"line\r\n..dot\r\n.\r\n");
        assert_eq!(stuff_all(&[b"line\r", b"\n."]), b"line\r\n..\r\n.\r\n");
    }

    #[tokio::test]
    async fn test_transfer_chunks_and_progress() {
        let body = vec![b'x'; CHUNK_SIZE + 10];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut transfer = Transfer::new(Box::new(std::io::Cursor::new(body)))
            .with_progress(Some(Box::new(move |n| sink.lock().unwrap().push(n))));

        let Chunk::Body(first) = transfer.next_chunk().await.unwrap() else {
            panic!("expected body");
        };
        assert_eq!(first.len(), CHUNK_SIZE);
        let Chunk::Body(second) = transfer.next_chunk().await.unwrap() else {
            panic!("expected body");
        };
        assert_eq!(second.len(), 10);
        assert_eq!(
            transfer.next_chunk().await.unwrap(),
            Chunk::End(b"\r\n.\r\n")
        );
        assert_eq!(transfer.bytes_read(), (CHUNK_SIZE + 10) as u64);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![CHUNK_SIZE as u64, (CHUNK_SIZE + 10) as u64]
        );
    }

    #[tokio::test]
    async fn test_source_error_is_message_source() {
        let source = tokio_test::io::Builder::new()
            .read(b"Subject: hi\r\n")
            .read_error(std::io::Error::other("disk gone"))
            .build();
        let mut transfer = Transfer::new(Box::new(source));
        assert!(matches!(
            transfer.next_chunk().await.unwrap(),
            Chunk::Body(_)
        ));
        let err = transfer.next_chunk().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MessageSource);
        assert!(err.is_fatal());
    }

    proptest! {
        #[test]
        fn stuffing_is_reversible(
            body in prop::collection::vec(prop::sample::select(vec![b'a', b'.', b'\n', b'\r', b' ']), 0..300),
            cuts in prop::collection::vec(0usize..300, 0..8),
        ) {
            let mut cuts = cuts;
            cuts.retain(|&c| c <= body.len());
            cuts.sort_unstable();
            let mut chunks: Vec<&[u8]> = Vec::new();
            let mut start = 0;
            for cut in cuts {
                chunks.push(&body[start..cut]);
                start = cut;
            }
            chunks.push(&body[start..]);

            let wire = stuff_all(&chunks);
            let mut expected = crlf(&body);
            if !expected.is_empty() && !expected.ends_with(b"\r\n") {
                expected.extend_from_slice(b"\r\n");
            }
            prop_assert_eq!(unstuff(&wire), expected);

            // The terminator can only appear at the very end.
            let needle = b"\r\n.\r\n";
            let full = [b"\r\n".as_slice(), &wire].concat();
            let hits = full.windows(needle.len()).filter(|w| w == needle).count();
            prop_assert_eq!(hits, 1);
        }
    }
}
