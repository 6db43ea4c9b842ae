//! Reply reader.
//!
//! Pulls lines from a [`Transport`] into a [`Reply`] until the reply is
//! complete. A reply that stops being well formed ends the read at once:
//! after a desync there is no way to find the next reply boundary.

use std::time::Duration;

use crate::connection::Transport;
use crate::error::{Error, Result};
use crate::types::Reply;

/// Reads one complete reply.
///
/// Each line read is bounded by `timeout`.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if a line does not arrive in time, a
/// transport error, or [`Error::Protocol`] if the reply is malformed.
pub async fn read_reply<T: Transport>(transport: &mut T, timeout: Duration) -> Result<Reply> {
    let mut reply = Reply::new();

    while !reply.is_complete() {
        let line = tokio::time::timeout(timeout, transport.read_line())
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        tracing::trace!(line = %String::from_utf8_lossy(&line).trim_end(), "S:");

        reply.parse_line(&line);
        if !reply.is_well_formed() {
            return Err(Error::Protocol(reply.error_message()));
        }
    }

    Ok(reply)
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
    use crate::error::ErrorKind;
    use crate::types::ReplyCode;
    use proptest::prelude::*;
    use tokio_test::io::Builder;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_read_single_line_reply() {
        let mock = Builder::new().read(b"220 mx.example.com ESMTP\r\n").build();
        let mut framed = FramedStream::new(mock);
        let reply = read_reply(&mut framed, TIMEOUT).await.unwrap();
        assert_eq!(reply.code(), Some(ReplyCode::SERVICE_READY));
        assert_eq!(reply.message_text(), "mx.example.com ESMTP");
    }

    #[tokio::test]
    async fn test_read_multi_line_reply_fragmented() {
        let mock = Builder::new()
            .read(b"250-foo\r")
            .read(b"\n25")
            .read(b"0 bar\r\n")
            .build();
        let mut framed = FramedStream::new(mock);
        let reply = read_reply(&mut framed, TIMEOUT).await.unwrap();
        assert!(reply.is_complete());
        assert_eq!(reply.lines().len(), 2);
        assert_eq!(reply.code(), Some(ReplyCode::OK));
    }

    #[tokio::test]
    async fn test_consecutive_replies_in_one_read() {
        let mock = Builder::new().read(b"250 ok\r\n550 no\r\n").build();
        let mut framed = FramedStream::new(mock);
        let first = read_reply(&mut framed, TIMEOUT).await.unwrap();
        let second = read_reply(&mut framed, TIMEOUT).await.unwrap();
        assert!(first.is_success());
        assert_eq!(second.code(), Some(ReplyCode::MAILBOX_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_mismatched_code_is_desync() {
        let mock = Builder::new().read(b"250-foo\r\n251 bar\r\n").build();
        let mut framed = FramedStream::new(mock);
        let err = read_reply(&mut framed, TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolDesync);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_fatal() {
        let mock = Builder::new()
            .read(b"250-partial\r\n")
            .wait(Duration::from_secs(120))
            .build();
        let mut framed = FramedStream::new(mock);
        let err = read_reply(&mut framed, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_fatal());
    }

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }

    proptest! {
        #[test]
        fn fragmentation_does_not_change_reply(
            texts in prop::collection::vec("[a-zA-Z0-9 .-]{0,40}", 1..6),
            cuts in prop::collection::vec(1usize..16, 0..32),
        ) {
            let last = texts.len() - 1;
            let mut wire = Vec::new();
            for (i, text) in texts.iter().enumerate() {
                let sep = if i == last { ' ' } else { '-' };
                wire.extend_from_slice(format!("250{sep}{text}\r\n").as_bytes());
            }

            let mut builder = Builder::new();
            let mut rest = wire.as_slice();
            for cut in &cuts {
                if rest.is_empty() {
                    break;
                }
                let (head, tail) = rest.split_at((*cut).min(rest.len()));
                builder.read(head);
                rest = tail;
            }
            if !rest.is_empty() {
                builder.read(rest);
            }

            let mut framed = FramedStream::new(builder.build());
            let reply = block_on(read_reply(&mut framed, TIMEOUT)).unwrap();
            prop_assert!(reply.is_complete());
            prop_assert_eq!(reply.lines().len(), texts.len());
            for (line, text) in reply.lines().iter().zip(&texts) {
                prop_assert_eq!(&line.text, text);
            }
        }
    }
}
