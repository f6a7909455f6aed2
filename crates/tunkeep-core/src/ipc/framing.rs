//! Line framing for control-channel messages.
//!
//! Tolerant reader: blank lines are treated as noise and skipped, but only up
//! to [`EMPTY_LINE_THRESHOLD`] in a row so a misbehaving peer cannot keep the
//! reader spinning forever.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::Result;
use crate::policy::EMPTY_LINE_THRESHOLD;

/// Write one message as a single JSON line and flush it.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next message.
///
/// Returns `Ok(None)` at end of stream, or once [`EMPTY_LINE_THRESHOLD`]
/// consecutive blank lines have been read.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let mut empty_lines = 0;
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            empty_lines += 1;
            if empty_lines >= EMPTY_LINE_THRESHOLD {
                debug!(empty_lines, "Giving up after consecutive empty lines");
                return Ok(None);
            }
            continue;
        }
        return Ok(Some(serde_json::from_str(trimmed)?));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ipc::{Event, Request};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn four_empty_lines_then_message() {
        let input = b"\n\n  \n\n{\"command\":\"status\"}\n";
        let mut reader = &input[..];
        let msg: Option<Request> = read_message(&mut reader).await.unwrap();
        assert_eq!(msg, Some(Request::Status));
    }

    #[tokio::test]
    async fn six_empty_lines_yield_nothing() {
        let input = b"\n\n\n\n\n\n{\"command\":\"status\"}\n";
        let mut reader = &input[..];
        let msg: Option<Request> = read_message(&mut reader).await.unwrap();
        assert!(msg.is_none());
    }

    #[tokio::test]
    async fn end_of_stream_yields_nothing() {
        let mut reader = &b""[..];
        let msg: Option<Request> = read_message(&mut reader).await.unwrap();
        assert!(msg.is_none());
    }

    #[tokio::test]
    async fn malformed_line_is_a_json_error() {
        let mut reader = &b"{not json}\n"[..];
        let err = read_message::<_, Request>(&mut reader).await.unwrap_err();
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn written_frames_read_back_in_order() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut write_half) = tokio::io::split(client);
        let mut reader = BufReader::new(server);

        write_message(&mut write_half, &Event::Shutdown { reason: "stop".into() })
            .await
            .unwrap();
        write_message(&mut write_half, &Request::Metrics).await.unwrap();

        let first: Event = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.op(), "shutdown");
        let second: Request = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(second, Request::Metrics);
    }
}
