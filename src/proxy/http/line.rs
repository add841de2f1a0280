use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;

use super::headers::Headers;
use crate::proxy::error::ProtocolError;
use crate::util::{TimedOut, timeout_with_context};

/// Reads one `\n`-terminated line into `buf`, waiting on the socket until the line is complete
/// or `deadline` passes.
///
/// Returns `Ok(0)` only when the peer closed before sending any byte of the line. A close in the
/// middle of a line is reported as [`ProtocolError::UnexpectedEof`].
pub(crate) async fn read_line_with_deadline<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    deadline: Instant,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    buf.clear();
    let mut collected = Vec::new();
    let context = format!("reading line from {peer}");

    loop {
        let remaining = remaining_deadline(deadline, &context)?;
        let available =
            timeout_with_context(remaining, reader.fill_buf(), context.as_str()).await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            return Err(ProtocolError::UnexpectedEof.into());
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow for {peer}"))?
            > max_len
        {
            return Err(ProtocolError::HeadTooLarge { limit: max_len }.into());
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string = String::from_utf8(collected).map_err(|_| ProtocolError::InvalidEncoding)?;
    let len = string.len();
    *buf = string;
    Ok(len)
}

/// Reads a start line plus header block, bounded to `max_head_bytes` in total.
///
/// `Ok(None)` means the peer closed cleanly before the start line began.
pub(crate) async fn read_head<S>(
    reader: &mut BufReader<S>,
    deadline: Instant,
    peer: SocketAddr,
    max_head_bytes: usize,
) -> Result<Option<(String, Headers)>>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let mut used = read_line_with_deadline(reader, &mut line, deadline, peer, max_head_bytes).await?;
    if used == 0 {
        return Ok(None);
    }
    let start_line = line.trim_end_matches(['\r', '\n']).to_string();

    let mut headers = Headers::new();
    loop {
        let budget = max_head_bytes.saturating_sub(used);
        if budget == 0 {
            return Err(ProtocolError::HeadTooLarge {
                limit: max_head_bytes,
            }
            .into());
        }
        let read = read_line_with_deadline(reader, &mut line, deadline, peer, budget).await?;
        if read == 0 {
            return Err(ProtocolError::UnexpectedEof.into());
        }
        used += read;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        headers.push_line(trimmed)?;
    }

    Ok(Some((start_line, headers)))
}

pub(crate) fn remaining_deadline(deadline: Instant, context: &str) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
        .ok_or_else(|| anyhow::Error::new(TimedOut(context.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[tokio::test]
    async fn waits_for_partial_line_to_complete() -> Result<()> {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = BufReader::new(server);
        let deadline = Instant::now() + Duration::from_secs(5);

        let writer = tokio::spawn(async move {
            client.write_all(b"GET / HT").await?;
            tokio::task::yield_now().await;
            client.write_all(b"TP/1.1\r\n").await?;
            Ok::<_, std::io::Error>(client)
        });

        let mut line = String::new();
        let len = read_line_with_deadline(&mut reader, &mut line, deadline, peer(), 1024).await?;
        assert_eq!(line, "GET / HTTP/1.1\r\n");
        assert_eq!(len, line.len());
        drop(writer.await??);
        Ok(())
    }

    #[tokio::test]
    async fn close_before_any_byte_returns_zero() -> Result<()> {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = BufReader::new(server);
        let mut line = String::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let len = read_line_with_deadline(&mut reader, &mut line, deadline, peer(), 1024).await?;
        assert_eq!(len, 0);
        assert!(line.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn close_mid_line_is_a_protocol_error() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"Host: exa").await.unwrap();
        drop(client);
        let mut reader = BufReader::new(server);
        let mut line = String::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = read_line_with_deadline(&mut reader, &mut line, deadline, peer(), 1024)
            .await
            .expect_err("partial line must not be returned");
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::UnexpectedEof)
        );
    }

    #[tokio::test]
    async fn rejects_lines_over_limit() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(&[b'a'; 100]).await.unwrap();
        client.write_all(b"\r\n").await.unwrap();
        let mut reader = BufReader::new(server);
        let mut line = String::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = read_line_with_deadline(&mut reader, &mut line, deadline, peer(), 16)
            .await
            .expect_err("oversized line should fail");
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::HeadTooLarge { limit: 16 })
        );
    }

    #[tokio::test]
    async fn reads_start_line_and_headers() -> Result<()> {
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nETag: \"abc\"\r\n\r\nbody")
            .await?;
        let mut reader = BufReader::new(server);
        let deadline = Instant::now() + Duration::from_secs(5);
        let (start, headers) = read_head(&mut reader, deadline, peer(), 1024)
            .await?
            .expect("head present");
        assert_eq!(start, "HTTP/1.1 200 OK");
        assert_eq!(headers.get("content-length"), Some("4"));
        assert_eq!(headers.get("etag"), Some("\"abc\""));
        Ok(())
    }

    #[tokio::test]
    async fn head_closed_before_blank_line_is_an_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET /x HTTP/1.1\r\nHost: a\r\n")
            .await
            .unwrap();
        drop(client);
        let mut reader = BufReader::new(server);
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = read_head(&mut reader, deadline, peer(), 1024)
            .await
            .expect_err("truncated head");
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::UnexpectedEof)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_times_out() {
        let (_client, server) = tokio::io::duplex(64);
        let mut reader = BufReader::new(server);
        let mut line = String::new();
        let deadline = Instant::now() + Duration::from_millis(100);
        let err = read_line_with_deadline(&mut reader, &mut line, deadline, peer(), 1024)
            .await
            .expect_err("idle peer should time out");
        assert!(err.downcast_ref::<TimedOut>().is_some(), "{err}");
    }
}
