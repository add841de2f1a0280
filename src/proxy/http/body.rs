use std::time::Duration;

use anyhow::{Result, bail};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;

use crate::util::timeout_with_context;

/// Size of each chunk handed from the upstream reader to the player/cache writer.
pub const BODY_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
#[error("body of {length} bytes exceeds the {limit} byte buffering limit")]
pub struct BodyTooLarge {
    pub length: u64,
    pub limit: usize,
}

/// Reads a whole `Content-Length` framed body into memory.
pub async fn read_fixed_body<S>(
    reader: &mut BufReader<S>,
    length: u64,
    limit: usize,
    read_timeout: Duration,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    if length > limit as u64 {
        return Err(BodyTooLarge { length, limit }.into());
    }
    let mut body = vec![0u8; length as usize];
    timeout_with_context(
        read_timeout,
        reader.read_exact(&mut body),
        "reading message body",
    )
    .await?;
    Ok(body)
}

/// Producer half of the body hand-off: reads exactly `length` bytes and pushes them into `tx`.
///
/// `tx` is bounded, so a slow consumer stalls this loop instead of growing a buffer. Returns the
/// number of bytes forwarded; fails if the upstream closes early or the consumer goes away.
pub async fn pump_fixed_body<S>(
    reader: &mut BufReader<S>,
    length: u64,
    read_timeout: Duration,
    tx: mpsc::Sender<Bytes>,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
{
    let mut remaining = length;
    while remaining > 0 {
        let to_read = remaining.min(BODY_CHUNK_SIZE as u64);
        let mut chunk = BytesMut::with_capacity(to_read as usize);
        let mut limited = (&mut *reader).take(to_read);
        let read = timeout_with_context(
            read_timeout,
            limited.read_buf(&mut chunk),
            "reading response body from upstream",
        )
        .await?;
        if read == 0 {
            bail!(
                "upstream closed after {} of {length} body bytes",
                length - remaining
            );
        }
        remaining -= read as u64;
        if tx.send(chunk.freeze()).await.is_err() {
            bail!("body consumer stopped before the body was complete");
        }
    }
    Ok(length)
}
