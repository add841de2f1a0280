use std::{future::Future, time::Duration};

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tokio::time::timeout;

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow::Error::new(TimedOut(context.clone())))?
        .with_context(|| format!("failed while {context}"))
}

/// Deadline expiry raised by [`timeout_with_context`].
#[derive(Debug, thiserror::Error)]
#[error("timed out {0}")]
pub struct TimedOut(pub String);

/// Seconds since the Unix epoch, UTC.
pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Milliseconds since the Unix epoch, UTC.
pub fn now_unix_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
