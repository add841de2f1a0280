use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// How a request interacted with the cache index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Miss,
    Revalidated,
    Bypass,
}

impl CacheLookup {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLookup::Hit => "hit",
            CacheLookup::Miss => "miss",
            CacheLookup::Revalidated => "revalidated",
            CacheLookup::Bypass => "bypass",
        }
    }
}

/// What happened to the response body on its way past the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStore {
    Stored,
    Skipped,
    Failed,
}

impl CacheStore {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStore::Stored => "stored",
            CacheStore::Skipped => "skipped",
            CacheStore::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub peer: SocketAddr,
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub status: u16,
    pub cache_lookup: Option<CacheLookup>,
    pub cache_store: Option<CacheStore>,
    pub bytes_out: u64,
    pub elapsed_ms: u128,
    pub upstream_addr: Option<String>,
    pub error_reason: Option<String>,
    pub error_detail: Option<String>,
}

#[derive(Debug)]
pub struct AccessLogBuilder {
    event: AccessLogEvent,
}

impl AccessLogBuilder {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            event: AccessLogEvent {
                peer,
                method: String::new(),
                scheme: String::new(),
                host: String::new(),
                path: String::new(),
                status: 0,
                cache_lookup: None,
                cache_store: None,
                bytes_out: 0,
                elapsed_ms: 0,
                upstream_addr: None,
                error_reason: None,
                error_detail: None,
            },
        }
    }

    pub fn method(&mut self, method: impl Into<String>) -> &mut Self {
        self.event.method = method.into();
        self
    }

    pub fn origin(&mut self, origin: &url::Url) -> &mut Self {
        self.event.scheme = origin.scheme().to_string();
        self.event.host = origin.host_str().unwrap_or_default().to_string();
        self.event.path = origin.path().to_string();
        self
    }

    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn cache_lookup(&mut self, lookup: CacheLookup) -> &mut Self {
        self.event.cache_lookup = Some(lookup);
        self
    }

    pub fn cache_store(&mut self, store: CacheStore) -> &mut Self {
        self.event.cache_store = Some(store);
        self
    }

    pub fn add_bytes_out(&mut self, bytes: u64) -> &mut Self {
        self.event.bytes_out = self.event.bytes_out.saturating_add(bytes);
        self
    }

    pub fn upstream_addr(&mut self, addr: SocketAddr) -> &mut Self {
        self.event.upstream_addr = Some(addr.to_string());
        self
    }

    pub fn error(&mut self, reason: &'static str, detail: impl Into<String>) -> &mut Self {
        self.event.error_reason = Some(reason.to_string());
        self.event.error_detail = Some(detail.into());
        self
    }

    pub fn status_code(&self) -> u16 {
        self.event.status
    }

    pub fn build(self, elapsed: Duration) -> AccessLogEvent {
        let mut event = self.event;
        event.elapsed_ms = elapsed.as_millis();
        event
    }

    pub fn log(self, elapsed: Duration) {
        log_access(self.build(elapsed));
    }
}

pub fn log_access(event: AccessLogEvent) {
    let AccessLogEvent {
        peer,
        method,
        scheme,
        host,
        path,
        status,
        cache_lookup,
        cache_store,
        bytes_out,
        elapsed_ms,
        upstream_addr,
        error_reason,
        error_detail,
    } = event;

    tracing::info!(
        target: "access_log",
        peer = %peer,
        method,
        scheme,
        host,
        path,
        status,
        cache_lookup = cache_lookup.map(|lookup| lookup.as_str()),
        cache_store = cache_store.map(|store| store.as_str()),
        bytes_out,
        elapsed_ms,
        upstream_addr = upstream_addr.as_deref(),
        error_reason = error_reason.as_deref(),
        error_detail = error_detail.as_deref()
    );

    crate::metrics::record_request(status, Duration::from_millis(elapsed_ms as u64));
}
