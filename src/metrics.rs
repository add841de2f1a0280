use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

use crate::proxy::http::request::read_request_head;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_total", "Player requests by status class");
    let vec = IntCounterVec::new(opts, &["status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_total");
    vec
});

static REQUEST_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("request_duration_seconds", "Player request latency")
        .buckets(latency_buckets());
    let vec = HistogramVec::new(opts, &["status_class"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register request_duration_seconds");
    vec
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_total", "Segments committed to the cache")
        .expect("create cache_store_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_total");
    counter
});

static CACHE_STORE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_errors_total", "Failed cache commits")
        .expect("create cache_store_errors_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_errors_total");
    counter
});

static CACHE_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("cache_evictions_total", "Cache entries evicted").expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_evictions_total");
    counter
});

static CACHE_EVICTED_BYTES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_evicted_bytes_total", "Bytes reclaimed by eviction")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_evicted_bytes_total");
    counter
});

static CACHE_INDEX_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_index_errors_total", "Failed cache index operations")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_index_errors_total");
    counter
});

static CACHE_DEGRADED: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "cache_degraded",
        "1 while the cache is disabled after index failures",
    )
    .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_degraded");
    gauge
});

static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge =
        IntGauge::new("active_sessions", "Player sessions holding the proxy").expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register active_sessions");
    gauge
});

static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("active_connections", "Open player connections")
        .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register active_connections");
    gauge
});

static UPSTREAM_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("upstream_errors_total", "Upstream errors by kind"),
        &["kind"],
    )
    .expect("create upstream_errors_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register upstream_errors_total");
    vec
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}

const METRICS_MAX_HEAD_BYTES: usize = 8192;
const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub fn record_request(status: u16, elapsed: Duration) {
    let class = status_class(status);
    REQUESTS_TOTAL.with_label_values(&[class]).inc();
    REQUEST_LATENCY_SECONDS
        .with_label_values(&[class])
        .observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_store() {
    CACHE_STORE_TOTAL.inc();
}

pub fn record_cache_store_error() {
    CACHE_STORE_ERRORS_TOTAL.inc();
}

pub fn record_cache_eviction(entries: u64, bytes: u64) {
    if entries > 0 {
        CACHE_EVICTIONS_TOTAL.inc_by(entries);
    }
    if bytes > 0 {
        CACHE_EVICTED_BYTES_TOTAL.inc_by(bytes);
    }
}

pub fn record_index_error() {
    CACHE_INDEX_ERRORS_TOTAL.inc();
}

pub fn set_cache_degraded(degraded: bool) {
    CACHE_DEGRADED.set(i64::from(degraded));
}

pub fn set_active_sessions(count: usize) {
    ACTIVE_SESSIONS.set(count as i64);
}

pub fn inc_connections() {
    ACTIVE_CONNECTIONS.inc();
}

pub fn dec_connections() {
    ACTIVE_CONNECTIONS.dec();
}

pub fn record_upstream_error(kind: &str) {
    UPSTREAM_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    buffer
}

pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(err) = handle_stream(stream, peer).await {
                tracing::debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_stream(stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let deadline = Instant::now() + METRICS_READ_TIMEOUT;
    let Some(head) = read_request_head(&mut reader, peer, deadline, METRICS_MAX_HEAD_BYTES).await?
    else {
        return Ok(());
    };

    let response = if head.method == "GET" && head.path == "/metrics" {
        build_response("200 OK", TextEncoder::new().format_type(), gather())
    } else {
        build_response("404 Not Found", "text/plain", b"not found".to_vec())
    };

    let stream = reader.get_mut();
    stream.write_all(&response).await?;
    stream.shutdown().await?;
    Ok(())
}

fn build_response(status: &str, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);
    response
}
