use std::net::SocketAddr;
use std::time::Instant as StdInstant;

use anyhow::Result;
use bytes::Bytes;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use url::Url;

use super::AppContext;
use super::cache::{ReadHandle, WriteHandle};
use super::error::{FailureKind, classify_error};
use super::http::body::{BODY_CHUNK_SIZE, pump_fixed_body, read_fixed_body};
use super::http::playlist::{is_playlist_content_type, rewrite_playlist};
use super::http::request::{RequestHead, read_request_head};
use super::http::response::ResponseHead;
use super::loopback::decode_origin;
use super::upstream::{UpstreamConnection, build_forward_request};
use crate::logging::{AccessLogBuilder, CacheLookup, CacheStore};
use crate::util::{now_unix, timeout_with_context};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingRequest,
    Parsed,
    Forwarding,
    StreamingResponse,
    Closed,
    Error,
}

/// Serves one player connection: a single request, then close.
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    serve_client(read_half, write_half, peer, app).await
}

pub async fn serve_client<R, W>(reader: R, writer: W, peer: SocketAddr, app: AppContext) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let started = StdInstant::now();
    crate::metrics::inc_connections();

    let mut reader = BufReader::new(reader);
    let mut connection = ClientConnection {
        app,
        writer,
        state: ConnectionState::AwaitingRequest,
        log: AccessLogBuilder::new(peer),
        peer,
        request_seen: false,
    };

    let result = connection.serve(&mut reader).await;
    if let Err(err) = &result {
        connection.fail(err).await;
    } else {
        connection.transition(ConnectionState::Closed);
    }
    connection.shutdown().await;

    let ClientConnection {
        log, request_seen, ..
    } = connection;
    if request_seen || result.is_err() {
        log.log(started.elapsed());
    }
    crate::metrics::dec_connections();
    result
}

struct ClientConnection<W> {
    app: AppContext,
    writer: W,
    state: ConnectionState,
    log: AccessLogBuilder,
    peer: SocketAddr,
    request_seen: bool,
}

impl<W> ClientConnection<W>
where
    W: AsyncWrite + Unpin,
{
    fn transition(&mut self, next: ConnectionState) {
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "connection state");
        self.state = next;
    }

    fn note_lookup(&mut self, lookup: CacheLookup) {
        crate::metrics::record_cache_lookup(lookup.as_str());
        self.log.cache_lookup(lookup);
    }

    async fn serve<R>(&mut self, reader: &mut BufReader<R>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let settings = self.app.settings.clone();
        let deadline = Instant::now() + settings.client_timeout();
        let Some(request) =
            read_request_head(reader, self.peer, deadline, settings.max_header_size).await?
        else {
            debug!(peer = %self.peer, "player closed connection before sending a request");
            return Ok(());
        };
        self.request_seen = true;
        self.transition(ConnectionState::Parsed);
        self.log.method(request.method.clone());

        let origin = decode_origin(&request.target())?;
        self.log.origin(&origin);
        let body_length = request.body_length()?;
        let request_body = if body_length > 0 {
            read_fixed_body(
                reader,
                body_length,
                settings.max_playlist_size,
                settings.client_timeout(),
            )
            .await?
        } else {
            Vec::new()
        };

        let cache_eligible = request.method == "GET" && !request.headers.contains("range");
        if !cache_eligible {
            self.note_lookup(CacheLookup::Bypass);
            return self
                .forward_and_relay(&request, &request_body, &origin, false)
                .await;
        }

        let Some(mut cached) = self.app.cache.try_read(&origin).await else {
            self.note_lookup(CacheLookup::Miss);
            return self
                .forward_and_relay(&request, &request_body, &origin, true)
                .await;
        };

        if !self
            .app
            .cache
            .revalidate_required(now_unix(), cached.record())
        {
            self.note_lookup(CacheLookup::Hit);
            return self.serve_from_cache(cached).await;
        }

        let etag = cached.record().etag.clone();
        debug!(peer = %self.peer, url = %origin, "revalidating stale cache entry");
        let mut upstream = self
            .open_upstream(&request, &request_body, &origin, Some(&etag))
            .await?;
        let response = upstream.read_response_head(&settings).await?;
        if response.status == StatusCode::NOT_MODIFIED {
            self.app.cache.freshen(&mut cached, &response.headers).await;
            self.note_lookup(CacheLookup::Revalidated);
            return self.serve_from_cache(cached).await;
        }
        drop(cached);
        self.note_lookup(CacheLookup::Miss);
        self.relay_response(upstream, response, &request, &origin, true)
            .await
    }

    async fn open_upstream(
        &mut self,
        request: &RequestHead,
        body: &[u8],
        origin: &Url,
        if_none_match: Option<&str>,
    ) -> Result<UpstreamConnection> {
        self.transition(ConnectionState::Forwarding);
        let settings = &self.app.settings;
        let mut upstream =
            UpstreamConnection::connect(origin, settings, self.app.tls.clone()).await?;
        self.log.upstream_addr(upstream.peer());
        let forwarded = build_forward_request(request, origin, if_none_match);
        upstream
            .send_request(&forwarded, body, settings.upstream_timeout())
            .await?;
        Ok(upstream)
    }

    async fn forward_and_relay(
        &mut self,
        request: &RequestHead,
        body: &[u8],
        origin: &Url,
        cache_eligible: bool,
    ) -> Result<()> {
        let mut upstream = self.open_upstream(request, body, origin, None).await?;
        let response = upstream.read_response_head(&self.app.settings).await?;
        self.relay_response(upstream, response, request, origin, cache_eligible)
            .await
    }

    async fn relay_response(
        &mut self,
        mut upstream: UpstreamConnection,
        mut response: ResponseHead,
        request: &RequestHead,
        origin: &Url,
        cache_eligible: bool,
    ) -> Result<()> {
        let settings = self.app.settings.clone();
        prepare_client_headers(&mut response);

        if !response.has_body(&request.method) {
            self.log.cache_store(CacheStore::Skipped);
            return self.write_head(&response).await;
        }
        let length = response.content_length()?;

        if response.content_type().is_some_and(is_playlist_content_type) {
            let body = read_fixed_body(
                upstream.reader_mut(),
                length,
                settings.max_playlist_size,
                settings.upstream_timeout(),
            )
            .await?;
            let body = match String::from_utf8(body) {
                Ok(text) => rewrite_playlist(&text, origin, &self.app.endpoint).into_bytes(),
                Err(err) => {
                    warn!(url = %origin, "playlist is not UTF-8; forwarding unchanged");
                    err.into_bytes()
                }
            };
            response
                .headers
                .set("Content-Length", body.len().to_string());
            self.log.cache_store(CacheStore::Skipped);
            self.write_head(&response).await?;
            return self.write_to_client(&body).await;
        }

        let sink = if cache_eligible && response.status == StatusCode::OK {
            self.app.cache.start_writing(origin, &response.headers).await
        } else {
            WriteHandle::pass_through()
        };
        self.write_head(&response).await?;
        self.stream_body(&mut upstream, length, sink).await
    }

    /// Streams a `Content-Length` body to the player while copying it into `sink`.
    ///
    /// A reader task half fills a bounded queue; this half drains it. A failed cache write only
    /// stops caching, a failed player write or a short upstream body fails the request and
    /// discards the partial download.
    async fn stream_body(
        &mut self,
        upstream: &mut UpstreamConnection,
        length: u64,
        sink: WriteHandle,
    ) -> Result<()> {
        let settings = self.app.settings.clone();
        let (tx, rx) = mpsc::channel::<Bytes>(settings.chunk_queue_depth);
        let producer = pump_fixed_body(upstream.reader_mut(), length, settings.upstream_timeout(), tx);

        let client_timeout = settings.client_timeout();
        let writer = &mut self.writer;
        let mut sink = Some(sink);
        let mut cache_failed = false;
        let mut sent = 0u64;
        let consumer = async {
            let mut rx = rx;
            while let Some(chunk) = rx.recv().await {
                timeout_with_context(
                    client_timeout,
                    writer.write_all(&chunk),
                    "writing response body to player",
                )
                .await?;
                sent += chunk.len() as u64;

                if let Some(handle) = sink.as_mut()
                    && let Err(err) = handle.write_all(&chunk).await
                {
                    warn!(error = %err, "cache write failed; continuing without caching");
                    crate::metrics::record_cache_store_error();
                    sink = None;
                    cache_failed = true;
                }
            }
            Ok::<_, anyhow::Error>(())
        };

        // A failed player write drops the reader half instead of waiting on the origin.
        let streamed = tokio::try_join!(producer, consumer);
        self.log.add_bytes_out(sent);
        streamed?;

        let store = match sink {
            Some(handle) if handle.is_caching() => match handle.finished_writing().await {
                Ok(_) => CacheStore::Stored,
                Err(err) => {
                    warn!(error = ?err, "failed to commit cached segment");
                    crate::metrics::record_cache_store_error();
                    CacheStore::Failed
                }
            },
            Some(_) => CacheStore::Skipped,
            None if cache_failed => CacheStore::Failed,
            None => CacheStore::Skipped,
        };
        self.log.cache_store(store);
        Ok(())
    }

    async fn serve_from_cache(&mut self, mut cached: ReadHandle) -> Result<()> {
        let record = cached.record().clone();
        let mut response = ResponseHead::new(StatusCode::OK);
        response
            .headers
            .set("Content-Length", record.size_on_disk.to_string());
        response
            .headers
            .set("Content-Type", content_type_for_url(&record.remote_url));
        response.headers.set("ETag", record.etag.clone());
        if !record.cache_control.is_empty() {
            response
                .headers
                .set("Cache-Control", record.cache_control.clone());
        }
        response.headers.set("Connection", "close");
        self.log.cache_store(CacheStore::Skipped);
        self.write_head(&response).await?;

        let mut buffer = vec![0u8; BODY_CHUNK_SIZE];
        let mut remaining = record.size_on_disk;
        while remaining > 0 {
            let read = cached.read(&mut buffer).await?;
            if read == 0 {
                anyhow::bail!(
                    "cached file {} ended {remaining} bytes early",
                    record.relative_path
                );
            }
            let read = read.min(usize::try_from(remaining).unwrap_or(usize::MAX));
            self.write_to_client(&buffer[..read]).await?;
            remaining -= read as u64;
        }
        Ok(())
    }

    async fn write_head(&mut self, response: &ResponseHead) -> Result<()> {
        self.transition(ConnectionState::StreamingResponse);
        self.log.status(response.status);
        self.write_to_client(&response.encode()).await
    }

    async fn write_to_client(&mut self, bytes: &[u8]) -> Result<()> {
        timeout_with_context(
            self.app.settings.client_timeout(),
            self.writer.write_all(bytes),
            "writing response to player",
        )
        .await?;
        self.log.add_bytes_out(bytes.len() as u64);
        Ok(())
    }

    /// Records the failure and, if nothing has been sent yet, answers with an error status.
    async fn fail(&mut self, err: &anyhow::Error) {
        let kind = classify_error(err);
        let status = match (self.state, kind) {
            (ConnectionState::AwaitingRequest | ConnectionState::Parsed, FailureKind::Protocol) => {
                Some(StatusCode::BAD_REQUEST)
            }
            (ConnectionState::AwaitingRequest | ConnectionState::Parsed, FailureKind::Timeout) => {
                Some(StatusCode::REQUEST_TIMEOUT)
            }
            (ConnectionState::Forwarding, FailureKind::Timeout) => Some(StatusCode::GATEWAY_TIMEOUT),
            (ConnectionState::Forwarding, _) => Some(StatusCode::BAD_GATEWAY),
            _ => None,
        };
        if self.state == ConnectionState::Forwarding {
            crate::metrics::record_upstream_error(kind.as_str());
        }
        debug!(peer = %self.peer, state = ?self.state, error = ?err, "connection failed");
        self.log.error(kind.as_str(), format!("{err:#}"));
        self.transition(ConnectionState::Error);

        if let Some(status) = status {
            let mut response = ResponseHead::new(status);
            response.headers.set("Content-Length", "0");
            response.headers.set("Connection", "close");
            self.log.status(status);
            if let Err(write_err) = self.write_to_client(&response.encode()).await {
                debug!(peer = %self.peer, error = %write_err, "failed to send error response");
            }
        }
    }

    async fn shutdown(&mut self) {
        let timeout = self.app.settings.client_timeout();
        if let Err(err) =
            timeout_with_context(timeout, self.writer.shutdown(), "shutting down player stream")
                .await
        {
            trace!(peer = %self.peer, error = %err, "player stream shutdown failed");
        }
    }
}

fn prepare_client_headers(response: &mut ResponseHead) {
    response.headers.set("Connection", "close");
    response.headers.remove("keep-alive");
}

/// `Content-Type` for a cache hit, derived from the segment extension.
fn content_type_for_url(remote_url: &str) -> &'static str {
    let path = Url::parse(remote_url)
        .map(|url| url.path().to_ascii_lowercase())
        .unwrap_or_default();
    if path.ends_with(".ts") {
        "video/MP2T"
    } else if path.ends_with(".m4s") || path.ends_with(".mp4") {
        "video/mp4"
    } else {
        "application/octet-stream"
    }
}
