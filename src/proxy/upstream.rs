use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::{Instant, timeout};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;
use url::{Host, Url};

use crate::proxy::http::request::RequestHead;
use crate::proxy::http::response::{ResponseHead, read_response_head};
use crate::settings::Settings;
use crate::util::{TimedOut, timeout_with_context};

pub enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Attempt to connect to the supplied socket addresses in order.
pub async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        host = %addr.ip(),
                        port = addr.port(),
                        error = %err,
                        "failed to set TCP_NODELAY on upstream stream"
                    );
                }
                debug!(host = %addr.ip(), port = addr.port(), "connected to upstream");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err =
                    Some(anyhow::Error::new(err).context(format!("failed to connect to {addr}")));
            }
            Err(_) => {
                last_err = Some(anyhow::Error::new(TimedOut(format!("connecting to {addr}"))));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no addresses provided for upstream connect")))
}

/// One origin connection carrying exactly one request (`Connection: close`).
pub struct UpstreamConnection {
    reader: BufReader<UpstreamIo>,
    peer: SocketAddr,
}

impl UpstreamConnection {
    pub async fn connect(origin: &Url, settings: &Settings, tls: Arc<ClientConfig>) -> Result<Self> {
        let host = origin
            .host()
            .ok_or_else(|| anyhow!("origin {origin} has no host"))?;
        let port = origin
            .port_or_known_default()
            .ok_or_else(|| anyhow!("origin {origin} has no port"))?;
        let connect_timeout = settings.upstream_connect_timeout();

        let addresses: Vec<SocketAddr> = match &host {
            Host::Domain(domain) => timeout_with_context(
                connect_timeout,
                lookup_host((*domain, port)),
                format!("resolving {domain}"),
            )
            .await?
            .collect(),
            Host::Ipv4(ip) => vec![SocketAddr::from((*ip, port))],
            Host::Ipv6(ip) => vec![SocketAddr::from((*ip, port))],
        };
        if addresses.is_empty() {
            bail!("{host} did not resolve to any address");
        }

        let (tcp, peer) = connect_to_addrs(&addresses, connect_timeout).await?;
        let stream = match origin.scheme() {
            "https" => {
                let server_name = tls_server_name(&host)?;
                let connector = TlsConnector::from(tls);
                let tls_stream = timeout_with_context(
                    settings.tls_handshake_timeout(),
                    connector.connect(server_name, tcp),
                    format!("completing TLS handshake with {host}:{port}"),
                )
                .await?;
                UpstreamIo::Tls(Box::new(tls_stream))
            }
            "http" => UpstreamIo::Plain(tcp),
            other => bail!("unsupported origin scheme '{other}'"),
        };

        Ok(Self {
            reader: BufReader::new(stream),
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send_request(
        &mut self,
        request: &RequestHead,
        body: &[u8],
        write_timeout: Duration,
    ) -> Result<()> {
        let mut bytes = request.encode();
        bytes.extend_from_slice(body);
        let stream = self.reader.get_mut();
        timeout_with_context(
            write_timeout,
            stream.write_all(&bytes),
            "sending request to upstream",
        )
        .await?;
        timeout_with_context(write_timeout, stream.flush(), "flushing request to upstream").await
    }

    pub async fn read_response_head(&mut self, settings: &Settings) -> Result<ResponseHead> {
        let deadline = Instant::now() + settings.upstream_timeout();
        read_response_head(&mut self.reader, self.peer, deadline, settings.max_header_size)
            .await
            .context("reading upstream response head")
    }

    pub fn reader_mut(&mut self) -> &mut BufReader<UpstreamIo> {
        &mut self.reader
    }
}

fn tls_server_name(host: &Host<&str>) -> Result<ServerName<'static>> {
    let name = match host {
        Host::Domain(domain) => domain.to_string(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    };
    ServerName::try_from(name.as_str())
        .map(|name| name.to_owned())
        .map_err(|_| anyhow!("invalid upstream host for TLS '{name}'"))
}

/// `Host` header value for `origin`: host plus any non-default port.
pub fn host_header(origin: &Url) -> String {
    let host = origin.host_str().unwrap_or_default();
    match origin.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// The request sent upstream for a player request aimed at `origin`.
pub fn build_forward_request(
    request: &RequestHead,
    origin: &Url,
    if_none_match: Option<&str>,
) -> RequestHead {
    let mut headers = request.headers.clone();
    headers.set("Host", host_header(origin));
    headers.set("Connection", "close");
    headers.set("Accept-Encoding", "identity");
    headers.remove("proxy-connection");
    headers.remove("keep-alive");
    if let Some(etag) = if_none_match {
        headers.set("If-None-Match", etag);
    }
    RequestHead {
        method: request.method.clone(),
        path: origin.path().to_string(),
        query: origin.query().map(str::to_string),
        version: "HTTP/1.1".to_string(),
        headers,
    }
}
