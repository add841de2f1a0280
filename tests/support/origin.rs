use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::head_end;

/// What the mock origin answers for one path.
#[derive(Debug, Clone)]
pub struct Route {
    status: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    raw: Option<Vec<u8>>,
    not_modified_etag: Option<String>,
}

impl Route {
    pub fn ok(headers: &[(&str, &str)], body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: "200 OK".to_string(),
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            body: body.into(),
            raw: None,
            not_modified_etag: None,
        }
    }

    /// A segment the proxy may cache.
    pub fn segment(etag: &str, cache_control: &str, body: impl Into<Vec<u8>>) -> Self {
        Self::ok(
            &[
                ("ETag", etag),
                ("Cache-Control", cache_control),
                ("Content-Type", "video/MP2T"),
            ],
            body,
        )
    }

    /// Bytes written verbatim, for framing the proxy must reject.
    pub fn raw(response: impl Into<Vec<u8>>) -> Self {
        Self {
            raw: Some(response.into()),
            ..Self::ok(&[], Vec::new())
        }
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }

    /// Answer `304 Not Modified` when the request carries `If-None-Match: <etag>`.
    pub fn revalidates(mut self, etag: &str) -> Self {
        self.not_modified_etag = Some(etag.to_string());
        self
    }

    fn render(&self, request: &ReceivedRequest) -> Vec<u8> {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        if let Some(etag) = &self.not_modified_etag
            && request.header("if-none-match") == Some(etag.as_str())
        {
            return format!("HTTP/1.1 304 Not Modified\r\nETag: {etag}\r\nConnection: close\r\n\r\n")
                .into_bytes();
        }
        let mut response = format!("HTTP/1.1 {}\r\n", self.status);
        for (name, value) in &self.headers {
            response.push_str(&format!("{name}: {value}\r\n"));
        }
        response.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n",
            self.body.len()
        ));
        let mut bytes = response.into_bytes();
        if request.method != "HEAD" {
            bytes.extend_from_slice(&self.body);
        }
        bytes
    }
}

#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ReceivedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }
}

/// Plain-HTTP origin that serves fixed routes and records every request it sees.
pub struct MockOrigin {
    addr: SocketAddr,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    handle: JoinHandle<()>,
}

impl MockOrigin {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let routes: Arc<Mutex<HashMap<String, Route>>> = Arc::default();
        let requests: Arc<Mutex<Vec<ReceivedRequest>>> = Arc::default();

        let handle = {
            let routes = routes.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(_) => break,
                    };
                    let routes = routes.clone();
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        let _ = handle_connection(stream, routes, requests).await;
                    });
                }
            })
        };

        Ok(Self {
            addr,
            routes,
            requests,
            handle,
        })
    }

    pub fn route(&self, path: &str, route: Route) {
        self.routes.lock().insert(path.to_string(), route);
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests.lock().clone()
    }

    pub fn hits(&self, path: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.path() == path)
            .count()
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
) -> Result<()> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let head_len = loop {
        if let Some(end) = head_end(&data) {
            break end;
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..head_len]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("request line without target"))?
        .to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = data[head_len..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }

    let request = ReceivedRequest {
        method,
        target,
        headers,
        body,
    };
    let route = routes.lock().get(request.path()).cloned();
    requests.lock().push(request.clone());

    let response = match route {
        Some(route) => route.render(&request),
        None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
    };
    stream.write_all(&response).await?;
    stream.shutdown().await.ok();
    Ok(())
}
