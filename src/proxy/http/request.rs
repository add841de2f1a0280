use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::{AsyncRead, BufReader};
use tokio::time::Instant;

use super::headers::Headers;
use super::line::read_head;
use crate::proxy::error::ProtocolError;

/// Parsed `METHOD path[?query] HTTP/x.y` request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    pub headers: Headers,
}

impl RequestHead {
    pub fn parse_request_line(line: &str) -> Result<(String, String, Option<String>, String), ProtocolError> {
        let malformed = || ProtocolError::MalformedRequestLine(line.to_string());
        let mut parts = line.split_whitespace();
        let method = parts.next().ok_or_else(malformed)?;
        let target = parts.next().ok_or_else(malformed)?;
        let version = parts.next().ok_or_else(malformed)?;
        if parts.next().is_some() || !version.starts_with("HTTP/") || !target.starts_with('/') {
            return Err(malformed());
        }
        if !method.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(malformed());
        }
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };
        Ok((method.to_string(), path, query, version.to_string()))
    }

    /// Path plus query, as it appears on the request line.
    pub fn target(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// Declared body length; chunked request bodies are rejected.
    pub fn body_length(&self) -> Result<u64, ProtocolError> {
        if self.headers.contains("transfer-encoding") {
            return Err(ProtocolError::ChunkedUnsupported);
        }
        match self.headers.get("content-length") {
            None => Ok(0),
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|_| ProtocolError::InvalidContentLength(value.to_string())),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(self.method.as_bytes());
        buffer.push(b' ');
        buffer.extend_from_slice(self.target().as_bytes());
        buffer.push(b' ');
        buffer.extend_from_slice(self.version.as_bytes());
        buffer.extend_from_slice(b"\r\n");
        self.headers.encode_into(&mut buffer);
        buffer.extend_from_slice(b"\r\n");
        buffer
    }
}

/// Reads one request head. `Ok(None)` when the client closed without sending anything.
pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    deadline: Instant,
    max_head_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let Some((line, headers)) = read_head(reader, deadline, peer, max_head_bytes).await? else {
        return Ok(None);
    };
    let (method, path, query, version) = RequestHead::parse_request_line(&line)?;
    Ok(Some(RequestHead {
        method,
        path,
        query,
        version,
        headers,
    }))
}
