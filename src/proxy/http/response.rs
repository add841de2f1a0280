use std::net::SocketAddr;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncRead, BufReader};
use tokio::time::Instant;

use super::headers::Headers;
use super::line::read_head;
use crate::proxy::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status,
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers: Headers::new(),
        }
    }

    pub fn parse_status_line(line: &str) -> Result<(String, StatusCode, String), ProtocolError> {
        let malformed = || ProtocolError::MalformedStatusLine(line.to_string());
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().filter(|v| v.starts_with("HTTP/")).ok_or_else(malformed)?;
        let code = parts.next().ok_or_else(malformed)?;
        if code.len() != 3 {
            return Err(malformed());
        }
        let status = StatusCode::from_bytes(code.as_bytes()).map_err(|_| malformed())?;
        let reason = parts.next().unwrap_or_default().trim().to_string();
        Ok((version.to_string(), status, reason))
    }

    /// Body length from `Content-Length`; an absent header means an empty body.
    pub fn content_length(&self) -> Result<u64, ProtocolError> {
        match self.headers.get("content-length") {
            None => Ok(0),
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|_| ProtocolError::InvalidContentLength(value.to_string())),
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("transfer-encoding")
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    }

    /// Whether a body follows the head at all, per status code and request method.
    pub fn has_body(&self, request_method: &str) -> bool {
        !(request_method.eq_ignore_ascii_case("HEAD")
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(self.version.as_bytes());
        buffer.push(b' ');
        buffer.extend_from_slice(self.status.as_str().as_bytes());
        if !self.reason.is_empty() {
            buffer.push(b' ');
            buffer.extend_from_slice(self.reason.as_bytes());
        }
        buffer.extend_from_slice(b"\r\n");
        self.headers.encode_into(&mut buffer);
        buffer.extend_from_slice(b"\r\n");
        buffer
    }
}

pub async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    deadline: Instant,
    max_head_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let (line, headers) = read_head(reader, deadline, peer, max_head_bytes)
        .await?
        .ok_or(ProtocolError::UnexpectedEof)?;
    let (version, status, reason) = ResponseHead::parse_status_line(&line)?;
    let head = ResponseHead {
        version,
        status,
        reason,
        headers,
    };
    if head.is_chunked() {
        return Err(ProtocolError::ChunkedUnsupported.into());
    }
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn peer() -> SocketAddr {
        "203.0.113.7:443".parse().unwrap()
    }

    const SAMPLE_RESPONSE: &str = "HTTP/1.1 200 OK\r\n\
        Content-Type: application/vnd.apple.mpegurl\r\n\
        Content-Length: 1097\r\n\
        Connection: keep-alive\r\n\
        Date: Thu, 01 Feb 2024 12:00:00 GMT\r\n\
        Server: Apache\r\n\
        Cache-Control: max-age=2\r\n\
        Access-Control-Allow-Origin: *\r\n\
        Access-Control-Allow-Methods: GET\r\n\
        Access-Control-Expose-Headers: Date\r\n\
        ETag: \"1097-5f0a\"\r\n\
        X-Cache: Miss from cloudfront\r\n\
        Via: 1.1 edge.example.net\r\n\
        \r\n";

    #[tokio::test]
    async fn parses_sample_response_head() -> Result<()> {
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(SAMPLE_RESPONSE.as_bytes()).await?;
        let mut reader = BufReader::new(server);
        let deadline = Instant::now() + Duration::from_secs(5);
        let head = read_response_head(&mut reader, peer(), deadline, 8192).await?;
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.headers.len(), 12);
        assert_eq!(head.content_length()?, 1097);
        assert_eq!(head.content_type(), Some("application/vnd.apple.mpegurl"));
        assert_eq!(head.headers.get("etag"), Some("\"1097-5f0a\""));
        Ok(())
    }

    #[tokio::test]
    async fn rejects_chunked_responses() {
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n")
            .await
            .unwrap();
        let mut reader = BufReader::new(server);
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = read_response_head(&mut reader, peer(), deadline, 1024)
            .await
            .expect_err("chunked is unsupported");
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::ChunkedUnsupported)
        );
    }

    #[tokio::test]
    async fn empty_upstream_reply_is_an_error() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = BufReader::new(server);
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = read_response_head(&mut reader, peer(), deadline, 1024)
            .await
            .expect_err("no status line");
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::UnexpectedEof)
        );
    }

    #[test]
    fn status_line_variants() {
        let (version, status, reason) =
            ResponseHead::parse_status_line("HTTP/1.1 304 Not Modified").unwrap();
        assert_eq!(version, "HTTP/1.1");
        assert_eq!(status, StatusCode::NOT_MODIFIED);
        assert_eq!(reason, "Not Modified");

        let (_, status, reason) = ResponseHead::parse_status_line("HTTP/1.0 200").unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(reason.is_empty());

        assert!(ResponseHead::parse_status_line("ICY 200 OK").is_err());
        assert!(ResponseHead::parse_status_line("HTTP/1.1 2000 OK").is_err());
        assert!(ResponseHead::parse_status_line("HTTP/1.1 abc OK").is_err());
    }

    #[test]
    fn absent_content_length_means_empty_body() {
        let head = ResponseHead::new(StatusCode::OK);
        assert_eq!(head.content_length(), Ok(0));

        let mut bad = ResponseHead::new(StatusCode::OK);
        bad.headers.set("Content-Length", "12x");
        assert_eq!(
            bad.content_length(),
            Err(ProtocolError::InvalidContentLength("12x".into()))
        );
    }

    #[test]
    fn body_presence_follows_status_and_method() {
        assert!(ResponseHead::new(StatusCode::OK).has_body("GET"));
        assert!(!ResponseHead::new(StatusCode::OK).has_body("HEAD"));
        assert!(!ResponseHead::new(StatusCode::NOT_MODIFIED).has_body("GET"));
        assert!(!ResponseHead::new(StatusCode::NO_CONTENT).has_body("GET"));
    }

    #[test]
    fn encodes_status_line_and_headers() {
        let mut head = ResponseHead::new(StatusCode::BAD_GATEWAY);
        head.headers.set("Content-Length", "0");
        assert_eq!(
            String::from_utf8(head.encode()).unwrap(),
            "HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n"
        );
    }
}
