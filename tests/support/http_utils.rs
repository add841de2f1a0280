use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt};

/// A complete HTTP/1.1 response read until the peer closed the connection.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let head_end = raw
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .ok_or_else(|| anyhow!("response has no complete head: {:?}", String::from_utf8_lossy(raw)))?;
        let head = std::str::from_utf8(&raw[..head_end]).context("response head is not UTF-8")?;
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| anyhow!("missing status code in '{status_line}'"))?
            .parse::<u16>()
            .map_err(|err| anyhow!("invalid status code: {err}"))?;
        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect();
        Ok(Self {
            status,
            headers,
            body: raw[head_end + 4..].to_vec(),
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub async fn read_http_response<S>(stream: &mut S) -> Result<HttpResponse>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    HttpResponse::parse(&buf)
}

/// Index just past the blank line ending a message head, if `buffer` holds one.
pub fn head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}
