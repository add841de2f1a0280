use std::net::SocketAddr;

use url::Url;

use crate::proxy::error::ProtocolError;

const HTTPS_FLAG: char = '1';
const HTTP_FLAG: char = '0';
const FLAG_SEPARATOR: char = '~';

/// The local address players are pointed at.
///
/// Origin URLs are folded into the path as
/// `http://localhost:<port>/<1|0>~<host>[:<port>]<path>[?query]`, `1` marking https.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackEndpoint {
    addr: SocketAddr,
}

impl LoopbackEndpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Loopback form of `url`. Schemes other than http(s) are returned unchanged.
    pub fn encode_url(&self, url: &Url) -> String {
        let flag = match url.scheme() {
            "https" => HTTPS_FLAG,
            "http" => HTTP_FLAG,
            _ => return url.to_string(),
        };
        let Some(host) = url.host_str() else {
            return url.to_string();
        };

        let mut encoded = format!("http://localhost:{}/{flag}{FLAG_SEPARATOR}{host}", self.port());
        if let Some(port) = url.port() {
            encoded.push(':');
            encoded.push_str(&port.to_string());
        }
        encoded.push_str(url.path());
        if let Some(query) = url.query() {
            encoded.push('?');
            encoded.push_str(query);
        }
        encoded
    }
}

/// Restores the origin URL from a loopback request target (`/<flag>~<authority><path>[?query]`).
pub fn decode_origin(target: &str) -> Result<Url, ProtocolError> {
    let invalid = || ProtocolError::InvalidLoopbackPath(target.to_string());

    let rest = target.strip_prefix('/').ok_or_else(invalid)?;
    let mut chars = rest.chars();
    let scheme = match chars.next() {
        Some(HTTPS_FLAG) => "https",
        Some(HTTP_FLAG) => "http",
        _ => return Err(invalid()),
    };
    if chars.next() != Some(FLAG_SEPARATOR) {
        return Err(invalid());
    }
    let remainder = chars.as_str();

    let authority_end = remainder.find(['/', '?']).unwrap_or(remainder.len());
    let (authority, path_and_query) = remainder.split_at(authority_end);
    if authority.is_empty() {
        return Err(invalid());
    }
    let authority = legacy_port_separator(authority);
    let path_and_query = if path_and_query.starts_with('/') {
        path_and_query.to_string()
    } else {
        format!("/{path_and_query}")
    };

    let url = Url::parse(&format!("{scheme}://{authority}{path_and_query}")).map_err(|_| invalid())?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid());
    }
    Ok(url)
}

/// Older encoders wrote `host~port`; turn the last `~` into `:`.
fn legacy_port_separator(authority: &str) -> String {
    match authority.rsplit_once(FLAG_SEPARATOR) {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            format!("{host}:{port}")
        }
        _ => authority.to_string(),
    }
}
