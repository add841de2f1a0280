use std::net::SocketAddr;
use std::time::Duration as StdDuration;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{HttpResponse, read_http_response};

pub struct ProxyClient {
    stream: TcpStream,
}

impl ProxyClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(addr).await?,
        })
    }

    pub async fn send(&mut self, request: impl AsRef<[u8]>) -> Result<()> {
        self.stream.write_all(request.as_ref()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn read_response(&mut self) -> Result<HttpResponse> {
        timeout(StdDuration::from_secs(10), read_http_response(&mut self.stream)).await?
    }
}

/// Sends one raw request to the proxy and reads the whole response.
pub async fn raw_exchange(addr: SocketAddr, request: impl AsRef<[u8]>) -> Result<HttpResponse> {
    let mut client = ProxyClient::connect(addr).await?;
    client.send(request).await?;
    client.read_response().await
}

/// `GET` for `target` (a loopback path such as `/0~127.0.0.1:8080/a.ts`).
pub fn get_request(target: &str, extra_headers: &str) -> String {
    format!("GET {target} HTTP/1.1\r\nHost: localhost\r\nUser-Agent: test-player\r\n{extra_headers}\r\n")
}
