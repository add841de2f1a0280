use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use anyhow::Result;

/// A loopback address nothing listens on, for origins that refuse connections.
pub fn refused_origin_addr() -> Result<SocketAddr> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

pub fn refused_origin_url(path: &str) -> Result<String> {
    Ok(format!("http://{}{path}", refused_origin_addr()?))
}
