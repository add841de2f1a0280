use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tempfile::TempDir;
use url::Url;

use playercache::{
    cli::LogFormat,
    proxy::{PlayerSession, ProxyService},
    settings::Settings,
};

use rustls::{RootCertStore, client::ClientConfig, crypto::ring};

use super::{HttpResponse, get_request, raw_exchange};

fn default_test_settings(storage_dir: PathBuf) -> Result<Settings> {
    Ok(Settings {
        listen: "127.0.0.1:0".parse()?,
        storage_dir,
        cache_quota_bytes: 64 * 1024 * 1024,
        log: LogFormat::Text,
        client_timeout: 10,
        upstream_connect_timeout: 5,
        upstream_timeout: 10,
        tls_handshake_timeout: 5,
        max_header_size: 32 * 1024,
        max_playlist_size: 1024 * 1024,
        chunk_queue_depth: 4,
        index_failure_threshold: 3,
        metrics_listen: None,
    })
}

/// Origins in tests are plain HTTP; the TLS config only has to exist.
fn test_tls_config() -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(ring::default_provider().into())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// A `ProxyService` with one acquired player session on a free loopback port.
pub struct ProxyHarness {
    pub storage: TempDir,
    pub service: ProxyService,
    pub addr: SocketAddr,
    session: Option<PlayerSession>,
}

impl ProxyHarness {
    pub async fn start() -> Result<Self> {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with<F>(configure: F) -> Result<Self>
    where
        F: FnOnce(&mut Settings),
    {
        let storage = TempDir::new()?;
        let mut settings = default_test_settings(storage.path().join("storage"))?;
        configure(&mut settings);

        let service = ProxyService::new(Arc::new(settings), test_tls_config()?);
        let session = service.acquire().await;
        let addr = session
            .local_addr()
            .ok_or_else(|| anyhow!("proxy listener did not bind"))?;

        Ok(Self {
            storage,
            service,
            addr,
            session: Some(session),
        })
    }

    pub fn session(&self) -> &PlayerSession {
        self.session.as_ref().expect("session held until shutdown")
    }

    /// Loopback request target (path and query) for an origin URL.
    pub fn target_for(&self, origin_url: &str) -> Result<String> {
        let proxied = Url::parse(&self.session().proxy_url(origin_url)?)?;
        Ok(match proxied.query() {
            Some(query) => format!("{}?{query}", proxied.path()),
            None => proxied.path().to_string(),
        })
    }

    pub async fn get(&self, origin_url: &str) -> Result<HttpResponse> {
        self.get_with_headers(origin_url, "").await
    }

    pub async fn get_with_headers(&self, origin_url: &str, headers: &str) -> Result<HttpResponse> {
        let target = self.target_for(origin_url)?;
        raw_exchange(self.addr, get_request(&target, headers)).await
    }

    pub async fn shutdown(mut self) {
        if let Some(session) = self.session.take() {
            session.release().await;
        }
    }

    /// Releases the session but keeps the storage directory for a later harness.
    pub async fn shutdown_keep_storage(mut self) -> TempDir {
        if let Some(session) = self.session.take() {
            session.release().await;
        }
        self.storage
    }
}
