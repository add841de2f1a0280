pub mod cli;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use rustls::crypto::ring;
use rustls::{RootCertStore, client::ClientConfig};
use rustls_native_certs as native_certs;
use tracing::warn;

use crate::proxy::ProxyService;
use crate::settings::Settings;

/// Hosts one player session until Ctrl-C, printing the loopback form of each of `urls`.
pub async fn run(settings: Settings, urls: &[String]) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let tls = build_tls_client_config()?;
    let service = ProxyService::new(settings.clone(), tls);
    let session = service.acquire().await;
    match session.local_addr() {
        Some(addr) => tracing::info!(
            address = %addr,
            storage_dir = %settings.storage_dir.display(),
            cache = ?service.cache().status(),
            "player cache ready"
        ),
        None => warn!("player cache running without a listener; URLs are passed through"),
    }
    for url in urls {
        println!("{}", session.proxy_url(url)?);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");
    session.release().await;
    Ok(())
}

pub fn build_tls_client_config() -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    let mut anchors_loaded = 0usize;

    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            anchors_loaded += added;
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors");
        }
    }

    ensure!(
        anchors_loaded > 0,
        "no trust anchors available; install system certificates to reach https origins"
    );

    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
