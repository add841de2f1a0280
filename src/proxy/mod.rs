pub mod cache;
pub mod connection;
pub mod error;
pub mod http;
pub mod listener;
pub mod loopback;
pub mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::client::ClientConfig;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::settings::Settings;
use cache::{CacheController, CacheStatus};
use listener::{RunningListener, start_listener};
use loopback::LoopbackEndpoint;

/// Everything a client connection needs, shared by every connection of one listener.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub tls: Arc<ClientConfig>,
    pub cache: CacheController,
    pub endpoint: LoopbackEndpoint,
}

/// The caching proxy shared by all player instances of a process.
///
/// The listener and the datastore are reference counted by [`PlayerSession`]s: the first session
/// binds and opens them, the last one to go away stops and closes them.
#[derive(Clone)]
pub struct ProxyService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    settings: Arc<Settings>,
    tls: Arc<ClientConfig>,
    cache: CacheController,
    state: Mutex<ServiceState>,
}

#[derive(Default)]
struct ServiceState {
    sessions: usize,
    listener: Option<RunningListener>,
}

impl ProxyService {
    pub fn new(settings: Arc<Settings>, tls: Arc<ClientConfig>) -> Self {
        let cache = CacheController::new(&settings);
        Self {
            inner: Arc::new(ServiceInner {
                settings,
                tls,
                cache,
                state: Mutex::new(ServiceState::default()),
            }),
        }
    }

    pub fn cache(&self) -> &CacheController {
        &self.inner.cache
    }

    pub async fn sessions(&self) -> usize {
        self.inner.state.lock().await.sessions
    }

    /// Registers one player. Never fails: without a listener the session hands out the original
    /// URLs and playback goes straight to the origin.
    pub async fn acquire(&self) -> PlayerSession {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        state.sessions += 1;
        if state.sessions == 1 {
            inner.cache.acquire();
        }
        crate::metrics::set_active_sessions(state.sessions);

        if state.listener.is_none() {
            let settings = inner.settings.clone();
            let tls = inner.tls.clone();
            let cache = inner.cache.clone();
            match start_listener(settings.listen, move |endpoint| AppContext {
                settings,
                tls,
                cache,
                endpoint,
            })
            .await
            {
                Ok(listener) => state.listener = Some(listener),
                Err(err) => {
                    error!(error = ?err, "failed to start proxy listener; playback bypasses the cache");
                }
            }
        }
        let endpoint = state.listener.as_ref().map(RunningListener::endpoint);
        drop(state);

        if endpoint.is_some() {
            match inner.cache.open_and_wait().await {
                Ok(CacheStatus::Open) => {}
                Ok(status) => warn!(?status, "cache unavailable; proxying without storage"),
                Err(err) => warn!(error = ?err, "cache unavailable; proxying without storage"),
            }
        }

        PlayerSession {
            service: self.clone(),
            endpoint,
            released: false,
        }
    }

    async fn release_session(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.sessions == 0 {
            debug!("player session released twice");
            return;
        }
        state.sessions -= 1;
        crate::metrics::set_active_sessions(state.sessions);
        if state.sessions > 0 {
            return;
        }
        if let Some(listener) = state.listener.take() {
            listener.stop().await;
        }
        inner.cache.release();
        info!("last player session released");
    }
}

/// One player's hold on the proxy.
pub struct PlayerSession {
    service: ProxyService,
    endpoint: Option<LoopbackEndpoint>,
    released: bool,
}

impl PlayerSession {
    /// Address players connect to, `None` when the listener could not be bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.map(|endpoint| endpoint.addr())
    }

    /// URL the player should request instead of `url`.
    pub fn proxy_url(&self, url: &str) -> Result<String> {
        let parsed = Url::parse(url).with_context(|| format!("invalid media URL '{url}'"))?;
        Ok(match &self.endpoint {
            Some(endpoint) => endpoint.encode_url(&parsed),
            None => url.to_string(),
        })
    }

    pub async fn release(mut self) {
        self.released = true;
        self.service.release_session().await;
    }
}

impl Drop for PlayerSession {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let service = self.service.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { service.release_session().await });
        } else {
            warn!("player session dropped outside a runtime; proxy stays up");
        }
    }
}
