use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::AppContext;
use super::connection::handle_connection;
use super::loopback::LoopbackEndpoint;

/// A bound loopback listener and its accept task.
#[derive(Debug)]
pub struct RunningListener {
    endpoint: LoopbackEndpoint,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RunningListener {
    pub fn endpoint(&self) -> LoopbackEndpoint {
        self.endpoint
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.addr()
    }

    /// Stops accepting. Connections already handed off keep running to completion.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.task.await {
            debug!(error = %err, "listener task ended abnormally");
        }
        info!(address = %self.endpoint.addr(), "proxy listener stopped");
    }
}

/// Binds `bind_addr` and spawns the accept loop. `build_app` receives the bound endpoint so
/// playlist rewriting can point back at the actual port.
pub async fn start_listener<F>(bind_addr: SocketAddr, build_app: F) -> Result<RunningListener>
where
    F: FnOnce(LoopbackEndpoint) -> AppContext,
{
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    let local_addr = listener.local_addr().unwrap_or(bind_addr);
    let endpoint = LoopbackEndpoint::new(local_addr);
    let app = build_app(endpoint);
    info!(address = %local_addr, "proxy listener started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(accept_loop(listener, app, shutdown_rx));
    Ok(RunningListener {
        endpoint,
        shutdown_tx,
        task,
    })
}

async fn accept_loop(listener: TcpListener, app: AppContext, mut shutdown: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };
        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept incoming connection");
                continue;
            }
        };
        debug!(peer = %peer_addr, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY on player stream");
        }
        let connection_app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer_addr, connection_app).await {
                debug!(peer = %peer_addr, error = %err, "connection closed with error");
            }
        });
    }
}
