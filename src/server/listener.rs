//! TCP accept loop and the background expiry sweeper.
//!
//! Signal-triggered graceful shutdown and the HTTP admin endpoint are
//! external collaborators this crate does not wire up (see DESIGN.md). The
//! listener itself just accepts, spawns, and keeps a sweeper ticking.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::time::interval;

use crate::config::Config;
use crate::engine::Engine;
use crate::error::Result;
use crate::server::session::{ConnectionGuard, ConnectionHandler};

pub struct Listener {
    engine: Arc<Engine>,
    listen_addr: String,
    cleanup_interval_secs: u64,
}

impl Listener {
    pub fn new(engine: Arc<Engine>, config: &Config) -> Self {
        Self {
            engine,
            listen_addr: config.listen_addr.clone(),
            cleanup_interval_secs: config.cleanup_interval_secs,
        }
    }

    /// Bind and accept connections forever, alongside a sweeper task that
    /// periodically reclaims expired keys, run independent of lazy expiry.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Bind the listening socket without yet accepting. Split out from
    /// [`Listener::run`] so tests can discover the bound (e.g. OS-assigned)
    /// address before handing the socket to [`Listener::serve`].
    pub async fn bind(&self) -> Result<TcpListener> {
        let bind_addr = normalize_listen_addr(&self.listen_addr);
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("FerroDB listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Run the sweeper and accept loop against an already-bound socket.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.spawn_sweeper();

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let engine = Arc::clone(&self.engine);
                    let counter = engine.active_connections();
                    info!("connection accepted: {peer_addr}");

                    tokio::spawn(async move {
                        let _guard = ConnectionGuard::enter(counter);
                        let handler = ConnectionHandler::new(stream, engine, peer_addr);
                        if let Err(e) = handler.run().await {
                            error!("connection error from {peer_addr}: {e}");
                        }
                    });
                }
                Err(e) => error!("failed to accept connection: {e}"),
            }
        }
    }

    fn spawn_sweeper(&self) {
        let store = self.engine.store();
        let period = Duration::from_secs(self.cleanup_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                store.sweep_expired();
            }
        });
    }
}

/// A leading `:` (e.g. `:6380`) means "every interface". `std`/tokio address
/// parsing needs an explicit host, so normalize it to `0.0.0.0:<port>`.
fn normalize_listen_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}
