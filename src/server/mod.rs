//! The c3-hub server.
//!
//! Accepts WebSocket connections from agents and dashboards, hands each one
//! to its own task and owns the accept side of the shutdown sequence.

mod classify;
mod connection;

pub use classify::{classify, ConnectionKind, Rejection};

use crate::config::ServerConfig;
use crate::records::ClientRecords;
use crate::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// The c3-hub server.
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl Server {
    /// Bind the listener and create the registry.
    pub async fn bind(
        config: ServerConfig,
        records: Arc<dyn ClientRecords>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen,
                source,
            })?;
        let registry = Arc::new(Registry::new(records, &config));
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::Io)
    }

    /// Handle for route handlers and the shutdown trigger.
    #[must_use]
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until [`Registry::shutdown`] is called, then wait
    /// for open connections to finish within the shutdown timeout.
    pub async fn run(self) -> Result<(), ServerError> {
        let Self { listener, registry } = self;
        let mut shutdown_rx = registry.subscribe_shutdown();
        let mut tasks = JoinSet::new();

        info!("Server listening on {:?}", listener.local_addr().ok());

        while !*shutdown_rx.borrow_and_update() {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Accepted connection");
                            tasks.spawn(connection::handle(stream, peer, Arc::clone(&registry)));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        error!("Connection task panicked: {e}");
                    }
                }
            }
        }

        drop(listener);
        info!(open = tasks.len(), "Stopped accepting connections");

        let drain = async { while tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(registry.shutdown_timeout(), drain)
            .await
            .is_err()
        {
            warn!(remaining = tasks.len(), "Abandoning connections that did not close");
            tasks.abort_all();
        }

        info!("Server shut down");
        Ok(())
    }
}
