//! Hooks into the persistent client-record store.
//!
//! The registry only knows who is connected right now. Whatever keeps durable
//! client metadata (online flag, alias, caches) implements [`ClientRecords`]
//! and is told about connects and disconnects. Calls are fire-and-forget from
//! the registry's point of view: a failure is logged and never blocks a
//! registration.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ClientRecords: Send + Sync + 'static {
    /// An agent connected under `client_id`.
    async fn client_online(&self, client_id: &str) -> Result<(), RecordError>;

    /// The agent under `client_id` disconnected.
    async fn client_offline(&self, client_id: &str) -> Result<(), RecordError>;

    /// Release pooled resources during shutdown.
    async fn release(&self) -> Result<(), RecordError> {
        Ok(())
    }
}

/// Record store that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecords;

#[async_trait]
impl ClientRecords for NoopRecords {
    async fn client_online(&self, _client_id: &str) -> Result<(), RecordError> {
        Ok(())
    }

    async fn client_offline(&self, _client_id: &str) -> Result<(), RecordError> {
        Ok(())
    }
}
