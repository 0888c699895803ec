//! Test framework for hub scenarios.
//!
//! Starts a real server on an ephemeral port and connects scripted agents and
//! observers to it over WebSocket:
//!
//! ```ignore
//! let harness = TestHarness::new().await?;
//! let mut observer = harness.connect_observer().await?;
//! let mut agent = harness.connect_agent("alpha").await?;
//!
//! let event = observer.next_event(Duration::from_secs(5)).await?;
//! assert_eq!(event["online"], true);
//!
//! harness.registry().send_command("alpha", CommandEnvelope::new("ping"));
//! let command = agent.next_command(Duration::from_secs(5)).await?;
//! ```

use crate::config::ServerConfig;
use crate::protocol::CommandEnvelope;
use crate::records::{ClientRecords, NoopRecords, RecordError};
use crate::registry::Registry;
use crate::server::Server;
use crate::watch::{self, ClientStream};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the test framework.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("timeout waiting for condition")]
    Timeout,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("connection closed (code {0:?})")]
    Closed(Option<u16>),

    #[error("unexpected frame: {0}")]
    Unexpected(String),
}

/// Test harness that owns a running server.
pub struct TestHarness {
    url: String,
    registry: Arc<Registry>,
    server_handle: JoinHandle<()>,
}

impl TestHarness {
    /// Start a server with no record store.
    pub async fn new() -> Result<Self, TestError> {
        Self::with_records(Arc::new(NoopRecords)).await
    }

    /// Start a server that reports connects and disconnects to `records`.
    pub async fn with_records(records: Arc<dyn ClientRecords>) -> Result<Self, TestError> {
        Self::with_config(Self::local_config(), records).await
    }

    /// Start a server with a custom configuration.
    pub async fn with_config(
        config: ServerConfig,
        records: Arc<dyn ClientRecords>,
    ) -> Result<Self, TestError> {
        let server = Server::bind(config, records)
            .await
            .map_err(|e| TestError::ServerError(e.to_string()))?;
        let addr = server
            .local_addr()
            .map_err(|e| TestError::ServerError(e.to_string()))?;
        let registry = server.registry();
        let server_handle = tokio::spawn(async move {
            let _ = server.run().await;
        });

        Ok(Self {
            url: format!("ws://{addr}"),
            registry,
            server_handle,
        })
    }

    /// Config bound to an ephemeral loopback port.
    #[must_use]
    pub fn local_config() -> ServerConfig {
        ServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    /// Base WebSocket URL of the server.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Connect an agent and wait until the server has registered it.
    pub async fn connect_agent(&self, client_id: &str) -> Result<AgentPeer, TestError> {
        let url = watch::agent_url(&self.url, client_id)
            .map_err(|e| TestError::Connect(e.to_string()))?;
        let stream = watch::connect(&url)
            .await
            .map_err(|e| TestError::Connect(e.to_string()))?;
        self.wait_until(SETTLE_TIMEOUT, || self.registry.is_online(client_id))
            .await?;
        Ok(AgentPeer {
            client_id: client_id.to_string(),
            stream,
        })
    }

    /// Connect with an arbitrary query string, without waiting for
    /// registration.
    pub async fn connect_raw(&self, query: &str) -> Result<RawPeer, TestError> {
        let url: url::Url = format!("{}/?{query}", self.url)
            .parse()
            .map_err(|e: url::ParseError| TestError::Connect(e.to_string()))?;
        let stream = watch::connect(&url)
            .await
            .map_err(|e| TestError::Connect(e.to_string()))?;
        Ok(RawPeer { stream })
    }

    /// Connect an observer and wait until the server has registered it.
    pub async fn connect_observer(&self) -> Result<ObserverPeer, TestError> {
        let before = self.registry.observer_count();
        let url =
            watch::observer_url(&self.url).map_err(|e| TestError::Connect(e.to_string()))?;
        let stream = watch::connect(&url)
            .await
            .map_err(|e| TestError::Connect(e.to_string()))?;
        self.wait_until(SETTLE_TIMEOUT, || self.registry.observer_count() > before)
            .await?;
        Ok(ObserverPeer { stream })
    }

    /// Poll `condition` until it holds or `timeout` passes.
    pub async fn wait_until<F>(&self, timeout: Duration, mut condition: F) -> Result<(), TestError>
    where
        F: FnMut() -> bool + Send,
    {
        let deadline = Instant::now() + timeout;
        while !condition() {
            if Instant::now() >= deadline {
                return Err(TestError::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    /// Run the shutdown sequence and wait for the server task to finish.
    pub async fn shutdown(mut self) -> Result<(), TestError> {
        self.registry.shutdown().await;
        let grace = self.registry.shutdown_timeout() + Duration::from_secs(1);
        tokio::time::timeout(grace, &mut self.server_handle)
            .await
            .map_err(|_| TestError::Timeout)?
            .map_err(|e| TestError::ServerError(e.to_string()))
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

/// A scripted agent connection.
pub struct AgentPeer {
    client_id: String,
    stream: ClientStream,
}

impl AgentPeer {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.client_id
    }

    /// Send a JSON message to the hub.
    pub async fn send_json(&mut self, value: &Value) -> Result<(), TestError> {
        self.send_text(&value.to_string()).await
    }

    /// Send a raw text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<(), TestError> {
        self.stream
            .send(Message::text(text.to_owned()))
            .await
            .map_err(|_| TestError::Closed(None))
    }

    /// Wait for the next command from the hub.
    pub async fn next_command(&mut self, timeout: Duration) -> Result<CommandEnvelope, TestError> {
        let text = next_text(&mut self.stream, timeout).await?;
        serde_json::from_str(&text).map_err(|_| TestError::Unexpected(text))
    }

    /// Wait for the hub to close this connection and return the close code.
    pub async fn closed(&mut self, timeout: Duration) -> Result<Option<u16>, TestError> {
        wait_closed(&mut self.stream, timeout).await
    }

    /// Close the connection from the agent side.
    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
        drain(&mut self.stream).await;
    }

    /// Drop the TCP connection without a close handshake.
    pub fn abandon(self) {
        drop(self.stream);
    }
}

/// A scripted dashboard connection.
pub struct ObserverPeer {
    stream: ClientStream,
}

impl ObserverPeer {
    /// Wait for the next event.
    pub async fn next_event(&mut self, timeout: Duration) -> Result<Value, TestError> {
        let text = next_text(&mut self.stream, timeout).await?;
        serde_json::from_str(&text).map_err(|_| TestError::Unexpected(text))
    }

    /// Wait for the next event with the given `type`, skipping others.
    pub async fn next_event_of(
        &mut self,
        kind: &str,
        timeout: Duration,
    ) -> Result<Value, TestError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = self.next_event(remaining).await?;
            if event.get("type").and_then(Value::as_str) == Some(kind) {
                return Ok(event);
            }
        }
    }

    /// Collect every event that arrives within `window`.
    pub async fn collect_for(&mut self, window: Duration) -> Vec<Value> {
        let deadline = Instant::now() + window;
        let mut events = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.next_event(remaining).await {
                Ok(event) => events.push(event),
                Err(_) => return events,
            }
        }
    }

    pub async fn closed(&mut self, timeout: Duration) -> Result<Option<u16>, TestError> {
        wait_closed(&mut self.stream, timeout).await
    }
}

/// A connection that may not have been accepted.
pub struct RawPeer {
    stream: ClientStream,
}

impl RawPeer {
    pub async fn closed(&mut self, timeout: Duration) -> Result<Option<u16>, TestError> {
        wait_closed(&mut self.stream, timeout).await
    }
}

async fn next_text(stream: &mut ClientStream, timeout: Duration) -> Result<String, TestError> {
    let read = async {
        while let Some(frame) = stream.next().await {
            match frame.map_err(|_| TestError::Closed(None))? {
                Message::Text(text) => return Ok(text.as_str().to_string()),
                Message::Close(frame) => {
                    return Err(TestError::Closed(frame.map(|f| u16::from(f.code))));
                }
                _ => {}
            }
        }
        Err(TestError::Closed(None))
    };
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| TestError::Timeout)?
}

async fn wait_closed(
    stream: &mut ClientStream,
    timeout: Duration,
) -> Result<Option<u16>, TestError> {
    let read = async {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Close(frame)) => {
                    let code = frame.map(|f| u16::from(f.code));
                    // Keep reading so the close reply gets flushed.
                    drain(stream).await;
                    return Ok(code);
                }
                Ok(_) => {}
                Err(_) => return Ok(None),
            }
        }
        Ok(None)
    };
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| TestError::Timeout)?
}

async fn drain(stream: &mut ClientStream) {
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(Ok(_)) = stream.next().await {}
    })
    .await;
}

/// Record store that remembers every call, in order.
///
/// Entries read `online:<id>`, `offline:<id>` and `release`.
#[derive(Debug, Default)]
pub struct RecordingRecords {
    entries: Mutex<Vec<String>>,
}

impl RecordingRecords {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, entry: String) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

#[async_trait]
impl ClientRecords for RecordingRecords {
    async fn client_online(&self, client_id: &str) -> Result<(), RecordError> {
        self.push(format!("online:{client_id}"));
        Ok(())
    }

    async fn client_offline(&self, client_id: &str) -> Result<(), RecordError> {
        self.push(format!("offline:{client_id}"));
        Ok(())
    }

    async fn release(&self) -> Result<(), RecordError> {
        self.push("release".to_string());
        Ok(())
    }
}
