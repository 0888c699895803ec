//! WebSocket client side: connection URLs and the observer stream.
//!
//! `c3-hub watch` uses [`Watcher`] to print events as they arrive; the test
//! harness uses the same URL helpers to connect scripted agents.

use crate::protocol::{OBSERVER_TYPE, PARAM_CLIENT_ID, PARAM_TYPE};
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("invalid server URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("failed to connect: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("connection error: {0}")]
    Receive(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("invalid event: {0}")]
    Decode(#[source] serde_json::Error),
}

/// `base` with the observer marker appended.
pub fn observer_url(base: &str) -> Result<Url, WatchError> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut().append_pair(PARAM_TYPE, OBSERVER_TYPE);
    Ok(url)
}

/// `base` with an agent identifier appended.
pub fn agent_url(base: &str, client_id: &str) -> Result<Url, WatchError> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut().append_pair(PARAM_CLIENT_ID, client_id);
    Ok(url)
}

/// Open a WebSocket to `url`.
pub async fn connect(url: &Url) -> Result<ClientStream, WatchError> {
    let (stream, _response) = connect_async(url.as_str())
        .await
        .map_err(WatchError::Connect)?;
    debug!(%url, "Connected");
    Ok(stream)
}

/// Observer connection yielding decoded events.
pub struct Watcher {
    stream: ClientStream,
}

impl Watcher {
    pub async fn connect(base: &str) -> Result<Self, WatchError> {
        let stream = connect(&observer_url(base)?).await?;
        Ok(Self { stream })
    }

    /// Next event, or `None` once the server closes the connection.
    ///
    /// Events are returned as raw JSON so types added by collaborators pass
    /// through untouched.
    pub async fn next_event(&mut self) -> Result<Option<Value>, WatchError> {
        while let Some(frame) = self.stream.next().await {
            match frame.map_err(WatchError::Receive)? {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str())
                        .map(Some)
                        .map_err(WatchError::Decode);
                }
                Message::Close(frame) => {
                    debug!(?frame, "Server closed the connection");
                }
                _ => {}
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer_url() {
        let url = observer_url("ws://127.0.0.1:8080").expect("url");
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/?type=web");
    }

    #[test]
    fn test_agent_url_encodes_identifier() {
        let url = agent_url("ws://127.0.0.1:8080/", "host one").expect("url");
        assert_eq!(url.query(), Some("client_id=host+one"));
    }

    #[test]
    fn test_rejects_garbage_url() {
        assert!(matches!(observer_url("not a url"), Err(WatchError::Url(_))));
    }
}
