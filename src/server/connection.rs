//! Per-connection task.
//!
//! Each accepted socket gets one task that performs the WebSocket upgrade,
//! classifies the peer, registers it, then loops over inbound frames and
//! queued outbound frames until the connection ends. Every way out of the
//! loop funnels into the same teardown call.

use super::classify::{classify, ConnectionKind};
use crate::protocol::CLOSE_NORMAL;
use crate::registry::{Channel, Outbound, Registry};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// How long to wait for the peer's close reply after we sent a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Why a connection loop ended.
#[derive(Debug)]
enum Termination {
    /// Peer closed or the socket hit EOF.
    PeerClosed,
    /// We sent a close frame and the peer went away.
    ClosedByServer,
    /// Reading failed.
    Errored(WsError),
    /// Writing failed.
    SendFailed(WsError),
    /// Every sender for this connection was dropped.
    Released,
}

/// Drive one accepted socket to completion.
pub(crate) async fn handle(stream: TcpStream, peer: SocketAddr, registry: Arc<Registry>) {
    let mut query = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        debug!(%peer, uri = %request.uri(), "WebSocket upgrade");
        query = request.uri().query().map(str::to_owned);
        Ok(response)
    };
    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, "WebSocket handshake failed: {e}");
            return;
        }
    };

    let kind = match classify(query.as_deref()) {
        Ok(kind) => kind,
        Err(rejection) => {
            warn!(%peer, "Rejecting connection: {rejection}");
            reject(ws, rejection.close_code(), &rejection.to_string()).await;
            return;
        }
    };

    if registry.is_shutting_down() {
        reject(ws, CLOSE_NORMAL, "Server shutting down").await;
        return;
    }

    let (sink, stream) = ws.split();
    let (channel, rx) = Channel::new();
    let channel_id = channel.id();

    match kind {
        ConnectionKind::Observer => {
            registry.attach_observer(channel);
            let end = drive(sink, stream, rx, |text| {
                debug!(%peer, len = text.len(), "Ignoring observer frame");
            })
            .await;
            log_termination(&end, "observer", &peer.to_string());
            registry.detach_observer(channel_id);
        }
        ConnectionKind::Agent { identifier } => {
            registry.attach_agent(&identifier, channel);
            let end = drive(sink, stream, rx, |text| {
                registry.relay_from_agent(channel_id, &identifier, text);
            })
            .await;
            log_termination(&end, "agent", &identifier);
            registry.detach_agent(channel_id);
        }
    }
}

/// Pump frames both ways until the connection ends.
async fn drive<F>(
    mut sink: WsSink,
    mut stream: WsStream,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut on_text: F,
) -> Termination
where
    F: FnMut(&str) + Send,
{
    let mut closing = false;
    let close_deadline = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(close_deadline);

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => on_text(text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => on_text(text),
                    Err(_) => debug!(len = bytes.len(), "Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Peer sent close");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) if !closing => return Termination::Errored(e),
                Some(Err(_)) | None => {
                    return if closing {
                        Termination::ClosedByServer
                    } else {
                        Termination::PeerClosed
                    };
                }
            },

            outbound = rx.recv(), if !closing => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        return Termination::SendFailed(e);
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    closing = true;
                    close_deadline.as_mut().reset(Instant::now() + CLOSE_GRACE);
                    if let Err(e) = sink.send(close_message(code, reason)).await {
                        debug!("Close frame not sent: {e}");
                        return Termination::ClosedByServer;
                    }
                }
                None => {
                    let _ = sink.send(close_message(CLOSE_NORMAL, String::new())).await;
                    return Termination::Released;
                }
            },

            () = &mut close_deadline, if closing => {
                debug!("Peer did not answer close in time");
                return Termination::ClosedByServer;
            }
        }
    }
}

fn close_message(code: u16, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

/// Close a connection that never got registered.
async fn reject(mut ws: WebSocketStream<TcpStream>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!("Close on rejected connection failed: {e}");
        return;
    }
    // Give the peer a moment to answer the close.
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

fn log_termination(end: &Termination, role: &str, who: &str) {
    match end {
        Termination::PeerClosed | Termination::ClosedByServer | Termination::Released => {
            info!(%role, %who, ?end, "Connection closed");
        }
        Termination::Errored(e) => {
            warn!(%role, %who, "Connection error: {e}");
        }
        Termination::SendFailed(e) => {
            warn!(%role, %who, "Send failed: {e}");
        }
    }
}
