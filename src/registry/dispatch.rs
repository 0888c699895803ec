//! Command and event delivery.

use super::channel::TransmitError;
use super::connections::ConnectionSet;
use crate::protocol::CommandEnvelope;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("agent not connected: {0}")]
    NotConnected(String),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    /// The connection was gone. `reaped` is true if this call removed the
    /// entry, false if someone else already had.
    #[error("transmit to {identifier} failed: {source}")]
    Transmit {
        identifier: String,
        reaped: bool,
        #[source]
        source: TransmitError,
    },
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Observers removed because their connection was gone.
    pub dropped: usize,
}

/// Sends envelopes through the [`ConnectionSet`].
#[derive(Clone)]
pub struct Dispatcher {
    connections: Arc<ConnectionSet>,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(connections: Arc<ConnectionSet>) -> Self {
        Self { connections }
    }

    /// Send `envelope` to the agent registered under `identifier`.
    ///
    /// Session-scoped commands get `session_id` defaulted to `identifier`. A
    /// failed transmit removes the dead entry.
    pub fn send_to_agent(
        &self,
        identifier: &str,
        mut envelope: CommandEnvelope,
    ) -> Result<(), DispatchError> {
        let channel = self
            .connections
            .lookup_agent(identifier)
            .ok_or_else(|| DispatchError::NotConnected(identifier.to_string()))?;

        envelope.inject_session_id(identifier);
        let text = serde_json::to_string(&envelope).map_err(DispatchError::Encode)?;

        match channel.transmit(text) {
            Ok(()) => {
                debug!(%identifier, kind = %envelope.kind, "Queued command");
                Ok(())
            }
            Err(source) => {
                let reaped = self.connections.unregister_agent(identifier, channel.id());
                warn!(%identifier, channel = %channel.id(), %reaped, "Command transmit failed");
                Err(DispatchError::Transmit {
                    identifier: identifier.to_string(),
                    reaped,
                    source,
                })
            }
        }
    }

    /// Send `event` to every observer. Observers whose connection is gone are
    /// removed; the rest still receive the event.
    pub fn broadcast_to_observers<T: Serialize + ?Sized>(
        &self,
        event: &T,
    ) -> Result<BroadcastReport, DispatchError> {
        let text = serde_json::to_string(event).map_err(DispatchError::Encode)?;
        let mut report = BroadcastReport::default();

        for observer in self.connections.all_observers() {
            match observer.transmit(text.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Dropping observer: {e}");
                    if self.connections.remove_observer(observer.id()) {
                        report.dropped += 1;
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Event;
    use crate::registry::channel::{Channel, Outbound};
    use serde_json::{json, Value};

    fn setup() -> (Arc<ConnectionSet>, Dispatcher) {
        let connections = Arc::new(ConnectionSet::new());
        let dispatcher = Dispatcher::new(Arc::clone(&connections));
        (connections, dispatcher)
    }

    fn parse(frame: Option<Outbound>) -> Value {
        match frame {
            Some(Outbound::Text(text)) => serde_json::from_str(&text).expect("json"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn test_send_to_missing_agent_has_no_side_effect() {
        let (connections, dispatcher) = setup();
        let (other, _rx) = Channel::new();
        connections.register_agent("other", other).expect("open");

        let err = dispatcher
            .send_to_agent("alpha", CommandEnvelope::new("shell_execute"))
            .expect_err("not connected");
        assert!(matches!(err, DispatchError::NotConnected(id) if id == "alpha"));
        assert_eq!(connections.agent_count(), 1);
    }

    #[test]
    fn test_send_injects_session_id() {
        let (connections, dispatcher) = setup();
        let (channel, mut rx) = Channel::new();
        connections.register_agent("alpha", channel).expect("open");

        dispatcher
            .send_to_agent("alpha", CommandEnvelope::new("create_pty_session").with("cols", 120))
            .expect("send");
        let frame = parse(rx.try_recv().ok());
        assert_eq!(
            frame,
            json!({"type": "create_pty_session", "data": {"cols": 120, "session_id": "alpha"}})
        );
    }

    #[test]
    fn test_send_preserves_call_order() {
        let (connections, dispatcher) = setup();
        let (channel, mut rx) = Channel::new();
        connections.register_agent("alpha", channel).expect("open");

        for i in 0..5 {
            dispatcher
                .send_to_agent("alpha", CommandEnvelope::new("shell_execute").with("seq", i))
                .expect("send");
        }
        for i in 0..5 {
            assert_eq!(parse(rx.try_recv().ok())["data"]["seq"], json!(i));
        }
    }

    #[test]
    fn test_failed_transmit_reaps_entry_once() {
        let (connections, dispatcher) = setup();
        let (channel, rx) = Channel::new();
        connections.register_agent("alpha", channel).expect("open");
        drop(rx);

        let err = dispatcher
            .send_to_agent("alpha", CommandEnvelope::new("shell_execute"))
            .expect_err("dead channel");
        assert!(matches!(err, DispatchError::Transmit { reaped: true, .. }));
        assert!(!connections.is_live("alpha"));
        assert!(connections.lookup_agent("alpha").is_none());

        let err = dispatcher
            .send_to_agent("alpha", CommandEnvelope::new("shell_execute"))
            .expect_err("gone");
        assert!(matches!(err, DispatchError::NotConnected(_)));
    }

    #[test]
    fn test_broadcast_isolates_failed_observer() {
        let (connections, dispatcher) = setup();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (channel, rx) = Channel::new();
            connections.add_observer(channel).expect("open");
            receivers.push(rx);
        }
        let (broken, broken_rx) = Channel::new();
        connections.add_observer(broken).expect("open");
        drop(broken_rx);

        let report = dispatcher
            .broadcast_to_observers(&Event::status("alpha", true))
            .expect("broadcast");
        assert_eq!(report, BroadcastReport { delivered: 3, dropped: 1 });
        assert_eq!(connections.observer_count(), 3);

        for rx in &mut receivers {
            assert_eq!(parse(rx.try_recv().ok())["client_id"], json!("alpha"));
        }
    }
}
