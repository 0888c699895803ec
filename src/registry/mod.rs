//! The connection registry.
//!
//! Tracks which agents are connected right now, routes commands to them, fans
//! events out to observers, re-keys live agents on rename and runs the
//! offline-before-delete handshake. Route handlers and other collaborators go
//! through [`Registry`] only; the maps underneath are never exposed.

mod channel;
mod connections;
mod dispatch;
mod handshake;

pub use channel::{Channel, ChannelId, Outbound, TransmitError};
pub use connections::{ConnectionSet, Rekey, SetClosed};
pub use dispatch::{BroadcastReport, DispatchError, Dispatcher};
pub use handshake::{HandshakeState, OfflineOutcome};

use crate::config::ServerConfig;
use crate::protocol::{
    AgentMessage, CommandEnvelope, Event, CLOSE_NORMAL, CLOSE_SUPERSEDED,
};
use crate::records::ClientRecords;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Reason sent with the `offline` command by [`Registry::request_offline_and_await`].
pub const DEFAULT_OFFLINE_REASON: &str = "client deleted";

const SHUTDOWN_REASON: &str = "Server shutting down";
const SUPERSEDED_REASON: &str = "superseded by a newer connection";

/// Outcome of [`Registry::rename_live_agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    /// The live entry moved to the new identifier.
    Renamed,
    /// The old identifier had no live connection.
    NotLive,
    /// The entry changed underneath the rename; nothing was moved.
    Superseded,
    /// Old and new identifiers are the same.
    Unchanged,
}

enum RecordUpdate {
    Online(String),
    Offline(String),
    Release(oneshot::Sender<()>),
}

/// Verb-level interface to the live connection state.
pub struct Registry {
    connections: Arc<ConnectionSet>,
    dispatcher: Dispatcher,
    records_tx: mpsc::UnboundedSender<RecordUpdate>,
    offline_timeout: Duration,
    shutdown_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutting_down: AtomicBool,
}

impl Registry {
    /// Create a registry forwarding connects and disconnects to `records`.
    ///
    /// Spawns the record-update worker, so this must run inside a Tokio
    /// runtime.
    pub fn new(records: Arc<dyn ClientRecords>, config: &ServerConfig) -> Self {
        let connections = Arc::new(ConnectionSet::new());
        let (records_tx, records_rx) = mpsc::unbounded_channel();
        tokio::spawn(record_worker(records, records_rx));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            dispatcher: Dispatcher::new(Arc::clone(&connections)),
            connections,
            records_tx,
            offline_timeout: config.offline_timeout,
            shutdown_timeout: config.shutdown_timeout,
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Send a command to one agent. Returns whether it was queued on a live
    /// connection.
    pub fn send_command(&self, identifier: &str, envelope: CommandEnvelope) -> bool {
        match self.dispatcher.send_to_agent(identifier, envelope) {
            Ok(()) => true,
            Err(DispatchError::Transmit {
                identifier, reaped, ..
            }) => {
                if reaped {
                    self.agent_gone(&identifier);
                }
                false
            }
            Err(e) => {
                debug!("Command not sent: {e}");
                false
            }
        }
    }

    #[must_use]
    pub fn is_online(&self, identifier: &str) -> bool {
        self.connections.is_live(identifier)
    }

    #[must_use]
    pub fn list_online_identifiers(&self) -> Vec<String> {
        self.connections.list_agent_identifiers().into_iter().collect()
    }

    /// Send an event to every observer. Returns how many received it.
    pub fn broadcast_event<T: Serialize + ?Sized>(&self, event: &T) -> usize {
        match self.dispatcher.broadcast_to_observers(event) {
            Ok(report) => report.delivered,
            Err(e) => {
                warn!("Broadcast failed: {e}");
                0
            }
        }
    }

    /// Ask `identifier` to go offline and wait up to `timeout` for it to
    /// disconnect.
    pub async fn request_offline_and_await(
        &self,
        identifier: &str,
        timeout: Duration,
    ) -> OfflineOutcome {
        self.request_offline_with_reason(identifier, DEFAULT_OFFLINE_REASON, timeout)
            .await
    }

    /// [`Self::request_offline_and_await`] with the configured timeout.
    pub async fn request_offline_default(&self, identifier: &str) -> OfflineOutcome {
        self.request_offline_and_await(identifier, self.offline_timeout)
            .await
    }

    pub async fn request_offline_with_reason(
        &self,
        identifier: &str,
        reason: &str,
        timeout: Duration,
    ) -> OfflineOutcome {
        let Some(channel) = self
            .connections
            .lookup_agent(identifier)
            .filter(Channel::is_open)
        else {
            debug!(%identifier, "Offline request skipped, agent not online");
            return OfflineOutcome::NotApplicable;
        };

        let mut liveness = self.connections.subscribe_liveness();
        let mut state = HandshakeState::new(identifier, timeout).tracking(channel.id());

        if !self.send_command(identifier, CommandEnvelope::offline(reason)) {
            let outcome = state.resolve(OfflineOutcome::Confirmed);
            info!(%identifier, "Agent gone before offline request was sent");
            return outcome;
        }
        info!(%identifier, ?timeout, "Requested agent go offline");

        let outcome = handshake::await_offline(&self.connections, &mut liveness, &mut state).await;
        match outcome {
            OfflineOutcome::TimedOut => {
                warn!(%identifier, ?timeout, "Agent did not go offline in time, proceeding");
            }
            _ => {
                info!(%identifier, elapsed = ?state.elapsed(), "Agent went offline");
            }
        }
        outcome
    }

    /// Move a live agent from `old` to `new` without touching its connection.
    ///
    /// Observers see `old` go offline and `new` come online, followed by an
    /// `alias_updated` event. If the entry under `old` changes while the rename
    /// is in progress, nothing moves.
    pub fn rename_live_agent(&self, old: &str, new: &str) -> RenameOutcome {
        if old == new {
            return RenameOutcome::Unchanged;
        }
        let Some(channel) = self
            .connections
            .lookup_agent(old)
            .filter(Channel::is_open)
        else {
            debug!(%old, %new, "Rename skipped, agent not live");
            return RenameOutcome::NotLive;
        };

        match self.connections.rekey_agent(old, new, channel.id()) {
            Rekey::Superseded => {
                debug!(%old, %new, "Rename skipped, entry superseded");
                RenameOutcome::Superseded
            }
            Rekey::Moved { displaced } => {
                if let Some(displaced) = displaced {
                    close_quietly(&displaced, CLOSE_SUPERSEDED, SUPERSEDED_REASON);
                }
                info!(%old, %new, channel = %channel.id(), "Renamed live agent");
                self.broadcast_event(&Event::status(old, false));
                self.broadcast_event(&Event::status(new, true));
                self.broadcast_event(&Event::AliasUpdated {
                    client_id: new.to_string(),
                    old_alias: old.to_string(),
                    new_alias: new.to_string(),
                });
                RenameOutcome::Renamed
            }
        }
    }

    /// Close every connection and stop accepting new ones.
    ///
    /// Bounded by the configured shutdown timeout. Calling it again is a
    /// no-op.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down registry");
        if tokio::time::timeout(self.shutdown_timeout, self.shutdown_sequence())
            .await
            .is_err()
        {
            warn!(timeout = ?self.shutdown_timeout, "Shutdown sequence abandoned");
            self.shutdown_tx.send_replace(true);
        }
    }

    async fn shutdown_sequence(&self) {
        for observer in self.connections.drain_observers() {
            close_quietly(&observer, CLOSE_NORMAL, SHUTDOWN_REASON);
        }

        for (identifier, channel) in self.connections.drain_agents() {
            close_quietly(&channel, CLOSE_NORMAL, SHUTDOWN_REASON);
            self.queue_record(RecordUpdate::Offline(identifier));
        }

        self.shutdown_tx.send_replace(true);

        let (done_tx, done_rx) = oneshot::channel();
        if self.records_tx.send(RecordUpdate::Release(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Receiver that flips to `true` once new connections must be refused.
    #[must_use]
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.connections.observer_count()
    }

    /// Register a freshly classified agent connection.
    pub(crate) fn attach_agent(&self, identifier: &str, channel: Channel) {
        let id = channel.id();
        match self.connections.register_agent(identifier, channel) {
            Ok(None) => {}
            Ok(Some(previous)) => {
                info!(%identifier, old = %previous.id(), new = %id, "Replacing duplicate session");
                close_quietly(&previous, CLOSE_SUPERSEDED, SUPERSEDED_REASON);
            }
            Err(SetClosed(refused)) => {
                debug!(%identifier, channel = %id, "Agent refused, shutting down");
                close_quietly(&refused, CLOSE_NORMAL, SHUTDOWN_REASON);
                return;
            }
        }
        info!(%identifier, channel = %id, "Agent connected");
        self.queue_record(RecordUpdate::Online(identifier.to_string()));
        self.broadcast_event(&Event::status(identifier, true));
    }

    /// Tear down an agent connection. Safe to call more than once.
    pub(crate) fn detach_agent(&self, channel: ChannelId) {
        if let Some(identifier) = self.connections.unregister_channel(channel) {
            info!(%identifier, %channel, "Agent disconnected");
            self.agent_gone(&identifier);
        }
    }

    pub(crate) fn attach_observer(&self, channel: Channel) {
        let id = channel.id();
        match self.connections.add_observer(channel) {
            Ok(()) => debug!(channel = %id, "Observer connected"),
            Err(SetClosed(refused)) => {
                debug!(channel = %id, "Observer refused, shutting down");
                close_quietly(&refused, CLOSE_NORMAL, SHUTDOWN_REASON);
            }
        }
    }

    pub(crate) fn detach_observer(&self, channel: ChannelId) {
        if self.connections.remove_observer(channel) {
            debug!(%channel, "Observer disconnected");
        }
    }

    /// Handle a text frame from an agent connection. `fallback` is the
    /// identifier the connection registered with, used once the entry is gone.
    pub(crate) fn relay_from_agent(&self, channel: ChannelId, fallback: &str, text: &str) {
        let identifier = self
            .connections
            .identifier_of(channel)
            .unwrap_or_else(|| fallback.to_string());

        let message = match AgentMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(%identifier, "Invalid message from agent: {e}");
                return;
            }
        };

        if let AgentMessage::Unknown { kind } = &message {
            info!(%identifier, ?kind, "Unknown message type from agent");
            return;
        }
        if let AgentMessage::UntypedOutput { kind, .. } = &message {
            debug!(%identifier, ?kind, "Relaying untyped message as shell output");
        }
        if let Some(event) = message.into_event(&identifier) {
            let delivered = self.broadcast_event(&event);
            debug!(client_id = event.client_id(), delivered, "Relayed agent output");
        }
    }

    fn agent_gone(&self, identifier: &str) {
        self.queue_record(RecordUpdate::Offline(identifier.to_string()));
        self.broadcast_event(&Event::status(identifier, false));
    }

    fn queue_record(&self, update: RecordUpdate) {
        if self.records_tx.send(update).is_err() {
            warn!("Record worker stopped, dropping update");
        }
    }
}

fn close_quietly(channel: &Channel, code: u16, reason: &str) {
    if let Err(e) = channel.close(code, reason) {
        debug!("Close skipped: {e}");
    }
}

/// Applies record updates in the order they were queued.
async fn record_worker(
    records: Arc<dyn ClientRecords>,
    mut rx: mpsc::UnboundedReceiver<RecordUpdate>,
) {
    while let Some(update) = rx.recv().await {
        match update {
            RecordUpdate::Online(client_id) => {
                if let Err(e) = records.client_online(&client_id).await {
                    warn!(%client_id, "Failed to mark client online: {e}");
                }
            }
            RecordUpdate::Offline(client_id) => {
                if let Err(e) = records.client_offline(&client_id).await {
                    warn!(%client_id, "Failed to mark client offline: {e}");
                }
            }
            RecordUpdate::Release(done) => {
                if let Err(e) = records.release().await {
                    warn!("Failed to release record store: {e}");
                }
                let _ = done.send(());
            }
        }
    }
}
