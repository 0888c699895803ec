//! Transmit handle for one live connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::mpsc;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a channel. Two handles refer to the same
/// connection iff their ids are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Frame queued for the connection task to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Send a close frame and stop writing.
    Close { code: u16, reason: String },
}

/// The connection task is gone; nothing queued on this channel will be sent.
#[derive(Debug, Error)]
#[error("channel {0} is closed")]
pub struct TransmitError(pub ChannelId);

/// Sending half of a connection.
///
/// The connection task owns the matching receiver and writes queued frames in
/// order, so frames sent through one channel are never reordered.
#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    tx: mpsc::UnboundedSender<Outbound>,
    connected_at: SystemTime,
}

impl Channel {
    /// Create a channel and the receiver its connection task drains.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed));
        let channel = Self {
            id,
            tx,
            connected_at: SystemTime::now(),
        };
        (channel, rx)
    }

    #[must_use]
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    #[must_use]
    pub const fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// Whether the connection task is still draining this channel.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a text frame.
    pub fn transmit(&self, text: String) -> Result<(), TransmitError> {
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_| TransmitError(self.id))
    }

    /// Ask the connection task to close with `code`.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), TransmitError> {
        self.tx
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| TransmitError(self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let (a, _rx_a) = Channel::new();
        let (b, _rx_b) = Channel::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (channel, mut rx) = Channel::new();
        channel.transmit("one".into()).expect("open");
        channel.transmit("two".into()).expect("open");
        channel.close(1000, "bye").expect("open");

        assert_eq!(rx.recv().await, Some(Outbound::Text("one".into())));
        assert_eq!(rx.recv().await, Some(Outbound::Text("two".into())));
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Close {
                code: 1000,
                reason: "bye".into()
            })
        );
    }

    #[test]
    fn test_transmit_fails_once_receiver_dropped() {
        let (channel, rx) = Channel::new();
        assert!(channel.is_open());
        drop(rx);
        assert!(!channel.is_open());
        assert!(channel.transmit("lost".into()).is_err());
    }
}
