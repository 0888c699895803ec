//! Offline-before-delete handshake.
//!
//! Before an agent's record is purged, the agent is asked to disconnect and
//! the caller waits until it is gone or a deadline passes. Both outcomes let
//! the caller proceed.

use super::channel::ChannelId;
use super::connections::ConnectionSet;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Stand-in deadline for timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// How an offline request resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineOutcome {
    /// The agent disconnected before the deadline.
    Confirmed,
    /// The deadline passed with the agent still connected.
    TimedOut,
    /// The agent was not online; nothing was sent.
    NotApplicable,
}

impl std::fmt::Display for OfflineOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Confirmed => "confirmed",
            Self::TimedOut => "timed out",
            Self::NotApplicable => "not applicable",
        })
    }
}

/// One offline request in flight.
#[derive(Debug)]
pub struct HandshakeState {
    pub identifier: String,
    pub requested_at: Instant,
    pub deadline: Instant,
    /// The connection the request went to. While it stays registered the
    /// agent counts as online, even under another identifier.
    pub channel: Option<ChannelId>,
    resolved: Option<OfflineOutcome>,
}

impl HandshakeState {
    #[must_use]
    pub fn new(identifier: &str, timeout: Duration) -> Self {
        let requested_at = Instant::now();
        let deadline = requested_at
            .checked_add(timeout)
            .or_else(|| requested_at.checked_add(FAR_FUTURE))
            .unwrap_or(requested_at);
        Self {
            identifier: identifier.to_string(),
            requested_at,
            deadline,
            channel: None,
            resolved: None,
        }
    }

    /// Also wait for `channel` itself to go away.
    #[must_use]
    pub const fn tracking(mut self, channel: ChannelId) -> Self {
        self.channel = Some(channel);
        self
    }

    fn agent_live(&self, connections: &ConnectionSet) -> bool {
        connections.is_live(&self.identifier)
            || self
                .channel
                .is_some_and(|channel| connections.is_channel_live(channel))
    }

    /// Record `outcome` unless one was already recorded. Returns the outcome
    /// that stands.
    pub fn resolve(&mut self, outcome: OfflineOutcome) -> OfflineOutcome {
        *self.resolved.get_or_insert(outcome)
    }

    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.requested_at.elapsed()
    }
}

/// Wait until `state.identifier` has no live entry, and the tracked channel
/// is gone, or the deadline passes.
///
/// `liveness` must be subscribed before the offline command is sent so a
/// disconnect racing the send is not missed.
pub(crate) async fn await_offline(
    connections: &ConnectionSet,
    liveness: &mut watch::Receiver<u64>,
    state: &mut HandshakeState,
) -> OfflineOutcome {
    let deadline = tokio::time::sleep_until(state.deadline);
    tokio::pin!(deadline);

    loop {
        liveness.borrow_and_update();
        if !state.agent_live(connections) {
            return state.resolve(OfflineOutcome::Confirmed);
        }

        tokio::select! {
            changed = liveness.changed() => {
                if changed.is_err() {
                    // Registry dropped; nothing can be live any more.
                    return state.resolve(OfflineOutcome::Confirmed);
                }
            }
            () = &mut deadline => {
                return state.resolve(OfflineOutcome::TimedOut);
            }
        }
    }
}
