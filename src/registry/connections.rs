//! Live connection storage.

use super::channel::{Channel, ChannelId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;

/// The set was drained for shutdown; the channel was not stored and is handed
/// back so the caller can close it.
#[derive(Debug, Error)]
#[error("connection set is closed")]
pub struct SetClosed(pub Channel);

/// Result of moving an agent entry to a new identifier.
#[derive(Debug)]
pub enum Rekey {
    /// The entry moved. `displaced` is whatever was registered under the new
    /// identifier before; the caller closes it.
    Moved { displaced: Option<Channel> },
    /// The old identifier no longer maps to the expected channel.
    Superseded,
}

#[derive(Default)]
struct Inner {
    agents: HashMap<String, Channel>,
    /// Reverse index so teardown can find an entry after a rename.
    owners: HashMap<ChannelId, String>,
    observers: HashMap<ChannelId, Channel>,
    /// Set by the drains; nothing is registered afterwards.
    closed: bool,
}

impl Inner {
    fn remove_agent(&mut self, identifier: &str) -> Option<Channel> {
        let channel = self.agents.remove(identifier)?;
        self.owners.remove(&channel.id());
        Some(channel)
    }
}

/// Identifier → agent channel map plus the observer set.
///
/// Every operation takes the lock once and never awaits while holding it.
/// Each removal of an agent entry bumps a liveness generation that waiters
/// can subscribe to.
pub struct ConnectionSet {
    inner: Mutex<Inner>,
    liveness: watch::Sender<u64>,
}

impl ConnectionSet {
    #[must_use]
    pub fn new() -> Self {
        let (liveness, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            liveness,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn agent_removed(&self) {
        self.liveness.send_modify(|generation| *generation += 1);
    }

    /// Register `channel` under `identifier`, returning the channel it
    /// replaced. Refused once the set has been drained.
    pub fn register_agent(
        &self,
        identifier: &str,
        channel: Channel,
    ) -> Result<Option<Channel>, SetClosed> {
        let previous = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(SetClosed(channel));
            }
            let previous = inner.remove_agent(identifier);
            inner.owners.insert(channel.id(), identifier.to_string());
            inner.agents.insert(identifier.to_string(), channel);
            previous
        };
        if previous.is_some() {
            self.agent_removed();
        }
        Ok(previous)
    }

    /// Remove `identifier` only if it still maps to `channel`.
    pub fn unregister_agent(&self, identifier: &str, channel: ChannelId) -> bool {
        let removed = {
            let mut inner = self.lock();
            match inner.agents.get(identifier) {
                Some(current) if current.id() == channel => {
                    inner.remove_agent(identifier).is_some()
                }
                _ => false,
            }
        };
        if removed {
            self.agent_removed();
        }
        removed
    }

    /// Remove whatever entry `channel` is registered under, returning that
    /// identifier.
    pub fn unregister_channel(&self, channel: ChannelId) -> Option<String> {
        let identifier = {
            let mut inner = self.lock();
            let identifier = inner.owners.get(&channel)?.clone();
            inner.remove_agent(&identifier);
            identifier
        };
        self.agent_removed();
        Some(identifier)
    }

    #[must_use]
    pub fn lookup_agent(&self, identifier: &str) -> Option<Channel> {
        self.lock().agents.get(identifier).cloned()
    }

    /// Identifier `channel` is currently registered under.
    #[must_use]
    pub fn identifier_of(&self, channel: ChannelId) -> Option<String> {
        self.lock().owners.get(&channel).cloned()
    }

    /// Whether `channel` is still registered, under any identifier, with its
    /// connection open.
    #[must_use]
    pub fn is_channel_live(&self, channel: ChannelId) -> bool {
        let inner = self.lock();
        inner
            .owners
            .get(&channel)
            .and_then(|identifier| inner.agents.get(identifier))
            .is_some_and(Channel::is_open)
    }

    /// Whether `identifier` has an entry whose connection is still open.
    #[must_use]
    pub fn is_live(&self, identifier: &str) -> bool {
        self.lock()
            .agents
            .get(identifier)
            .is_some_and(Channel::is_open)
    }

    /// Identifiers with an open connection.
    #[must_use]
    pub fn list_agent_identifiers(&self) -> BTreeSet<String> {
        self.lock()
            .agents
            .iter()
            .filter(|(_, channel)| channel.is_open())
            .map(|(identifier, _)| identifier.clone())
            .collect()
    }

    /// Move the entry for `old` to `new` if it is still `expected`.
    pub fn rekey_agent(&self, old: &str, new: &str, expected: ChannelId) -> Rekey {
        let mut inner = self.lock();
        match inner.agents.get(old) {
            Some(current) if current.id() == expected => {}
            _ => return Rekey::Superseded,
        }
        let Some(channel) = inner.remove_agent(old) else {
            return Rekey::Superseded;
        };
        let displaced = inner.remove_agent(new);
        inner.owners.insert(channel.id(), new.to_string());
        inner.agents.insert(new.to_string(), channel);
        drop(inner);
        self.agent_removed();
        Rekey::Moved { displaced }
    }

    pub fn add_observer(&self, channel: Channel) -> Result<(), SetClosed> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(SetClosed(channel));
        }
        inner.observers.insert(channel.id(), channel);
        Ok(())
    }

    pub fn remove_observer(&self, channel: ChannelId) -> bool {
        self.lock().observers.remove(&channel).is_some()
    }

    /// Snapshot of the observer set.
    #[must_use]
    pub fn all_observers(&self) -> Vec<Channel> {
        self.lock().observers.values().cloned().collect()
    }

    /// Remove and return every agent entry, and refuse new ones.
    pub fn drain_agents(&self) -> Vec<(String, Channel)> {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.owners.clear();
            inner.agents.drain().collect()
        };
        if !drained.is_empty() {
            self.agent_removed();
        }
        drained
    }

    /// Remove and return every observer, and refuse new connections.
    pub fn drain_observers(&self) -> Vec<Channel> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.observers.drain().map(|(_, channel)| channel).collect()
    }

    /// Receiver that changes whenever an agent entry is removed.
    #[must_use]
    pub fn subscribe_liveness(&self) -> watch::Receiver<u64> {
        self.liveness.subscribe()
    }

    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.lock().agents.len()
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_replaces_duplicate() {
        let set = ConnectionSet::new();
        let (first, _rx1) = Channel::new();
        let (second, _rx2) = Channel::new();
        let first_id = first.id();

        assert!(set.register_agent("alpha", first).expect("open").is_none());
        let previous = set
            .register_agent("alpha", second.clone())
            .expect("open")
            .expect("previous");
        assert_eq!(previous.id(), first_id);

        assert_eq!(set.agent_count(), 1);
        assert_eq!(set.lookup_agent("alpha").map(|c| c.id()), Some(second.id()));
    }

    #[test]
    fn test_late_unregister_of_replaced_channel_is_ignored() {
        let set = ConnectionSet::new();
        let (old, _rx1) = Channel::new();
        let (new, _rx2) = Channel::new();
        let old_id = old.id();
        set.register_agent("alpha", old).expect("open");
        set.register_agent("alpha", new).expect("open");

        assert!(!set.unregister_agent("alpha", old_id));
        assert_eq!(set.unregister_channel(old_id), None);
        assert!(set.is_live("alpha"));
    }

    #[test]
    fn test_unregister_matching_channel() {
        let set = ConnectionSet::new();
        let (channel, _rx) = Channel::new();
        let id = channel.id();
        set.register_agent("alpha", channel).expect("open");

        assert!(set.unregister_agent("alpha", id));
        assert!(!set.unregister_agent("alpha", id));
        assert!(set.lookup_agent("alpha").is_none());
    }

    #[test]
    fn test_listing_skips_closed_channels() {
        let set = ConnectionSet::new();
        let (alive, _rx1) = Channel::new();
        let (dead, rx2) = Channel::new();
        set.register_agent("alive", alive).expect("open");
        set.register_agent("dead", dead).expect("open");
        drop(rx2);

        let online: Vec<_> = set.list_agent_identifiers().into_iter().collect();
        assert_eq!(online, vec!["alive".to_string()]);
        assert!(!set.is_live("dead"));
        assert!(set.lookup_agent("dead").is_some());
    }

    #[test]
    fn test_rekey_moves_same_channel() {
        let set = ConnectionSet::new();
        let (channel, _rx) = Channel::new();
        let id = channel.id();
        set.register_agent("alpha", channel).expect("open");

        assert!(matches!(
            set.rekey_agent("alpha", "beta", id),
            Rekey::Moved { displaced: None }
        ));
        assert!(set.lookup_agent("alpha").is_none());
        assert_eq!(set.lookup_agent("beta").map(|c| c.id()), Some(id));

        // Teardown follows the channel to its new key.
        assert_eq!(set.unregister_channel(id), Some("beta".to_string()));
    }

    #[test]
    fn test_rekey_displaces_existing_target() {
        let set = ConnectionSet::new();
        let (a, _rx1) = Channel::new();
        let (b, _rx2) = Channel::new();
        let a_id = a.id();
        let b_id = b.id();
        set.register_agent("alpha", a).expect("open");
        set.register_agent("beta", b).expect("open");

        match set.rekey_agent("alpha", "beta", a_id) {
            Rekey::Moved { displaced: Some(d) } => assert_eq!(d.id(), b_id),
            other => panic!("expected displacement, got {other:?}"),
        }
        assert_eq!(set.agent_count(), 1);
        assert_eq!(set.unregister_channel(b_id), None);
    }

    #[test]
    fn test_rekey_superseded() {
        let set = ConnectionSet::new();
        let (old, _rx1) = Channel::new();
        let (new, _rx2) = Channel::new();
        let old_id = old.id();
        set.register_agent("alpha", old).expect("open");
        set.register_agent("alpha", new).expect("open");

        assert!(matches!(
            set.rekey_agent("alpha", "beta", old_id),
            Rekey::Superseded
        ));
        assert!(matches!(
            set.rekey_agent("ghost", "beta", old_id),
            Rekey::Superseded
        ));
        assert!(set.lookup_agent("beta").is_none());
    }

    #[test]
    fn test_observer_snapshot_survives_removal() {
        let set = ConnectionSet::new();
        let (a, _rx1) = Channel::new();
        let (b, _rx2) = Channel::new();
        let a_id = a.id();
        set.add_observer(a).expect("open");
        set.add_observer(b).expect("open");

        let snapshot = set.all_observers();
        assert!(set.remove_observer(a_id));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(set.observer_count(), 1);
    }

    #[test]
    fn test_liveness_generation_bumps_on_removal() {
        let set = ConnectionSet::new();
        let rx = set.subscribe_liveness();
        let (channel, _rx) = Channel::new();
        let id = channel.id();

        set.register_agent("alpha", channel).expect("open");
        assert_eq!(*rx.borrow(), 0);

        set.unregister_agent("alpha", id);
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn test_drain() {
        let set = ConnectionSet::new();
        let (a, _rx1) = Channel::new();
        let (o, _rx2) = Channel::new();
        set.register_agent("alpha", a).expect("open");
        set.add_observer(o).expect("open");

        assert_eq!(set.drain_agents().len(), 1);
        assert_eq!(set.drain_observers().len(), 1);
        assert_eq!(set.agent_count(), 0);
        assert_eq!(set.observer_count(), 0);
    }

    #[test]
    fn test_drained_set_refuses_registration() {
        let set = ConnectionSet::new();
        assert!(set.drain_observers().is_empty());

        let (agent, _rx1) = Channel::new();
        let agent_id = agent.id();
        match set.register_agent("alpha", agent) {
            Err(SetClosed(returned)) => assert_eq!(returned.id(), agent_id),
            Ok(_) => panic!("registration after drain must be refused"),
        }
        let (observer, _rx2) = Channel::new();
        assert!(set.add_observer(observer).is_err());

        assert_eq!(set.agent_count(), 0);
        assert_eq!(set.observer_count(), 0);
        assert!(set.drain_agents().is_empty());
    }

    #[test]
    fn test_channel_liveness_follows_rekey() {
        let set = ConnectionSet::new();
        let (channel, rx) = Channel::new();
        let id = channel.id();
        set.register_agent("alpha", channel).expect("open");

        set.rekey_agent("alpha", "beta", id);
        assert!(!set.is_live("alpha"));
        assert!(set.is_channel_live(id));

        drop(rx);
        assert!(!set.is_channel_live(id));
    }
}
