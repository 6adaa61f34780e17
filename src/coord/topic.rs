/**
 * coord/topic.rs
 *
 * Topic directory of the coordination server
 */

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tokio::sync::mpsc;

use crate::nat_traversal::Peer;

/// Edge-triggered "the topic changed, fetch the list again" notification.
/// Holds at most one pending wake; wakes fired while one is pending are merged.
#[derive(Debug)]
pub struct ChangeSignal {
    rx: mpsc::Receiver<()>,
}

impl ChangeSignal {
    /// Wait for the next change. Returns false once the registration is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }

    /// Consume a pending wake without waiting
    pub fn take_pending(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

#[derive(Debug, Default)]
struct TopicState {
    peers: HashMap<String, Peer>,
    notifications: HashMap<String, mpsc::Sender<()>>,
    peer_list: Option<Arc<Vec<Peer>>>,
}

impl TopicState {
    fn peers_changed(&mut self) {
        self.peer_list = None;

        for tx in self.notifications.values() {
            // full means a wake is already pending
            let _ = tx.try_send(());
        }
    }
}

/// Peers registered under one topic name
#[derive(Debug, Default)]
pub struct Topic {
    state: Mutex<TopicState>,
}

impl Topic {
    fn state(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `name` at `addr`. Returns `None` if the name is taken.
    pub fn try_register(&self, name: &str, addr: SocketAddr) -> Option<ChangeSignal> {
        let mut state = self.state();

        if state.peers.contains_key(name) {
            return None;
        }

        let (tx, rx) = mpsc::channel(1);
        state.peers.insert(name.to_string(), Peer::new(name, addr));
        state.notifications.insert(name.to_string(), tx);
        state.peers_changed();

        Some(ChangeSignal { rx })
    }

    /// Refresh the liveness timestamp of `name`, if still registered.
    /// Members learn about liveness through the list, so nobody is woken.
    pub fn update_last_seen(&self, name: &str) {
        let mut state = self.state();

        if let Some(peer) = state.peers.get_mut(name) {
            peer.last_seen = SystemTime::now();
            state.peer_list = None;
        }
    }

    /// Remove `name` and close its change signal
    pub fn unregister(&self, name: &str) {
        let mut state = self.state();

        state.notifications.remove(name);
        if state.peers.remove(name).is_some() {
            state.peers_changed();
        }
    }

    /// Consistent snapshot of the members, rebuilt only after a change
    pub fn peer_list(&self) -> Arc<Vec<Peer>> {
        let mut state = self.state();

        if let Some(list) = &state.peer_list {
            return list.clone();
        }

        let list = Arc::new(state.peers.values().cloned().collect::<Vec<_>>());
        state.peer_list = Some(list.clone());
        list
    }

    pub fn len(&self) -> usize {
        self.state().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All topics, created on first reference and kept for the process lifetime
#[derive(Debug, Default)]
pub struct Topics {
    topics: Mutex<HashMap<String, Arc<Topic>>>,
}

impl Topics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topic called `name`, created if unknown
    pub fn topic(&self, name: &str) -> Arc<Topic> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Register `peer` in `topic`. Returns the topic handle and the change
    /// signal, or `None` if the name is already taken there.
    pub fn try_register(&self, topic: &str, peer: &str, addr: SocketAddr) -> Option<(Arc<Topic>, ChangeSignal)> {
        let topic = self.topic(topic);
        let signal = topic.try_register(peer, addr)?;
        Some((topic, signal))
    }
}
