//! Session registry
//!
//! Maps a peer address to the ack cell of its active transfer. The dispatcher
//! inserts and delivers acks, sessions remove themselves when they terminate.
//! Every access holds the lock only for the single map operation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

/// Receiving half of a session's ack cell. Holds the newest delivered block number.
pub type AckReceiver = watch::Receiver<Option<u16>>;

struct Entry {
    generation: u64,
    acks: watch::Sender<Option<u16>>,
}

/// Ticket a session uses to remove its own registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub peer: SocketAddr,
    generation: u64,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<SocketAddr, Entry>>>,
    next_generation: Arc<AtomicU64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, Entry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session for `peer`, replacing any session already tracked for it.
    ///
    /// The replaced session keeps running but no longer receives acks.
    pub fn insert(&self, peer: SocketAddr) -> (Registration, AckReceiver) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (acks, receiver) = watch::channel(None);

        if self.lock().insert(peer, Entry { generation, acks }).is_some() {
            tracing::debug!("New request from {} replaces its active transfer", peer);
        }

        (Registration { peer, generation }, receiver)
    }

    /// Hand an ack to the session tracked for `peer`.
    ///
    /// Overwrites any ack the session has not looked at yet. Returns false if
    /// no session is tracked for the peer.
    pub fn deliver_ack(&self, peer: SocketAddr, block: u16) -> bool {
        match self.lock().get(&peer) {
            Some(entry) => {
                entry.acks.send_replace(Some(block));
                true
            }
            None => false,
        }
    }

    /// Remove the entry created by `registration`, unless a newer session for
    /// the same peer has replaced it.
    pub fn remove(&self, registration: Registration) {
        let mut sessions = self.lock();
        if sessions
            .get(&registration.peer)
            .is_some_and(|entry| entry.generation == registration.generation)
        {
            sessions.remove(&registration.peer);
        }
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.lock().contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
