//! Per-peer connection state.

use crate::network::PeerId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// Connection state of a remote peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Syncing,
    Steady,
}

impl PeerState {
    /// Whether `self -> to` is a legal transition.
    pub fn can_transition(self, to: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Syncing)
                | (Syncing, Steady)
                | (Steady, Syncing)
                | (Connecting | Syncing | Steady, Disconnected)
        )
    }

    pub fn is_connected(self) -> bool {
        self != PeerState::Disconnected
    }
}

/// Snapshot of what we know about a peer.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub state: PeerState,
    pub since: DateTime<Utc>,
    /// Topics the peer told us it subscribes to.
    pub topics: BTreeSet<String>,
}

#[derive(Default)]
pub(crate) struct PeerTable {
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
}

impl PeerTable {
    pub(crate) fn state(&self, peer: &PeerId) -> PeerState {
        self.peers
            .read()
            .get(peer)
            .map(|p| p.state)
            .unwrap_or(PeerState::Disconnected)
    }

    /// Apply a transition. Illegal transitions are logged and ignored.
    pub(crate) fn transition(&self, peer: &PeerId, to: PeerState) -> bool {
        let mut peers = self.peers.write();
        let info = peers.entry(peer.clone()).or_insert_with(|| PeerInfo {
            id: peer.clone(),
            state: PeerState::Disconnected,
            since: Utc::now(),
            topics: BTreeSet::new(),
        });
        if info.state == to {
            return true;
        }
        if !info.state.can_transition(to) {
            warn!(peer = %peer, from = ?info.state, to = ?to, "ignoring illegal peer transition");
            return false;
        }
        debug!(peer = %peer, from = ?info.state, to = ?to, "peer state");
        info.state = to;
        info.since = Utc::now();
        true
    }

    /// Walk a peer that just talked to us up to `Steady`.
    pub(crate) fn mark_reachable(&self, peer: &PeerId) {
        match self.state(peer) {
            PeerState::Disconnected => {
                self.transition(peer, PeerState::Connecting);
                self.transition(peer, PeerState::Syncing);
                self.transition(peer, PeerState::Steady);
            }
            PeerState::Connecting => {
                self.transition(peer, PeerState::Syncing);
                self.transition(peer, PeerState::Steady);
            }
            PeerState::Syncing | PeerState::Steady => {}
        }
    }

    pub(crate) fn set_topics(&self, peer: &PeerId, topics: BTreeSet<String>) {
        if let Some(info) = self.peers.write().get_mut(peer) {
            info.topics = topics;
        }
    }

    /// Connected peers subscribed to any of `topics`.
    pub(crate) fn subscribers(&self, topics: &[String]) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .read()
            .values()
            .filter(|p| p.state.is_connected() && topics.iter().any(|t| p.topics.contains(t)))
            .map(|p| p.id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Every peer we have heard of, connected ones first.
    pub(crate) fn known(&self) -> Vec<PeerId> {
        let mut peers: Vec<(bool, PeerId)> = self
            .peers
            .read()
            .values()
            .map(|p| (!p.state.is_connected(), p.id.clone()))
            .collect();
        peers.sort();
        peers.into_iter().map(|(_, id)| id).collect()
    }

    pub(crate) fn info(&self, peer: &PeerId) -> Option<PeerInfo> {
        self.peers.read().get(peer).cloned()
    }
}
