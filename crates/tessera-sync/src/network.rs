//! Network transport abstractions for peer synchronization.

use crate::error::NetworkError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tessera_core::DocId;
use tessera_merkle::Cid;
use tokio::sync::mpsc;
use tracing::trace;

/// Inbox capacity of each in-memory transport.
const INBOX_CAPACITY: usize = 1024;

/// Unique identifier for a peer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A block on the wire: the claimed identifier and the raw envelope bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireBlock {
    pub cid: Cid,
    pub bytes: Vec<u8>,
}

/// Messages exchanged between peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Full set of topics the sender subscribes to.
    Topics { topics: Vec<String>, reply: bool },
    /// Gossip of a document's new heads on a topic.
    Heads {
        topic: String,
        collection: String,
        doc_id: DocId,
        heads: Vec<Cid>,
    },
    /// Direct push from a replicator. Answered with `Ack` once merged.
    PushLog {
        request_id: u64,
        collection: String,
        doc_id: DocId,
        heads: Vec<Cid>,
    },
    /// Ask for blocks reachable from `want` that are not reachable from `have`.
    FetchRequest {
        request_id: u64,
        collection: String,
        doc_id: DocId,
        want: Vec<Cid>,
        have: Vec<Cid>,
    },
    FetchResponse {
        request_id: u64,
        blocks: Vec<WireBlock>,
        /// Wanted blocks that did not fit in this response.
        more: Vec<Cid>,
    },
    /// Ask for the current heads of specific documents.
    HeadsRequest {
        request_id: u64,
        collection: String,
        doc_ids: Vec<DocId>,
    },
    HeadsResponse {
        request_id: u64,
        heads: Vec<(DocId, Vec<Cid>)>,
    },
    Ack { request_id: u64 },
    Error {
        request_id: u64,
        reason: String,
        retryable: bool,
    },
}

impl Message {
    /// Identifier of the request this message answers, if it is a response.
    pub fn response_to(&self) -> Option<u64> {
        match self {
            Message::FetchResponse { request_id, .. }
            | Message::HeadsResponse { request_id, .. }
            | Message::Ack { request_id }
            | Message::Error { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Topics { .. } => "topics",
            Message::Heads { .. } => "heads",
            Message::PushLog { .. } => "push_log",
            Message::FetchRequest { .. } => "fetch_request",
            Message::FetchResponse { .. } => "fetch_response",
            Message::HeadsRequest { .. } => "heads_request",
            Message::HeadsResponse { .. } => "heads_response",
            Message::Ack { .. } => "ack",
            Message::Error { .. } => "error",
        }
    }

    /// Collection the message concerns, for messages scoped to one.
    pub fn collection(&self) -> Option<&str> {
        match self {
            Message::Heads { collection, .. }
            | Message::PushLog { collection, .. }
            | Message::FetchRequest { collection, .. }
            | Message::HeadsRequest { collection, .. } => Some(collection),
            _ => None,
        }
    }
}

/// Abstract network transport trait.
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    fn local_id(&self) -> &PeerId;

    /// Send a message to a specific peer.
    async fn send(&self, peer_id: &PeerId, message: Message) -> Result<(), NetworkError>;

    /// Take the stream of incoming messages. Only the first call succeeds.
    fn subscribe(&self) -> Result<mpsc::Receiver<(PeerId, Message)>, NetworkError>;
}

/// One delivered message, as recorded by [`MemoryNetwork::traffic`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub from: PeerId,
    pub to: PeerId,
    pub kind: &'static str,
    pub collection: Option<String>,
}

#[derive(Default)]
struct NetworkState {
    inboxes: RwLock<HashMap<PeerId, mpsc::Sender<(PeerId, Message)>>>,
    unreachable: RwLock<HashSet<PeerId>>,
    corrupting: RwLock<HashSet<PeerId>>,
    /// Messages still delivered per (sender, kind) before the rest are lost.
    losing: Mutex<HashMap<(PeerId, &'static str), usize>>,
    traffic: Mutex<Vec<Envelope>>,
}

/// An in-memory network of transports, for tests and simulation.
///
/// Peers can be made unreachable, a peer can be made to corrupt the blocks
/// it serves, and messages of one kind from a peer can be silently lost.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<NetworkState>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport for `peer_id`, replacing any previous one.
    pub fn transport(&self, peer_id: PeerId) -> Arc<MemoryTransport> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.state.inboxes.write().insert(peer_id.clone(), tx);
        Arc::new(MemoryTransport {
            local_id: peer_id,
            state: self.state.clone(),
            inbox: Mutex::new(Some(rx)),
        })
    }

    /// Cut or restore every link to and from `peer_id`.
    pub fn set_reachable(&self, peer_id: &PeerId, reachable: bool) {
        let mut unreachable = self.state.unreachable.write();
        if reachable {
            unreachable.remove(peer_id);
        } else {
            unreachable.insert(peer_id.clone());
        }
    }

    /// Make every block served by `peer_id` fail verification.
    pub fn corrupt_blocks_from(&self, peer_id: &PeerId) {
        self.state.corrupting.write().insert(peer_id.clone());
    }

    /// Deliver the next `delivered` messages of `kind` sent by `peer_id` and
    /// silently lose every one after that. The sender sees no error.
    pub fn lose_after(&self, peer_id: &PeerId, kind: &'static str, delivered: usize) {
        self.state.losing.lock().insert((peer_id.clone(), kind), delivered);
    }

    /// Every message delivered so far.
    pub fn traffic(&self) -> Vec<Envelope> {
        self.state.traffic.lock().clone()
    }
}

/// In-memory transport attached to a [`MemoryNetwork`].
pub struct MemoryTransport {
    local_id: PeerId,
    state: Arc<NetworkState>,
    inbox: Mutex<Option<mpsc::Receiver<(PeerId, Message)>>>,
}

#[async_trait]
impl NetworkTransport for MemoryTransport {
    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    async fn send(&self, peer_id: &PeerId, mut message: Message) -> Result<(), NetworkError> {
        {
            let unreachable = self.state.unreachable.read();
            if unreachable.contains(peer_id) || unreachable.contains(&self.local_id) {
                return Err(NetworkError::Unreachable(peer_id.clone()));
            }
        }
        let tx = self
            .state
            .inboxes
            .read()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| NetworkError::PeerNotFound(peer_id.clone()))?;

        let lost = {
            let mut losing = self.state.losing.lock();
            match losing.get_mut(&(self.local_id.clone(), message.kind())) {
                Some(0) => true,
                Some(budget) => {
                    *budget -= 1;
                    false
                }
                None => false,
            }
        };
        if lost {
            trace!(from = %self.local_id, to = %peer_id, kind = message.kind(), "message lost");
            return Ok(());
        }

        if self.state.corrupting.read().contains(&self.local_id) {
            if let Message::FetchResponse { blocks, .. } = &mut message {
                for block in blocks.iter_mut() {
                    if let Some(last) = block.bytes.last_mut() {
                        *last ^= 0xff;
                    }
                }
            }
        }

        self.state.traffic.lock().push(Envelope {
            from: self.local_id.clone(),
            to: peer_id.clone(),
            kind: message.kind(),
            collection: message.collection().map(str::to_string),
        });
        trace!(from = %self.local_id, to = %peer_id, kind = message.kind(), "send");

        tx.send((self.local_id.clone(), message))
            .await
            .map_err(|_| NetworkError::Closed)
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<(PeerId, Message)>, NetworkError> {
        self.inbox.lock().take().ok_or(NetworkError::AlreadySubscribed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(id: u64) -> Message {
        Message::Ack { request_id: id }
    }

    #[tokio::test]
    async fn test_memory_transport_delivers() {
        let network = MemoryNetwork::new();
        let a = network.transport(PeerId::new("peer-a"));
        let b = network.transport(PeerId::new("peer-b"));
        let mut inbox = b.subscribe().unwrap();

        a.send(b.local_id(), ack(1)).await.unwrap();
        let (from, message) = inbox.recv().await.unwrap();
        assert_eq!(from, PeerId::new("peer-a"));
        assert_eq!(message.response_to(), Some(1));
        assert_eq!(network.traffic().len(), 1);
        assert!(matches!(b.subscribe(), Err(NetworkError::AlreadySubscribed)));
    }

    #[tokio::test]
    async fn test_unreachable_and_unknown_peers() {
        let network = MemoryNetwork::new();
        let a = network.transport(PeerId::new("peer-a"));
        let b = network.transport(PeerId::new("peer-b"));
        let _inbox = b.subscribe().unwrap();

        network.set_reachable(b.local_id(), false);
        let err = a.send(b.local_id(), ack(1)).await.unwrap_err();
        assert_eq!(err, NetworkError::Unreachable(PeerId::new("peer-b")));
        assert!(err.is_retryable());

        network.set_reachable(b.local_id(), true);
        assert!(a.send(b.local_id(), ack(2)).await.is_ok());
        assert!(matches!(
            a.send(&PeerId::new("peer-z"), ack(3)).await,
            Err(NetworkError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupting_peer_flips_block_bytes() {
        let network = MemoryNetwork::new();
        let a = network.transport(PeerId::new("peer-a"));
        let b = network.transport(PeerId::new("peer-b"));
        let mut inbox = b.subscribe().unwrap();
        network.corrupt_blocks_from(a.local_id());

        let block = WireBlock {
            cid: Cid::of(b"x"),
            bytes: b"x".to_vec(),
        };
        let response = Message::FetchResponse {
            request_id: 1,
            blocks: vec![block.clone()],
            more: vec![],
        };
        a.send(b.local_id(), response).await.unwrap();

        match inbox.recv().await.unwrap().1 {
            Message::FetchResponse { blocks, .. } => assert_ne!(blocks[0].bytes, block.bytes),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lost_messages_are_not_delivered() {
        let network = MemoryNetwork::new();
        let a = network.transport(PeerId::new("peer-a"));
        let b = network.transport(PeerId::new("peer-b"));
        let mut inbox = b.subscribe().unwrap();
        network.lose_after(a.local_id(), "ack", 1);

        a.send(b.local_id(), ack(1)).await.unwrap();
        a.send(b.local_id(), ack(2)).await.unwrap();
        a.send(
            b.local_id(),
            Message::Error {
                request_id: 3,
                reason: "x".into(),
                retryable: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(inbox.recv().await.unwrap().1.response_to(), Some(1));
        assert_eq!(inbox.recv().await.unwrap().1.response_to(), Some(3));
        assert!(inbox.try_recv().is_err());
        assert_eq!(network.traffic().len(), 2);
    }
}
