//! The sync engine: push on local writes, pull on advertisements, replicators
//! and targeted document sync.
//!
//! The engine runs two long-lived tasks. The inbound task routes responses to
//! waiting requests and spawns a handler for every other message. The event
//! task watches local writes and gossips the new heads to subscribed peers and
//! hands them to every replicator whose scope covers the collection.

use crate::config::SyncConfig;
use crate::error::{NetworkError, Result, SyncError};
use crate::fetch;
use crate::keys;
use crate::network::{Message, NetworkTransport, PeerId, WireBlock};
use crate::peer::{PeerInfo, PeerState, PeerTable};
use crate::replicator::{spawn_worker, PendingPush, Replicator, ReplicatorHandle, ReplicatorScope, ReplicatorStatus};
use crate::topic::{collection_topic, document_topic, SeenCache, Topic};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::DocId;
use tessera_db::{DocumentStore, Event, Subscription};
use tessera_merkle::{Cid, Txn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Pause between rounds of a targeted sync that has not converged yet.
const TARGETED_SYNC_PAUSE: Duration = Duration::from_millis(100);

/// Outcome of a targeted document sync.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Blocks merged.
    pub merged: usize,
    /// Documents that now include every head a responding peer advertised.
    pub synced: Vec<DocId>,
    /// Documents no responding peer holds.
    pub not_found: Vec<DocId>,
}

pub(crate) struct Inner {
    db: Arc<DocumentStore>,
    transport: Arc<dyn NetworkTransport>,
    config: SyncConfig,
    local: PeerId,
    peers: PeerTable,
    topics: RwLock<BTreeSet<String>>,
    seen: Mutex<SeenCache<Cid>>,
    replicators: RwLock<HashMap<PeerId, Replicator>>,
    workers: Mutex<HashMap<PeerId, ReplicatorHandle>>,
    requests: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    next_request: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Peer synchronization and replication for one document store.
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    /// Start the engine on `transport`, restoring persisted replicators and
    /// topic subscriptions. Must be called from within a tokio runtime.
    pub fn start(
        db: Arc<DocumentStore>,
        transport: Arc<dyn NetworkTransport>,
        config: SyncConfig,
    ) -> Result<Self> {
        let inbox = transport.subscribe()?;
        let store = db.datastore().clone();

        let mut topics = BTreeSet::new();
        for (key, _) in store.scan_prefix(keys::P2P_COLLECTIONS.as_bytes())? {
            if let Some(collection) = keys::last_segment(&key) {
                topics.insert(collection_topic(collection));
            }
        }
        for (key, _) in store.scan_prefix(keys::P2P_DOCS.as_bytes())? {
            if let Some((collection, doc_id)) = keys::parse_p2p_doc(&key) {
                topics.insert(document_topic(&collection, &doc_id));
            }
        }

        let mut replicators = HashMap::new();
        for (_, bytes) in store.scan_prefix(keys::REPLICATORS.as_bytes())? {
            let record: Replicator = serde_json::from_slice(&bytes)?;
            replicators.insert(record.peer.clone(), record);
        }

        let local = transport.local_id().clone();
        info!(
            peer = %local,
            topics = topics.len(),
            replicators = replicators.len(),
            "starting sync engine"
        );

        let inner = Arc::new(Inner {
            db: db.clone(),
            transport,
            seen: Mutex::new(SeenCache::new(config.seen_cache_size)),
            config,
            local,
            peers: PeerTable::default(),
            topics: RwLock::new(topics),
            replicators: RwLock::new(replicators),
            workers: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        inner.tasks.spawn(run_inbound(inner.clone(), inbox));
        inner.tasks.spawn(run_events(inner.clone(), db.subscribe()));

        let peers: Vec<PeerId> = inner.replicators.read().keys().cloned().collect();
        for peer in peers {
            let handle = spawn_worker(inner.clone(), peer.clone());
            inner.workers.lock().insert(peer, handle);
        }

        Ok(Self { inner })
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local
    }

    pub fn db(&self) -> &Arc<DocumentStore> {
        &self.inner.db
    }

    /// Stop every task and wait for them to finish.
    pub async fn shutdown(self) {
        info!(peer = %self.inner.local, "stopping sync engine");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    // === Peers ===

    /// Connect to a peer: exchange topic subscriptions, then catch up on the
    /// documents we subscribe to.
    pub async fn connect_peer(&self, peer: &PeerId) -> Result<()> {
        let inner = &self.inner;
        if *peer == inner.local || inner.peers.state(peer).is_connected() {
            return Ok(());
        }

        inner.peers.transition(peer, PeerState::Connecting);
        let hello = Message::Topics {
            topics: inner.local_topics(),
            reply: true,
        };
        if let Err(e) = inner.transport.send(peer, hello).await {
            inner.peers.transition(peer, PeerState::Disconnected);
            return Err(e.into());
        }

        inner.peers.transition(peer, PeerState::Syncing);
        inner.catch_up(peer).await;
        inner.peers.transition(peer, PeerState::Steady);
        info!(peer = %peer, "connected");
        Ok(())
    }

    pub fn disconnect_peer(&self, peer: &PeerId) {
        self.inner.peers.transition(peer, PeerState::Disconnected);
    }

    pub fn peer_state(&self, peer: &PeerId) -> PeerState {
        self.inner.peers.state(peer)
    }

    pub fn peer_info(&self, peer: &PeerId) -> Option<PeerInfo> {
        self.inner.peers.info(peer)
    }

    // === Replicators ===

    /// Add or extend a replicator. Heads of every document in newly covered
    /// collections are pushed to it.
    pub fn set_replicator(&self, peer: PeerId, scope: ReplicatorScope) -> Result<Replicator> {
        let inner = &self.inner;
        if peer == inner.local {
            return Err(SyncError::SelfTargetReplicator);
        }
        let scope = match scope {
            ReplicatorScope::Collections(names) if names.is_empty() => ReplicatorScope::All,
            scope => scope,
        };
        if let ReplicatorScope::Collections(names) = &scope {
            for name in names {
                inner.db.collection(name)?;
            }
        }
        let known = inner.known_collections();

        let (record, added, is_new) = {
            let mut replicators = inner.replicators.write();
            let before = replicators.get(&peer).cloned();
            let mut record = before
                .clone()
                .unwrap_or_else(|| Replicator::new(peer.clone(), scope.clone()));
            record.scope = record.scope.union(&scope);
            let added = record.scope.added_since(before.as_ref().map(|r| &r.scope), &known);

            inner.persist_replicator(&record)?;
            replicators.insert(peer.clone(), record.clone());
            (record, added, before.is_none())
        };

        if is_new {
            let handle = spawn_worker(inner.clone(), peer.clone());
            inner.workers.lock().insert(peer.clone(), handle);
        }
        info!(peer = %peer, scope = ?record.scope, "replicator set");

        for collection in added {
            for doc_id in inner.db.doc_ids(&collection)? {
                inner.push_to_worker(&peer, PendingPush {
                    collection: collection.clone(),
                    doc_id,
                });
            }
        }
        Ok(record)
    }

    /// Remove collections from a replicator, or the whole replicator for
    /// `ReplicatorScope::All`. A replicator left with no collections is removed.
    pub fn delete_replicator(&self, peer: &PeerId, scope: ReplicatorScope) -> Result<()> {
        let inner = &self.inner;
        let known = inner.known_collections();

        let removed = {
            let mut replicators = inner.replicators.write();
            let Some(record) = replicators.get(peer) else {
                return Err(SyncError::ReplicatorNotFound(peer.clone()));
            };
            let remaining = match &scope {
                ReplicatorScope::Collections(names) if !names.is_empty() => {
                    record.scope.without(names, &known)
                }
                _ => ReplicatorScope::Collections(BTreeSet::new()),
            };

            if remaining.is_empty() {
                let mut txn = inner.txn();
                txn.delete(keys::replicator(peer.as_str()));
                txn.commit()?;
                replicators.remove(peer);
                if let Some(handle) = inner.workers.lock().remove(peer) {
                    handle.stop();
                }
                true
            } else {
                let mut updated = record.clone();
                updated.pending.retain(|p| remaining.includes(&p.collection));
                updated.scope = remaining;
                inner.persist_replicator(&updated)?;
                replicators.insert(peer.clone(), updated);
                false
            }
        };

        if removed {
            info!(peer = %peer, "replicator removed");
        }
        Ok(())
    }

    pub fn list_replicators(&self) -> Vec<Replicator> {
        let mut all: Vec<Replicator> = self.inner.replicators.read().values().cloned().collect();
        all.sort_by(|a, b| a.peer.cmp(&b.peer));
        all
    }

    pub fn replicator(&self, peer: &PeerId) -> Option<Replicator> {
        self.inner.replicators.read().get(peer).cloned()
    }

    /// Retry a replicator's pending pushes now.
    pub fn retry_replicator(&self, peer: &PeerId) -> Result<()> {
        match self.inner.workers.lock().get(peer) {
            Some(handle) => {
                handle.retry();
                Ok(())
            }
            None => Err(SyncError::ReplicatorNotFound(peer.clone())),
        }
    }

    // === Topic subscriptions ===

    pub async fn add_p2p_collections(&self, collections: &[&str]) -> Result<()> {
        for name in collections {
            self.inner.db.collection(name)?;
        }
        let mut txn = self.inner.txn();
        for name in collections {
            txn.put(keys::p2p_collection(name), Vec::new());
        }
        txn.commit()?;

        self.inner
            .topics
            .write()
            .extend(collections.iter().map(|c| collection_topic(c)));
        self.inner.announce_topics().await;
        Ok(())
    }

    pub async fn remove_p2p_collections(&self, collections: &[&str]) -> Result<()> {
        let mut txn = self.inner.txn();
        for name in collections {
            txn.delete(keys::p2p_collection(name));
        }
        txn.commit()?;

        {
            let mut topics = self.inner.topics.write();
            for name in collections {
                topics.remove(&collection_topic(name));
            }
        }
        self.inner.announce_topics().await;
        Ok(())
    }

    pub fn p2p_collections(&self) -> Vec<String> {
        self.inner
            .topics
            .read()
            .iter()
            .filter_map(|t| match Topic::parse(t) {
                Some(Topic::Collection(name)) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub async fn add_p2p_documents(&self, collection: &str, doc_ids: &[DocId]) -> Result<()> {
        self.inner.db.collection(collection)?;
        let mut txn = self.inner.txn();
        for doc_id in doc_ids {
            txn.put(keys::p2p_doc(collection, doc_id), Vec::new());
        }
        txn.commit()?;

        self.inner
            .topics
            .write()
            .extend(doc_ids.iter().map(|d| document_topic(collection, d)));
        self.inner.announce_topics().await;
        Ok(())
    }

    pub async fn remove_p2p_documents(&self, collection: &str, doc_ids: &[DocId]) -> Result<()> {
        let mut txn = self.inner.txn();
        for doc_id in doc_ids {
            txn.delete(keys::p2p_doc(collection, doc_id));
        }
        txn.commit()?;

        {
            let mut topics = self.inner.topics.write();
            for doc_id in doc_ids {
                topics.remove(&document_topic(collection, doc_id));
            }
        }
        self.inner.announce_topics().await;
        Ok(())
    }

    pub fn p2p_documents(&self) -> Vec<(String, DocId)> {
        self.inner.p2p_documents()
    }

    // === Targeted sync ===

    /// Pull specific documents now. `None` uses the configured default timeout.
    pub async fn sync_documents(
        &self,
        collection: &str,
        doc_ids: &[DocId],
        timeout: Option<Duration>,
    ) -> Result<SyncReport> {
        self.sync_documents_with_cancel(collection, doc_ids, timeout, CancellationToken::new())
            .await
    }

    /// Like [`sync_documents`](Self::sync_documents), abandoned when `cancel` fires.
    ///
    /// Blocks merged before the deadline or cancellation stay merged.
    pub async fn sync_documents_with_cancel(
        &self,
        collection: &str,
        doc_ids: &[DocId],
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<SyncReport> {
        self.inner.db.collection(collection)?;
        let timeout = timeout.unwrap_or(self.inner.config.default_sync_timeout);
        debug!(collection, docs = doc_ids.len(), ?timeout, "targeted sync");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            _ = self.inner.shutdown.cancelled() => Err(SyncError::Cancelled),
            result = tokio::time::timeout(timeout, self.inner.targeted_sync(collection, doc_ids)) => {
                result.unwrap_or(Err(SyncError::Timeout(timeout)))
            }
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    pub(crate) fn db(&self) -> &DocumentStore {
        &self.db
    }

    pub(crate) fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    fn txn(&self) -> Txn {
        Txn::new(self.db.datastore().clone())
    }

    fn known_collections(&self) -> Vec<String> {
        self.db.collections().into_iter().map(|c| c.name).collect()
    }

    fn local_topics(&self) -> Vec<String> {
        self.topics.read().iter().cloned().collect()
    }

    fn p2p_documents(&self) -> Vec<(String, DocId)> {
        self.topics
            .read()
            .iter()
            .filter_map(|t| match Topic::parse(t) {
                Some(Topic::Document { collection, doc_id }) => Some((collection, doc_id)),
                _ => None,
            })
            .collect()
    }

    fn is_interested(&self, collection: &str, doc_id: &DocId) -> bool {
        let topics = self.topics.read();
        topics.contains(&collection_topic(collection)) || topics.contains(&document_topic(collection, doc_id))
    }

    /// Send a request and wait for the matching response.
    pub(crate) async fn request(
        &self,
        peer: &PeerId,
        make: impl FnOnce(u64) -> Message,
    ) -> std::result::Result<Message, NetworkError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.requests.lock().insert(request_id, tx);

        let result = self.send_and_wait(peer, make(request_id), rx).await;
        self.requests.lock().remove(&request_id);

        match &result {
            Ok(_) => self.peers.mark_reachable(peer),
            Err(e) if e.is_retryable() => {
                self.peers.transition(peer, PeerState::Disconnected);
            }
            Err(_) => {}
        }
        result
    }

    async fn send_and_wait(
        &self,
        peer: &PeerId,
        message: Message,
        rx: oneshot::Receiver<Message>,
    ) -> std::result::Result<Message, NetworkError> {
        self.transport.send(peer, message).await?;
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(NetworkError::Closed),
            Err(_) => Err(NetworkError::Timeout(peer.clone())),
        }
    }

    async fn reply(&self, peer: &PeerId, message: Message) {
        if let Err(e) = self.transport.send(peer, message).await {
            debug!(peer = %peer, error = %e, "failed to send reply");
        }
    }

    /// Tell every connected peer which topics we subscribe to.
    async fn announce_topics(&self) {
        let topics = self.local_topics();
        for peer in self.peers.known() {
            if !self.peers.state(&peer).is_connected() {
                continue;
            }
            let message = Message::Topics {
                topics: topics.clone(),
                reply: false,
            };
            if let Err(e) = self.transport.send(&peer, message).await {
                debug!(peer = %peer, error = %e, "failed to announce topics");
                self.peers.transition(&peer, PeerState::Disconnected);
            }
        }
    }

    /// Pull the documents we subscribe to from a newly connected peer.
    async fn catch_up(&self, peer: &PeerId) {
        let mut by_collection: BTreeMap<String, Vec<DocId>> = BTreeMap::new();
        for (collection, doc_id) in self.p2p_documents() {
            by_collection.entry(collection).or_default().push(doc_id);
        }
        for (collection, doc_ids) in by_collection {
            if let Err(e) = self.sync_round(&collection, &doc_ids, &[peer.clone()]).await {
                debug!(peer = %peer, collection, error = %e, "catch-up incomplete");
            }
        }
    }

    /// Pull with the lead holder marked as syncing for the duration.
    async fn pull_doc(&self, collection: &str, doc_id: &DocId, heads: &[Cid], holders: &[PeerId]) -> Result<usize> {
        let lead = holders.first();
        if let Some(lead) = lead {
            if self.peers.state(lead) == PeerState::Steady {
                self.peers.transition(lead, PeerState::Syncing);
            }
        }
        let result = fetch::pull(self, collection, doc_id, heads, holders).await;
        if let Some(lead) = lead {
            if self.peers.state(lead) == PeerState::Syncing {
                self.peers.transition(lead, PeerState::Steady);
            }
        }
        result
    }

    /// `first`, then every other connected peer.
    fn holders(&self, first: &PeerId) -> Vec<PeerId> {
        let mut holders = vec![first.clone()];
        holders.extend(
            self.peers
                .known()
                .into_iter()
                .filter(|p| p != first && *p != self.local && self.peers.state(p).is_connected()),
        );
        holders
    }

    // === Replicator bookkeeping ===

    fn persist_replicator(&self, record: &Replicator) -> Result<()> {
        let mut txn = self.txn();
        txn.put(keys::replicator(record.peer.as_str()), serde_json::to_vec(record)?);
        txn.commit()?;
        Ok(())
    }

    /// Apply `f` to a replicator record and persist it if `f` reports a change.
    /// Apply a worker's change to its replicator record. Writes from a stopped
    /// worker are dropped; the token is checked under the record lock, which
    /// is also held while a worker is stopped.
    fn update_replicator(
        &self,
        peer: &PeerId,
        worker: &CancellationToken,
        f: impl FnOnce(&mut Replicator) -> bool,
    ) -> bool {
        let mut replicators = self.replicators.write();
        if worker.is_cancelled() {
            return false;
        }
        let Some(record) = replicators.get_mut(peer) else {
            return false;
        };
        if !f(record) {
            return false;
        }
        if let Err(e) = self.persist_replicator(record) {
            warn!(peer = %peer, error = %e, "failed to persist replicator");
        }
        true
    }

    fn push_to_worker(&self, peer: &PeerId, job: PendingPush) {
        if let Some(handle) = self.workers.lock().get(peer) {
            handle.push(job);
        }
    }

    pub(crate) fn replicator_pending(&self, peer: &PeerId) -> Vec<PendingPush> {
        self.replicators
            .read()
            .get(peer)
            .map(|r| r.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn add_pending(&self, peer: &PeerId, worker: &CancellationToken, job: PendingPush) {
        self.update_replicator(peer, worker, |r| r.scope.includes(&job.collection) && r.pending.insert(job));
    }

    pub(crate) fn complete_pending(&self, peer: &PeerId, worker: &CancellationToken, job: &PendingPush) {
        self.update_replicator(peer, worker, |r| r.pending.remove(job));
    }

    pub(crate) fn set_replicator_status(
        &self,
        peer: &PeerId,
        worker: &CancellationToken,
        status: ReplicatorStatus,
    ) -> bool {
        self.update_replicator(peer, worker, |r| r.set_status(status))
    }

    /// Push a document's heads to a replicator and wait until it has merged them.
    pub(crate) async fn push_doc(&self, peer: &PeerId, job: &PendingPush) -> Result<()> {
        let in_scope = self
            .replicators
            .read()
            .get(peer)
            .map(|r| r.scope.includes(&job.collection))
            .unwrap_or(false);
        if !in_scope {
            return Ok(());
        }
        let heads = self.db.heads(&job.doc_id)?;
        if heads.is_empty() {
            return Ok(());
        }

        let response = self
            .request(peer, |request_id| Message::PushLog {
                request_id,
                collection: job.collection.clone(),
                doc_id: job.doc_id.clone(),
                heads,
            })
            .await?;
        match response {
            Message::Ack { .. } => {
                trace!(peer = %peer, doc_id = %job.doc_id, "push acknowledged");
                Ok(())
            }
            Message::Error { reason, retryable, .. } => Err(NetworkError::Remote { reason, retryable }.into()),
            other => Err(NetworkError::UnexpectedResponse(other.kind().to_string()).into()),
        }
    }

    // === Event handling ===

    /// Gossip a local write and queue it for replicators.
    async fn on_local_update(&self, collection: &str, doc_id: &DocId) {
        let heads = match self.db.heads(doc_id) {
            Ok(heads) => heads,
            Err(e) => {
                warn!(doc_id = %doc_id, error = %e, "cannot read heads for push");
                return;
            }
        };

        let topics = [collection_topic(collection), document_topic(collection, doc_id)];
        for peer in self.peers.subscribers(&topics) {
            let message = Message::Heads {
                topic: topics[0].clone(),
                collection: collection.to_string(),
                doc_id: doc_id.clone(),
                heads: heads.clone(),
            };
            if let Err(e) = self.transport.send(&peer, message).await {
                debug!(peer = %peer, error = %e, "gossip failed");
                if e.is_retryable() {
                    self.peers.transition(&peer, PeerState::Disconnected);
                }
            }
        }

        let targets: Vec<PeerId> = self
            .replicators
            .read()
            .values()
            .filter(|r| r.scope.includes(collection))
            .map(|r| r.peer.clone())
            .collect();
        for peer in targets {
            self.push_to_worker(
                &peer,
                PendingPush {
                    collection: collection.to_string(),
                    doc_id: doc_id.clone(),
                },
            );
        }
    }

    fn dispatch(self: &Arc<Self>, from: PeerId, message: Message) {
        if let Some(request_id) = message.response_to() {
            match self.requests.lock().remove(&request_id) {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => trace!(peer = %from, request_id, "late response"),
            }
            return;
        }

        self.peers.mark_reachable(&from);
        let inner = self.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => {}
                result = inner.handle(&from, message) => {
                    if let Err(e) = result {
                        warn!(peer = %from, error = %e, "failed to handle message");
                    }
                }
            }
        });
    }

    async fn handle(&self, from: &PeerId, message: Message) -> Result<()> {
        match message {
            Message::Topics { topics, reply } => {
                let topics: BTreeSet<String> = topics
                    .into_iter()
                    .filter(|t| Topic::parse(t).is_some())
                    .collect();
                self.peers.set_topics(from, topics);
                if reply {
                    let own = Message::Topics {
                        topics: self.local_topics(),
                        reply: false,
                    };
                    self.reply(from, own).await;
                }
                Ok(())
            }
            Message::Heads {
                topic,
                collection,
                doc_id,
                heads,
            } => self.on_heads(from, &topic, &collection, &doc_id, heads).await,
            Message::PushLog {
                request_id,
                collection,
                doc_id,
                heads,
            } => {
                let response = self.on_push(from, request_id, &collection, &doc_id, &heads).await;
                self.reply(from, response).await;
                Ok(())
            }
            Message::FetchRequest {
                request_id,
                collection,
                doc_id,
                want,
                have,
            } => {
                let response = self.serve_fetch(request_id, &collection, &doc_id, &want, &have)?;
                self.reply(from, response).await;
                Ok(())
            }
            Message::HeadsRequest {
                request_id,
                collection,
                doc_ids,
            } => {
                let response = self.serve_heads(request_id, &collection, doc_ids)?;
                self.reply(from, response).await;
                Ok(())
            }
            other => {
                trace!(peer = %from, kind = other.kind(), "ignoring message");
                Ok(())
            }
        }
    }

    async fn on_heads(
        &self,
        from: &PeerId,
        topic: &str,
        collection: &str,
        doc_id: &DocId,
        heads: Vec<Cid>,
    ) -> Result<()> {
        if !self.is_interested(collection, doc_id) || self.db.collection(collection).is_err() {
            trace!(peer = %from, topic, "not subscribed");
            return Ok(());
        }
        let fresh: Vec<Cid> = {
            let mut seen = self.seen.lock();
            heads.into_iter().filter(|c| !seen.contains(c)).collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }

        let merged = self.pull_doc(collection, doc_id, &fresh, &self.holders(from)).await?;
        {
            let mut seen = self.seen.lock();
            for cid in fresh {
                seen.insert(cid);
            }
        }
        debug!(peer = %from, topic, doc_id = %doc_id, merged, "merged advertised heads");
        Ok(())
    }

    async fn on_push(
        &self,
        from: &PeerId,
        request_id: u64,
        collection: &str,
        doc_id: &DocId,
        heads: &[Cid],
    ) -> Message {
        let known = self.db.collection(collection).is_ok();
        if !known || !(self.config.accept_unsolicited_pushes || self.is_interested(collection, doc_id)) {
            return Message::Error {
                request_id,
                reason: format!("collection {} not accepted", collection),
                retryable: false,
            };
        }
        match self.pull_doc(collection, doc_id, heads, &[from.clone()]).await {
            Ok(merged) => {
                debug!(peer = %from, doc_id = %doc_id, merged, "merged replicator push");
                Message::Ack { request_id }
            }
            Err(e) => Message::Error {
                request_id,
                retryable: e.is_retryable(),
                reason: e.to_string(),
            },
        }
    }

    fn serve_fetch(
        &self,
        request_id: u64,
        collection: &str,
        doc_id: &DocId,
        want: &[Cid],
        have: &[Cid],
    ) -> Result<Message> {
        if self.db.collection_of(doc_id)?.as_deref() != Some(collection) {
            return Ok(Message::Error {
                request_id,
                reason: format!("{} is not a document of {}", doc_id, collection),
                retryable: false,
            });
        }
        let (blocks, more) = self.db.blocks_for(want, have, self.config.fetch_batch_size)?;
        let blocks = blocks
            .into_iter()
            .filter(|b| b.doc_id() == doc_id)
            .map(|b| WireBlock {
                cid: b.cid(),
                bytes: b.bytes().to_vec(),
            })
            .collect();
        Ok(Message::FetchResponse {
            request_id,
            blocks,
            more,
        })
    }

    fn serve_heads(&self, request_id: u64, collection: &str, doc_ids: Vec<DocId>) -> Result<Message> {
        let mut heads = Vec::new();
        for doc_id in doc_ids {
            if self.db.collection_of(&doc_id)?.as_deref() != Some(collection) {
                continue;
            }
            let cids = self.db.heads(&doc_id)?;
            if !cids.is_empty() {
                heads.push((doc_id, cids));
            }
        }
        Ok(Message::HeadsResponse { request_id, heads })
    }

    // === Targeted sync ===

    async fn targeted_sync(&self, collection: &str, doc_ids: &[DocId]) -> Result<SyncReport> {
        let mut merged = 0;
        loop {
            let peers: Vec<PeerId> = self.peers.known().into_iter().filter(|p| *p != self.local).collect();
            match self.sync_round(collection, doc_ids, &peers).await {
                Ok(Some(mut report)) => {
                    report.merged += merged;
                    return Ok(report);
                }
                Ok(None) => {}
                Err(RoundFailure { merged: partial }) => merged += partial,
            }
            tokio::time::sleep(TARGETED_SYNC_PAUSE).await;
        }
    }

    /// Ask `peers` for the heads of `doc_ids` and pull what they advertise.
    /// `Ok(None)` means no peer answered.
    async fn sync_round(
        &self,
        collection: &str,
        doc_ids: &[DocId],
        peers: &[PeerId],
    ) -> std::result::Result<Option<SyncReport>, RoundFailure> {
        let asks = peers.iter().map(|peer| async move {
            let answer = self
                .request(peer, |request_id| Message::HeadsRequest {
                    request_id,
                    collection: collection.to_string(),
                    doc_ids: doc_ids.to_vec(),
                })
                .await;
            (peer.clone(), answer)
        });

        let mut responded = false;
        let mut advertised: BTreeMap<DocId, (BTreeSet<Cid>, Vec<PeerId>)> = BTreeMap::new();
        for (peer, answer) in futures::future::join_all(asks).await {
            match answer {
                Ok(Message::HeadsResponse { heads, .. }) => {
                    responded = true;
                    for (doc_id, cids) in heads {
                        if !doc_ids.contains(&doc_id) {
                            continue;
                        }
                        let entry = advertised.entry(doc_id).or_default();
                        entry.0.extend(cids);
                        entry.1.push(peer.clone());
                    }
                }
                Ok(other) => debug!(peer = %peer, kind = other.kind(), "unexpected heads answer"),
                Err(e) => debug!(peer = %peer, error = %e, "heads request failed"),
            }
        }
        if !responded {
            return Ok(None);
        }

        let pulls = doc_ids.iter().map(|doc_id| {
            let target = advertised.get(doc_id);
            async move {
                let Some((heads, holders)) = target else {
                    return (doc_id, None);
                };
                let heads: Vec<Cid> = heads.iter().copied().collect();
                (doc_id, Some(self.pull_doc(collection, doc_id, &heads, holders).await))
            }
        });

        let mut report = SyncReport::default();
        let mut failed = false;
        for (doc_id, result) in futures::future::join_all(pulls).await {
            match result {
                None => report.not_found.push(doc_id.clone()),
                Some(Ok(count)) => {
                    report.merged += count;
                    report.synced.push(doc_id.clone());
                }
                Some(Err(e)) => {
                    warn!(doc_id = %doc_id, error = %e, "targeted sync pull failed");
                    failed = true;
                }
            }
        }
        if failed {
            return Err(RoundFailure { merged: report.merged });
        }
        Ok(Some(report))
    }
}

/// A round that merged `merged` blocks but left some document incomplete.
struct RoundFailure {
    merged: usize,
}

impl std::fmt::Display for RoundFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "round incomplete after merging {} blocks", self.merged)
    }
}

async fn run_inbound(inner: Arc<Inner>, mut inbox: mpsc::Receiver<(PeerId, Message)>) {
    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            next = inbox.recv() => match next {
                Some((from, message)) => inner.dispatch(from, message),
                None => break,
            },
        }
    }
    debug!(peer = %inner.local, "inbound loop stopped");
}

async fn run_events(inner: Arc<Inner>, mut events: Subscription) {
    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(Event::Update { collection, doc_id, .. }) => {
                    inner.on_local_update(&collection, &doc_id).await;
                }
                Some(_) => {}
                None => break,
            },
        }
    }
    if events.dropped() > 0 {
        warn!(dropped = events.dropped(), "sync engine missed local events");
    }
}
