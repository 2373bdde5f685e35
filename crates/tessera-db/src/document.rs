//! Document composer: collections, local writes, remote merges and reads.
//!
//! Every write touches one document inside one transaction while holding that
//! document's lock. A local write produces one block per touched field and a
//! composite block linking them; the composite heads are the document's heads.

use crate::collection::{CollectionDescription, FieldKind};
use crate::config::DbConfig;
use crate::error::{DbError, Result};
use crate::events::{Event, EventBroker, Subscription};
use crate::keys;
use crate::locks::DocLocks;
use crate::merge::{load_state, FieldRegister, FieldState};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tessera_core::{DocId, FieldValue, Fields, COMPOSITE_FIELD};
use tessera_delta::{DeltaOp, DocStatus};
use tessera_merkle::{
    pending_blocks, walker, Block, BlockStore, Cid, DagLink, Datastore, HeadSet, MemoryDatastore,
    MerkleClock, ProcessOutcome, Txn,
};
use tracing::{debug, info, warn};

/// Result of merging a batch of remote blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Newly stored blocks, parents first.
    pub stored: Vec<Cid>,
    /// Newly stored blocks parked with an unknown delta version.
    pub pending: Vec<Cid>,
    /// Set when the batch could not be merged; holds every block in it.
    pub blocked: Vec<Cid>,
    /// Parents outside the batch that must be fetched first.
    pub missing: Vec<Cid>,
}

impl BatchOutcome {
    pub fn is_blocked(&self) -> bool {
        !self.blocked.is_empty()
    }

    /// Blocks that made it into the store.
    pub fn merged(&self) -> usize {
        self.stored.len() + self.pending.len()
    }
}

/// A materialized document.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub doc_id: DocId,
    pub collection: String,
    pub status: DocStatus,
    /// Resolved values of the fields in the local schema.
    pub fields: Fields,
    /// Composite heads.
    pub heads: Vec<Cid>,
    pub field_heads: BTreeMap<String, Vec<Cid>>,
}

impl Document {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn is_deleted(&self) -> bool {
        self.status == DocStatus::Deleted
    }

    /// Flattened key/value form used by export tooling.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(
            "_docID".to_string(),
            serde_json::Value::String(self.doc_id.to_string()),
        );
        for (name, value) in &self.fields {
            map.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(map)
    }
}

/// The local document store.
pub struct DocumentStore {
    store: Arc<dyn Datastore>,
    collections: RwLock<HashMap<String, CollectionDescription>>,
    locks: DocLocks,
    broker: Arc<EventBroker>,
}

impl DocumentStore {
    /// Open a store over `store`, loading persisted collections.
    pub fn open(store: Arc<dyn Datastore>, config: DbConfig) -> Result<Self> {
        let mut collections = HashMap::new();
        for (key, bytes) in store.scan_prefix(keys::COLLECTIONS.as_bytes())? {
            let desc: CollectionDescription = serde_json::from_slice(&bytes)
                .map_err(|e| tessera_merkle::StoreError::corrupt(&key, e))?;
            collections.insert(desc.name.clone(), desc);
        }
        debug!(collections = collections.len(), "opened document store");

        Ok(Self {
            store,
            collections: RwLock::new(collections),
            locks: DocLocks::new(config.lock_table_prune_threshold),
            broker: Arc::new(EventBroker::new(config.broker)),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryDatastore::new()),
            collections: RwLock::new(HashMap::new()),
            locks: DocLocks::new(DbConfig::default().lock_table_prune_threshold),
            broker: Arc::new(EventBroker::default()),
        }
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBroker> {
        &self.broker
    }

    pub fn subscribe(&self) -> Subscription {
        self.broker.subscribe()
    }

    fn txn(&self) -> Txn {
        Txn::new(self.store.clone())
    }

    // === Collections ===

    /// Register a collection. Re-adding an identical definition is a no-op.
    pub fn create_collection(&self, desc: CollectionDescription) -> Result<CollectionDescription> {
        desc.validate()?;
        let mut collections = self.collections.write();
        if let Some(existing) = collections.get(&desc.name) {
            if *existing == desc {
                return Ok(desc);
            }
            return Err(DbError::CollectionExists(desc.name));
        }

        let mut txn = self.txn();
        txn.put(keys::collection(&desc.name), serde_json::to_vec(&desc)?);
        txn.commit()?;

        info!(collection = %desc.name, schema_version = %desc.schema_version_id, "created collection");
        collections.insert(desc.name.clone(), desc.clone());
        Ok(desc)
    }

    pub fn collection(&self, name: &str) -> Result<CollectionDescription> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))
    }

    pub fn collections(&self) -> Vec<CollectionDescription> {
        let mut all: Vec<_> = self.collections.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    // === Local writes ===

    /// Create a document. Its id is derived from the collection and `fields`.
    pub fn create(&self, collection: &str, fields: Fields) -> Result<DocId> {
        let desc = self.collection(collection)?;
        let ops = initial_ops(&desc, fields.clone())?;
        let doc_id = DocId::derive(collection, &fields);

        let lock = self.locks.get(&doc_id);
        let _guard = lock.lock();
        let mut txn = self.txn();
        if txn.has(&keys::doc_collection(&doc_id))? {
            return Err(DbError::DocumentExists(doc_id));
        }

        let head = self.write_ops(&mut txn, &desc, &doc_id, ops, DocStatus::Active)?;
        txn.commit()?;
        self.publish_update(collection, &doc_id, &head);
        Ok(doc_id)
    }

    /// Overwrite several register fields (or add to counters) in one composite write.
    pub fn update(&self, collection: &str, doc_id: &DocId, fields: Fields) -> Result<Cid> {
        let desc = self.collection(collection)?;
        let mut ops = Vec::with_capacity(fields.len());
        for (field, value) in fields {
            match desc.require_field(&field)? {
                FieldKind::Register => {
                    value.validate()?;
                    ops.push((field, DeltaOp::Set(value)));
                }
                FieldKind::Counter => {
                    let amount = counter_amount(&field, &value)?;
                    ops.push((field, DeltaOp::Increment(amount)));
                }
            }
        }
        self.apply_local(&desc, doc_id, ops, DocStatus::Active)
    }

    pub fn set(&self, collection: &str, doc_id: &DocId, field: &str, value: FieldValue) -> Result<Cid> {
        let desc = self.collection(collection)?;
        expect_kind(&desc, field, FieldKind::Register)?;
        value.validate()?;
        self.apply_local(&desc, doc_id, vec![(field.to_string(), DeltaOp::Set(value))], DocStatus::Active)
    }

    pub fn increment(&self, collection: &str, doc_id: &DocId, field: &str, amount: i64) -> Result<Cid> {
        let desc = self.collection(collection)?;
        expect_kind(&desc, field, FieldKind::Counter)?;
        self.apply_local(&desc, doc_id, vec![(field.to_string(), DeltaOp::Increment(amount))], DocStatus::Active)
    }

    /// Tombstone a register field.
    pub fn delete_field(&self, collection: &str, doc_id: &DocId, field: &str) -> Result<Cid> {
        let desc = self.collection(collection)?;
        expect_kind(&desc, field, FieldKind::Register)?;
        self.apply_local(&desc, doc_id, vec![(field.to_string(), DeltaOp::Tombstone)], DocStatus::Active)
    }

    /// Logically delete a document. History stays in the DAG.
    pub fn delete(&self, collection: &str, doc_id: &DocId) -> Result<Cid> {
        let desc = self.collection(collection)?;
        self.apply_local(&desc, doc_id, Vec::new(), DocStatus::Deleted)
    }

    fn apply_local(
        &self,
        desc: &CollectionDescription,
        doc_id: &DocId,
        ops: Vec<(String, DeltaOp)>,
        status: DocStatus,
    ) -> Result<Cid> {
        let lock = self.locks.get(doc_id);
        let _guard = lock.lock();
        let mut txn = self.txn();
        self.check_writable(&txn, &desc.name, doc_id)?;

        let head = self.write_ops(&mut txn, desc, doc_id, ops, status)?;
        txn.commit()?;
        self.publish_update(&desc.name, doc_id, &head);
        Ok(head.cid())
    }

    /// One field block per op, then the composite block linking them.
    fn write_ops(
        &self,
        txn: &mut Txn,
        desc: &CollectionDescription,
        doc_id: &DocId,
        ops: Vec<(String, DeltaOp)>,
        status: DocStatus,
    ) -> Result<Block> {
        let schema_version = Some(desc.schema_version_id.clone());
        let mut links = Vec::with_capacity(ops.len());

        for (field, op) in ops {
            let reg = FieldRegister::new(doc_id, &field, desc.field_kind(&field));
            let clock = MerkleClock::new(doc_id.clone(), field.as_str(), &reg);
            let block = clock.add_delta(txn, op, schema_version.clone(), Vec::new())?;
            links.push(DagLink::new(field.as_str(), block.cid()));
        }

        let reg = FieldRegister::new(doc_id, COMPOSITE_FIELD, None);
        let clock = MerkleClock::new(doc_id.clone(), COMPOSITE_FIELD, &reg);
        let head = clock.add_delta(txn, DeltaOp::Composite(status), schema_version, links)?;

        txn.put(keys::doc_member(&desc.name, doc_id), Vec::new());
        txn.put(keys::doc_collection(doc_id), desc.name.as_bytes().to_vec());
        Ok(head)
    }

    fn check_writable(&self, txn: &Txn, collection: &str, doc_id: &DocId) -> Result<()> {
        match self.collection_in(txn, doc_id)? {
            None => Err(DbError::DocumentNotFound(doc_id.clone())),
            Some(actual) if actual != collection => Err(DbError::WrongCollection {
                doc_id: doc_id.clone(),
                requested: collection.to_string(),
                actual,
            }),
            Some(_) => {
                let status = load_state(txn, doc_id, COMPOSITE_FIELD)?.and_then(|s| s.status());
                if status == Some(DocStatus::Deleted) {
                    return Err(DbError::DocumentDeleted(doc_id.clone()));
                }
                Ok(())
            }
        }
    }

    fn publish_update(&self, collection: &str, doc_id: &DocId, head: &Block) {
        debug!(collection, doc_id = %doc_id, cid = %head.cid().short(), "local write committed");
        self.broker.publish(Event::Update {
            collection: collection.to_string(),
            doc_id: doc_id.clone(),
            cid: head.cid(),
            priority: head.height(),
        });
    }

    // === Reads ===

    /// Materialize a live document.
    pub fn get(&self, collection: &str, doc_id: &DocId) -> Result<Document> {
        let doc = self.get_with_deleted(collection, doc_id)?;
        if doc.is_deleted() {
            return Err(DbError::DocumentDeleted(doc_id.clone()));
        }
        Ok(doc)
    }

    /// Materialize a document even if it was deleted.
    pub fn get_with_deleted(&self, collection: &str, doc_id: &DocId) -> Result<Document> {
        let desc = self.collection(collection)?;

        // Holding the document lock keeps values and heads from one commit
        let lock = self.locks.get(doc_id);
        let _guard = lock.lock();
        let txn = self.txn();

        match self.collection_in(&txn, doc_id)? {
            None => return Err(DbError::DocumentNotFound(doc_id.clone())),
            Some(actual) if actual != collection => {
                return Err(DbError::WrongCollection {
                    doc_id: doc_id.clone(),
                    requested: collection.to_string(),
                    actual,
                })
            }
            Some(_) => {}
        }

        let mut status = DocStatus::Active;
        let mut fields = Fields::new();
        for (key, bytes) in txn.scan_prefix(&keys::values_prefix(doc_id))? {
            let Some(field) = keys::last_segment(&key) else {
                continue;
            };
            let state: FieldState = serde_json::from_slice(&bytes)
                .map_err(|e| tessera_merkle::StoreError::corrupt(&key, e))?;
            if field == COMPOSITE_FIELD {
                status = state.status().unwrap_or(DocStatus::Active);
            } else if desc.field_kind(field).is_some() {
                if let Some(value) = state.resolved() {
                    fields.insert(field.to_string(), value);
                }
            }
        }

        let heads = HeadSet::new(doc_id.clone(), COMPOSITE_FIELD).cids(&txn)?;
        let mut field_heads = BTreeMap::new();
        for field in desc.fields.keys() {
            let cids = HeadSet::new(doc_id.clone(), field.as_str()).cids(&txn)?;
            if !cids.is_empty() {
                field_heads.insert(field.clone(), cids);
            }
        }

        Ok(Document {
            doc_id: doc_id.clone(),
            collection: collection.to_string(),
            status,
            fields,
            heads,
            field_heads,
        })
    }

    /// Every document known in `collection`, deleted ones included.
    pub fn doc_ids(&self, collection: &str) -> Result<Vec<DocId>> {
        self.collection(collection)?;
        let txn = self.txn();
        Ok(txn
            .scan_prefix(&keys::docs_prefix(collection))?
            .iter()
            .filter_map(|(key, _)| keys::last_segment(key).and_then(|s| DocId::parse(s).ok()))
            .collect())
    }

    pub fn collection_of(&self, doc_id: &DocId) -> Result<Option<String>> {
        self.collection_in(&self.txn(), doc_id)
    }

    fn collection_in(&self, txn: &Txn, doc_id: &DocId) -> Result<Option<String>> {
        Ok(txn
            .get(&keys::doc_collection(doc_id))?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Composite heads of a document, advertised to peers.
    pub fn heads(&self, doc_id: &DocId) -> Result<Vec<Cid>> {
        Ok(HeadSet::new(doc_id.clone(), COMPOSITE_FIELD).cids(&self.txn())?)
    }

    pub fn field_heads(&self, doc_id: &DocId, field: &str) -> Result<Vec<Cid>> {
        Ok(HeadSet::new(doc_id.clone(), field).cids(&self.txn())?)
    }

    pub fn get_block(&self, cid: &Cid) -> Result<Option<Block>> {
        Ok(self.txn().get_block(cid)?)
    }

    pub fn has_block(&self, cid: &Cid) -> Result<bool> {
        Ok(self.txn().has_block(cid)?)
    }

    /// Blocks reachable from `want` that a peer holding `have` lacks.
    pub fn blocks_for(&self, want: &[Cid], have: &[Cid], limit: usize) -> Result<(Vec<Block>, Vec<Cid>)> {
        Ok(walker::collect_missing(&self.txn(), want, have, limit)?)
    }

    // === Remote merges ===

    /// Merge a block received from a peer for `collection`.
    ///
    /// Returns the missing parents instead of merging if the block's history
    /// is incomplete. Nothing is committed unless the whole merge succeeds.
    pub fn process_remote_block(&self, collection: &str, block: &Block) -> Result<ProcessOutcome> {
        let desc = self.collection(collection)?;
        let doc_id = block.doc_id().clone();

        let outcome = {
            let lock = self.locks.get(&doc_id);
            let _guard = lock.lock();
            let mut txn = self.txn();

            self.check_routing(&txn, collection, &doc_id)?;
            let outcome = merge_block(&mut txn, &desc, block)?;
            if outcome.stored {
                txn.put(keys::doc_member(collection, &doc_id), Vec::new());
                txn.put(keys::doc_collection(&doc_id), collection.as_bytes().to_vec());
            }
            txn.commit()?;
            outcome
        };

        if outcome.pending {
            self.broker.publish(Event::BlockPending {
                doc_id,
                cid: block.cid(),
            });
        } else if outcome.stored {
            self.broker.publish(Event::Merged {
                collection: collection.to_string(),
                doc_id,
                cid: block.cid(),
            });
        }
        Ok(outcome)
    }

    /// Merge a set of remote blocks for one document as a single update.
    ///
    /// A composite block and the field blocks it links are one update; readers
    /// see either none of it or all of it. If any block's history is incomplete
    /// nothing is committed and the outcome lists the parents outside the batch
    /// that must be fetched first.
    pub fn process_remote_batch(&self, collection: &str, blocks: &[Block]) -> Result<BatchOutcome> {
        let Some(first) = blocks.first() else {
            return Ok(BatchOutcome::default());
        };
        let desc = self.collection(collection)?;
        let doc_id = first.doc_id().clone();
        if let Some(other) = blocks.iter().find(|b| b.doc_id() != &doc_id) {
            return Err(DbError::MixedBatch {
                expected: doc_id,
                actual: other.doc_id().clone(),
            });
        }

        let ordered = walker::topological_order(blocks.to_vec());
        let in_batch: HashSet<Cid> = ordered.iter().map(|b| b.cid()).collect();
        let mut outcome = BatchOutcome::default();

        {
            let lock = self.locks.get(&doc_id);
            let _guard = lock.lock();
            let mut txn = self.txn();
            self.check_routing(&txn, collection, &doc_id)?;

            let mut missing = BTreeSet::new();
            for block in &ordered {
                let step = merge_block(&mut txn, &desc, block)?;
                if step.is_blocked() {
                    outcome.blocked.push(block.cid());
                    missing.extend(step.missing.into_iter().filter(|c| !in_batch.contains(c)));
                } else if step.pending {
                    outcome.pending.push(block.cid());
                } else if step.stored {
                    outcome.stored.push(block.cid());
                }
            }

            if outcome.is_blocked() {
                txn.discard();
                debug!(
                    doc_id = %doc_id,
                    blocks = ordered.len(),
                    missing = missing.len(),
                    "remote update waits for parents"
                );
                return Ok(BatchOutcome {
                    blocked: ordered.iter().map(|b| b.cid()).collect(),
                    missing: missing.into_iter().collect(),
                    ..BatchOutcome::default()
                });
            }

            if !outcome.stored.is_empty() || !outcome.pending.is_empty() {
                txn.put(keys::doc_member(collection, &doc_id), Vec::new());
                txn.put(keys::doc_collection(&doc_id), collection.as_bytes().to_vec());
            }
            txn.commit()?;
        }

        for cid in &outcome.pending {
            self.broker.publish(Event::BlockPending {
                doc_id: doc_id.clone(),
                cid: *cid,
            });
        }
        for cid in &outcome.stored {
            self.broker.publish(Event::Merged {
                collection: collection.to_string(),
                doc_id: doc_id.clone(),
                cid: *cid,
            });
        }
        Ok(outcome)
    }

    fn check_routing(&self, txn: &Txn, collection: &str, doc_id: &DocId) -> Result<()> {
        match self.collection_in(txn, doc_id)? {
            Some(actual) if actual != collection => Err(DbError::WrongCollection {
                doc_id: doc_id.clone(),
                requested: collection.to_string(),
                actual,
            }),
            _ => Ok(()),
        }
    }

    /// Retry blocks parked with an unknown delta version. Returns how many merged.
    pub fn reprocess_pending(&self) -> Result<usize> {
        let cids = pending_blocks(&self.txn())?;
        let mut merged = 0;

        for cid in cids {
            let Some(block) = self.get_block(&cid)? else {
                continue;
            };
            let doc_id = block.doc_id().clone();
            let Some(collection) = self.collection_of(&doc_id)? else {
                continue;
            };
            let declared = self
                .collection(&collection)
                .ok()
                .and_then(|desc| desc.field_kind(block.field()));

            let lock = self.locks.get(&doc_id);
            let guard = lock.lock();
            let mut txn = self.txn();
            let reg = FieldRegister::new(&doc_id, block.field(), declared);
            let clock = MerkleClock::new(doc_id.clone(), block.field(), &reg);

            match clock.merge_pending(&mut txn, &block) {
                Ok(Some(_)) => {
                    txn.commit()?;
                    drop(guard);
                    merged += 1;
                    self.broker.publish(Event::Merged {
                        collection,
                        doc_id,
                        cid,
                    });
                }
                Ok(None) => {}
                Err(e) if e.is_integrity() => {
                    warn!(cid = %cid.short(), error = %e, "parked block is invalid, unparking");
                    let mut txn = self.txn();
                    txn.delete(tessera_merkle::keys::pending(&cid));
                    txn.commit()?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if merged > 0 {
            info!(merged, "reprocessed parked blocks");
        }
        Ok(merged)
    }
}

/// Run one remote block through its field's clock inside `txn`.
fn merge_block(txn: &mut Txn, desc: &CollectionDescription, block: &Block) -> Result<ProcessOutcome> {
    let doc_id = block.doc_id();
    let declared = match block.field() {
        COMPOSITE_FIELD => None,
        field => desc.field_kind(field),
    };
    let reg = FieldRegister::new(doc_id, block.field(), declared);
    let clock = MerkleClock::new(doc_id.clone(), block.field(), &reg);
    Ok(clock.process_remote_block(txn, block)?)
}

fn expect_kind(desc: &CollectionDescription, field: &str, expected: FieldKind) -> Result<()> {
    let actual = desc.require_field(field)?;
    if actual != expected {
        return Err(DbError::FieldKindMismatch {
            field: field.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn counter_amount(field: &str, value: &FieldValue) -> Result<i64> {
    value.as_int().ok_or_else(|| DbError::FieldKindMismatch {
        field: field.to_string(),
        expected: FieldKind::Register,
        actual: FieldKind::Counter,
    })
}

fn initial_ops(desc: &CollectionDescription, fields: Fields) -> Result<Vec<(String, DeltaOp)>> {
    let mut ops = Vec::with_capacity(fields.len());
    for (field, value) in fields {
        let op = match desc.require_field(&field)? {
            FieldKind::Register => {
                value.validate()?;
                DeltaOp::Set(value)
            }
            FieldKind::Counter => DeltaOp::Increment(counter_amount(&field, &value)?),
        };
        ops.push((field, op));
    }
    Ok(ops)
}
