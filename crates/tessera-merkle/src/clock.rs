//! The Merkle-Clock: one causal DAG per (document, field).
//!
//! Local writes link to every current head and become the only head. Remote
//! blocks are merged only once all of their parents are present, so an effect
//! is never visible before its cause.

use crate::block::{Block, BlockBuilder, BlockError, DagLink};
use crate::blockstore::BlockStore;
use crate::datastore::{StoreError, Txn};
use crate::hash::Cid;
use crate::heads::{Head, HeadSet};
use crate::keys;
use tessera_core::{DocId, MergeOutcome};
use tessera_delta::{codec, DecodeError, Delta, DeltaOp};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClockError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("block error: {0}")]
    Block(#[from] BlockError),

    #[error("delta error: {0}")]
    Decode(#[from] DecodeError),

    #[error("block {cid} claims height {claimed} but its heads imply {expected}")]
    HeightMismatch { cid: Cid, claimed: u64, expected: u64 },

    #[error("block {cid} does not belong to this clock: {reason}")]
    RoutingMismatch { cid: Cid, reason: String },

    #[error("register state error: {0}")]
    State(String),
}

impl ClockError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClockError::Store(e) if e.is_retryable())
    }

    /// The block itself is bad and should be discarded.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            ClockError::Block(_)
                | ClockError::Decode(_)
                | ClockError::HeightMismatch { .. }
                | ClockError::RoutingMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ClockError>;

/// The register a clock feeds merged deltas into.
pub trait ReplicatedData {
    fn merge(&self, txn: &mut Txn, block: &Block, delta: &Delta) -> Result<MergeOutcome>;
}

/// Result of processing a remote block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// The block was new and is now stored and linked into the heads.
    pub stored: bool,
    /// Its delta changed the resolved register value.
    pub applied: bool,
    /// Its delta could not be decoded yet and was parked.
    pub pending: bool,
    /// Parents that must be fetched before the block can be processed.
    pub missing: Vec<Cid>,
}

impl ProcessOutcome {
    pub fn is_blocked(&self) -> bool {
        !self.missing.is_empty()
    }
}

pub struct MerkleClock<'a, R: ReplicatedData + ?Sized> {
    doc_id: DocId,
    field: String,
    heads: HeadSet,
    crdt: &'a R,
}

impl<'a, R: ReplicatedData + ?Sized> MerkleClock<'a, R> {
    pub fn new(doc_id: DocId, field: impl Into<String>, crdt: &'a R) -> Self {
        let field = field.into();
        Self {
            heads: HeadSet::new(doc_id.clone(), field.clone()),
            doc_id,
            field,
            crdt,
        }
    }

    pub fn heads(&self, txn: &Txn) -> Result<Vec<Cid>> {
        Ok(self.heads.cids(txn)?)
    }

    /// Build a block for `op` on top of the current heads, store it, make it
    /// the sole head and merge it.
    pub fn add_delta(
        &self,
        txn: &mut Txn,
        op: DeltaOp,
        schema_version_id: Option<String>,
        links: Vec<DagLink>,
    ) -> Result<Block> {
        let current = self.heads.list(txn)?;
        let height = current.iter().map(|h| h.height).max().unwrap_or(0) + 1;

        let delta = Delta {
            doc_id: self.doc_id.clone(),
            field: self.field.clone(),
            schema_version_id,
            priority: height,
            op,
        };
        let block = BlockBuilder::new(self.doc_id.clone(), self.field.clone())
            .with_height(height)
            .with_heads(current.iter().map(|h| h.cid).collect())
            .with_links(links)
            .with_delta(codec::encode(&delta)?)
            .build()?;

        txn.put_block(&block)?;
        let covered: Vec<Cid> = current.iter().map(|h| h.cid).collect();
        self.heads.advance(
            txn,
            Head {
                cid: block.cid(),
                height,
            },
            &covered,
        );
        self.crdt.merge(txn, &block, &delta)?;

        debug!(
            doc_id = %self.doc_id,
            field = %self.field,
            cid = %block.cid().short(),
            height,
            "added delta"
        );
        Ok(block)
    }

    /// Merge a block received from a peer.
    ///
    /// Already-stored blocks are a no-op. If any parent is absent nothing is
    /// written and the missing parents are reported instead.
    pub fn process_remote_block(&self, txn: &mut Txn, block: &Block) -> Result<ProcessOutcome> {
        if block.doc_id() != &self.doc_id || block.field() != self.field {
            return Err(ClockError::RoutingMismatch {
                cid: block.cid(),
                reason: format!("block is for {}/{}", block.doc_id(), block.field()),
            });
        }

        if txn.has_block(&block.cid())? {
            trace!(cid = %block.cid().short(), "block already merged");
            return Ok(ProcessOutcome::default());
        }

        let mut missing = Vec::new();
        for parent in block.parents() {
            if !txn.has_block(&parent)? && !missing.contains(&parent) {
                missing.push(parent);
            }
        }
        if !missing.is_empty() {
            return Ok(ProcessOutcome {
                missing,
                ..Default::default()
            });
        }

        let expected = self.expected_height(txn, block)?;
        if block.height() != expected {
            return Err(ClockError::HeightMismatch {
                cid: block.cid(),
                claimed: block.height(),
                expected,
            });
        }

        let delta = match codec::decode(block.delta()) {
            Ok(delta) => {
                self.check_delta(block, &delta)?;
                Some(delta)
            }
            Err(e) if e.is_version_skew() => {
                warn!(
                    doc_id = %self.doc_id,
                    field = %self.field,
                    cid = %block.cid().short(),
                    error = %e,
                    "retaining block with unknown delta version"
                );
                None
            }
            Err(e) => return Err(e.into()),
        };

        txn.put_block(block)?;
        self.heads.advance(
            txn,
            Head {
                cid: block.cid(),
                height: block.height(),
            },
            block.heads(),
        );

        let mut outcome = ProcessOutcome {
            stored: true,
            ..Default::default()
        };
        match delta {
            Some(delta) => {
                outcome.applied = self.crdt.merge(txn, block, &delta)?.is_applied();
            }
            None => {
                txn.put(keys::pending(&block.cid()), Vec::new());
                outcome.pending = true;
            }
        }

        debug!(
            doc_id = %self.doc_id,
            field = %self.field,
            cid = %block.cid().short(),
            applied = outcome.applied,
            pending = outcome.pending,
            "processed remote block"
        );
        Ok(outcome)
    }

    /// Retry a parked block. Returns `None` while its version is still unknown.
    pub fn merge_pending(&self, txn: &mut Txn, block: &Block) -> Result<Option<MergeOutcome>> {
        match codec::decode(block.delta()) {
            Ok(delta) => {
                self.check_delta(block, &delta)?;
                let outcome = self.crdt.merge(txn, block, &delta)?;
                txn.delete(keys::pending(&block.cid()));
                Ok(Some(outcome))
            }
            Err(e) if e.is_version_skew() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn expected_height(&self, txn: &Txn, block: &Block) -> Result<u64> {
        let mut max = 0;
        for head in block.heads() {
            let parent = txn
                .get_block(head)?
                .ok_or_else(|| StoreError::corrupt(&keys::block(head), "parent vanished"))?;
            max = max.max(parent.height());
        }
        Ok(max + 1)
    }

    fn check_delta(&self, block: &Block, delta: &Delta) -> Result<()> {
        if delta.doc_id != self.doc_id || delta.field != self.field {
            return Err(ClockError::RoutingMismatch {
                cid: block.cid(),
                reason: "delta routing differs from envelope".to_string(),
            });
        }
        if delta.priority != block.height() {
            return Err(ClockError::HeightMismatch {
                cid: block.cid(),
                claimed: delta.priority,
                expected: block.height(),
            });
        }
        Ok(())
    }
}

/// Blocks currently parked because their delta version is unknown.
pub fn pending_blocks(txn: &Txn) -> Result<Vec<Cid>> {
    let entries = txn.scan_prefix(keys::PENDING.as_bytes())?;
    Ok(entries
        .iter()
        .filter_map(|(key, _)| keys::trailing_cid(key))
        .collect())
}
