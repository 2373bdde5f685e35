//! Head sets: the frontier of one (document, field) DAG.

use crate::datastore::{StoreError, Txn};
use crate::hash::Cid;
use crate::keys;
use tessera_core::DocId;

/// A head and its height.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Head {
    pub cid: Cid,
    pub height: u64,
}

/// View over the persisted heads of one DAG.
#[derive(Clone, Debug)]
pub struct HeadSet {
    doc_id: DocId,
    field: String,
}

impl HeadSet {
    pub fn new(doc_id: DocId, field: impl Into<String>) -> Self {
        Self {
            doc_id,
            field: field.into(),
        }
    }

    /// Current heads, sorted by CID.
    pub fn list(&self, txn: &Txn) -> Result<Vec<Head>, StoreError> {
        let entries = txn.scan_prefix(&keys::heads_prefix(&self.doc_id, &self.field))?;
        let mut heads = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let cid = keys::trailing_cid(&key)
                .ok_or_else(|| StoreError::corrupt(&key, "bad head key"))?;
            let height: [u8; 8] = value
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::corrupt(&key, "bad head height"))?;
            heads.push(Head {
                cid,
                height: u64::from_le_bytes(height),
            });
        }
        heads.sort_by_key(|h| h.cid);
        Ok(heads)
    }

    pub fn cids(&self, txn: &Txn) -> Result<Vec<Cid>, StoreError> {
        Ok(self.list(txn)?.into_iter().map(|h| h.cid).collect())
    }

    /// Height of the next block built on the current heads.
    pub fn next_height(&self, txn: &Txn) -> Result<u64, StoreError> {
        Ok(self.list(txn)?.iter().map(|h| h.height).max().unwrap_or(0) + 1)
    }

    /// Add `head`, dropping any current heads it builds on.
    pub fn advance(&self, txn: &mut Txn, head: Head, covered: &[Cid]) {
        for cid in covered {
            txn.delete(keys::head(&self.doc_id, &self.field, cid));
        }
        txn.put(
            keys::head(&self.doc_id, &self.field, &head.cid),
            head.height.to_le_bytes().to_vec(),
        );
    }
}
