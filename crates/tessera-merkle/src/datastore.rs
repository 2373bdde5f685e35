//! Byte-oriented key/value storage with atomic transactions.
//!
//! Every write path (local mutation, remote merge, replicator bookkeeping)
//! stages its changes in a [`Txn`] and commits them in one step, so a failure
//! part way through leaves the previous state untouched.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("datastore unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    pub fn corrupt(key: &[u8], reason: impl ToString) -> Self {
        StoreError::Corrupt {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: reason.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Staged writes: `None` deletes the key.
pub type WriteBatch = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Trait for the underlying key/value engine.
pub trait Datastore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// All entries under `prefix`, read from one consistent view.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Apply every write in the batch, or none of them.
    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

/// In-memory datastore.
#[derive(Default)]
pub struct MemoryDatastore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    /// Number of upcoming commits that will fail.
    failing_commits: AtomicUsize,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn Datastore> {
        Arc::new(Self::new())
    }

    /// Make the next `n` commits fail with [`StoreError::Unavailable`].
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Datastore for MemoryDatastore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.entries.read().contains_key(key))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let entries = self.entries.read();
        Ok(entries
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }

        let mut entries = self.entries.write();
        for (key, value) in batch {
            match value {
                Some(v) => {
                    entries.insert(key, v);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// A transaction: reads see the store plus this transaction's own writes.
pub struct Txn {
    store: Arc<dyn Datastore>,
    writes: WriteBatch,
}

impl Txn {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self {
            store,
            writes: WriteBatch::new(),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.writes.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => self.store.get(key),
        }
    }

    pub fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        match self.writes.get(key) {
            Some(staged) => Ok(staged.is_some()),
            None => self.store.has(key),
        }
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.store.scan_prefix(prefix)?.into_iter().collect();
        for (key, staged) in self
            .writes
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match staged {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn commit(self) -> Result<(), StoreError> {
        if self.writes.is_empty() {
            return Ok(());
        }
        self.store.commit(self.writes)
    }

    /// Drop all staged writes.
    pub fn discard(self) {}
}
