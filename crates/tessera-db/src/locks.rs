//! Per-document critical sections.
//!
//! Merges for one document are serialized; different documents proceed in
//! parallel. Entries are created on demand and pruned when idle.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tessera_core::DocId;

pub(crate) struct DocLocks {
    locks: Mutex<HashMap<DocId, Arc<Mutex<()>>>>,
    prune_threshold: usize,
}

impl DocLocks {
    pub(crate) fn new(prune_threshold: usize) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            prune_threshold,
        }
    }

    /// The lock for `doc_id`. Hold its guard for the whole read-modify-commit.
    pub(crate) fn get(&self, doc_id: &DocId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() > self.prune_threshold {
            // Only the table holds a reference to idle entries
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(doc_id.clone()).or_default().clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}
