//! PN-Counter (Positive-Negative Counter) CRDT keyed by block
//!
//! Every counter block contributes exactly one signed amount. Positive amounts
//! land in P, negative ones in N, and the value is sum(P) - sum(N). Entries are
//! keyed by the contributing block's id rather than by replica, so the same
//! block merged twice (or arriving from two peers) is counted once.

use crate::lattice::{Lattice, Merge, MergeOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One block's contribution to a counter field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta<K> {
    pub id: K,
    pub amount: i64,
}

/// A Positive-Negative Counter CRDT
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnCounter<K: Ord + Clone> {
    increments: BTreeMap<K, u64>,
    decrements: BTreeMap<K, u64>,
}

impl<K: Ord + Clone> PnCounter<K> {
    pub fn new() -> Self {
        Self {
            increments: BTreeMap::new(),
            decrements: BTreeMap::new(),
        }
    }

    /// Record the contribution of block `id`. Returns false if it was already counted.
    pub fn apply(&mut self, id: K, amount: i64) -> bool {
        self.merge(CounterDelta { id, amount }).is_applied()
    }

    /// Get the current value (sum of increments - sum of decrements)
    pub fn value(&self) -> i64 {
        let inc: i128 = self.increments.values().map(|v| *v as i128).sum();
        let dec: i128 = self.decrements.values().map(|v| *v as i128).sum();
        (inc - dec).clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    pub fn contains(&self, id: &K) -> bool {
        self.increments.contains_key(id) || self.decrements.contains_key(id)
    }

    /// Number of merged contributions
    pub fn len(&self) -> usize {
        self.increments.len() + self.decrements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Ord + Clone> Default for PnCounter<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone> Merge for PnCounter<K> {
    type Delta = CounterDelta<K>;

    fn merge(&mut self, delta: Self::Delta) -> MergeOutcome {
        if self.contains(&delta.id) {
            return MergeOutcome::Ignored;
        }
        if delta.amount >= 0 {
            self.increments.insert(delta.id, delta.amount as u64);
        } else {
            self.decrements.insert(delta.id, delta.amount.unsigned_abs());
        }
        MergeOutcome::Applied
    }
}

impl<K: Ord + Clone> Lattice for PnCounter<K> {
    fn bottom() -> Self {
        Self::new()
    }

    /// Union of contributions. A block's amount never changes, so the max of
    /// two entries for the same id is that amount.
    fn join(&self, other: &Self) -> Self {
        let mut result = self.clone();

        for (k, v) in &other.increments {
            let entry = result.increments.entry(k.clone()).or_insert(0);
            *entry = (*entry).max(*v);
        }
        for (k, v) in &other.decrements {
            let entry = result.decrements.entry(k.clone()).or_insert(0);
            *entry = (*entry).max(*v);
        }

        result
    }
}
