//! Last-Write-Wins (LWW) Register CRDT
//!
//! The register keeps the write carried by the block with the highest
//! priority (the block's height in its merkle clock). Two writes with the same
//! priority are concurrent; the one whose block identifier is the
//! lexicographically greater byte string wins. Neither rule depends on which
//! replica evaluates it, so every replica picks the same winner.
//!
//! Deletion is a tombstone write. It competes under the same rule and is only
//! overridden by a write with strictly higher priority (or an equal priority
//! and a greater block id).

use crate::lattice::{Lattice, Merge, MergeOutcome};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The payload of a register write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterValue<T> {
    Set(T),
    Tombstone,
}

impl<T> RegisterValue<T> {
    pub fn as_set(&self) -> Option<&T> {
        match self {
            RegisterValue::Set(v) => Some(v),
            RegisterValue::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, RegisterValue::Tombstone)
    }
}

/// The winning write currently held by a register.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwState<T, K> {
    pub priority: u64,
    /// Identifier of the block that carried this write.
    pub id: K,
    pub value: RegisterValue<T>,
}

/// An incoming write. Same shape as the state it may replace.
pub type LwwDelta<T, K> = LwwState<T, K>;

impl<T, K: Ord> LwwState<T, K> {
    /// Total order over writes: priority first, then block id bytes.
    pub fn order(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// A Last-Write-Wins Register CRDT keyed by (priority, block id).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister<T, K> {
    state: Option<LwwState<T, K>>,
}

impl<T: Clone + PartialEq, K: Ord + Clone> LwwRegister<T, K> {
    /// Create an empty register
    pub fn new() -> Self {
        Self { state: None }
    }

    pub fn from_state(state: LwwState<T, K>) -> Self {
        Self { state: Some(state) }
    }

    /// Apply a write, returning true if it became the resolved value.
    pub fn apply(&mut self, priority: u64, id: K, value: RegisterValue<T>) -> bool {
        self.merge(LwwState {
            priority,
            id,
            value,
        })
        .is_applied()
    }

    /// The resolved value, `None` when empty or tombstoned.
    pub fn get(&self) -> Option<&T> {
        self.state.as_ref().and_then(|s| s.value.as_set())
    }

    pub fn state(&self) -> Option<&LwwState<T, K>> {
        self.state.as_ref()
    }

    pub fn priority(&self) -> u64 {
        self.state.as_ref().map(|s| s.priority).unwrap_or(0)
    }

    /// Id of the block that produced the resolved value
    pub fn winner(&self) -> Option<&K> {
        self.state.as_ref().map(|s| &s.id)
    }

    /// Check if the register never received a write
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
    }

    pub fn is_tombstoned(&self) -> bool {
        self.state
            .as_ref()
            .map(|s| s.value.is_tombstone())
            .unwrap_or(false)
    }
}

impl<T: Clone + PartialEq, K: Ord + Clone> Default for LwwRegister<T, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + PartialEq, K: Ord + Clone> Merge for LwwRegister<T, K> {
    type Delta = LwwDelta<T, K>;

    fn merge(&mut self, delta: Self::Delta) -> MergeOutcome {
        let wins = match &self.state {
            None => true,
            Some(current) => delta.order(current) == Ordering::Greater,
        };
        if wins {
            self.state = Some(delta);
            MergeOutcome::Applied
        } else {
            MergeOutcome::Ignored
        }
    }
}

impl<T: Clone + PartialEq, K: Ord + Clone> Lattice for LwwRegister<T, K> {
    fn bottom() -> Self {
        Self::new()
    }

    /// Keep the greater write under (priority, block id).
    fn join(&self, other: &Self) -> Self {
        match (&self.state, &other.state) {
            (None, _) => other.clone(),
            (_, None) => self.clone(),
            (Some(a), Some(b)) => {
                if a.order(b) == Ordering::Less {
                    other.clone()
                } else {
                    self.clone()
                }
            }
        }
    }
}
