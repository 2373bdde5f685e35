//! Join-semilattice trait - the mathematical foundation of CRDTs
//!
//! A join-semilattice (S, ⊔) satisfies:
//! - Commutativity: a ⊔ b = b ⊔ a
//! - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//! - Idempotence:  a ⊔ a = a
//!
//! These properties guarantee convergence regardless of message order.
//! Every field register in Tessera is a lattice; the [`Merge`] trait is the
//! delta-shaped view of the same join that the Merkle-Clock drives.

use std::cmp::Ordering;

/// The core CRDT trait. All state-based registers implement this.
pub trait Lattice: Clone + PartialEq {
    /// The bottom element (identity for join)
    fn bottom() -> Self;

    /// Join operation (least upper bound)
    /// Must be commutative, associative, and idempotent
    fn join(&self, other: &Self) -> Self;

    /// Partial order derived from join: a ≤ b iff a ⊔ b = b
    fn partial_cmp_lattice(&self, other: &Self) -> Option<Ordering> {
        let joined = self.join(other);
        if &joined == self && &joined == other {
            Some(Ordering::Equal)
        } else if &joined == other {
            Some(Ordering::Less)
        } else if &joined == self {
            Some(Ordering::Greater)
        } else {
            None
        }
    }

    /// Check if self ≤ other in the lattice order
    fn leq(&self, other: &Self) -> bool {
        matches!(
            self.partial_cmp_lattice(other),
            Some(Ordering::Less) | Some(Ordering::Equal)
        )
    }

    /// Join-assign: self = self ⊔ other
    fn join_assign(&mut self, other: &Self) {
        *self = self.join(other);
    }
}

/// What a single [`Merge::merge`] call did to the state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The incoming delta changed the resolved state.
    Applied,
    /// The incoming delta lost (or was already reflected) and the state is unchanged.
    Ignored,
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MergeOutcome::Applied)
    }
}

/// The merge contract every field CRDT satisfies.
///
/// `merge` folds one delta into the current state. Applying any set of deltas
/// in any order, or re-applying one that was already applied, must converge to
/// the same state. Merging never fails on well-formed input.
pub trait Merge {
    type Delta;

    fn merge(&mut self, delta: Self::Delta) -> MergeOutcome;
}
