//! Property-based tests that MUST pass for all field CRDTs
//!
//! These tests verify the lattice laws that guarantee convergence:
//!  - Commutativity: a ⊔ b = b ⊔ a
//!  - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//!  - Idempotence:  a ⊔ a = a
//!  - Bottom is identity: a ⊔ ⊥ = a
//!
//! and that delta-wise merging is independent of arrival order.

use proptest::prelude::*;
use tessera_core::lattice::{Lattice, Merge};
use tessera_core::lwwreg::{LwwDelta, LwwRegister, RegisterValue};
use tessera_core::pncounter::{CounterDelta, PnCounter};

type Reg = LwwRegister<String, Vec<u8>>;

/// A block id fully determines its payload, as it does for real blocks.
fn lww_delta_strategy() -> impl Strategy<Value = LwwDelta<String, Vec<u8>>> {
    (1u64..5, prop::collection::vec(any::<u8>(), 1..4)).prop_map(|(priority, id)| {
        let value = if id[0] % 5 == 0 {
            RegisterValue::Tombstone
        } else {
            RegisterValue::Set(format!("{}:{:?}", priority, id))
        };
        LwwDelta {
            priority,
            id,
            value,
        }
    })
}

fn lwwreg_strategy() -> impl Strategy<Value = Reg> {
    prop::collection::vec(lww_delta_strategy(), 0..4).prop_map(|deltas| {
        let mut reg = Reg::new();
        for d in deltas {
            reg.merge(d);
        }
        reg
    })
}

fn counter_delta_strategy() -> impl Strategy<Value = CounterDelta<u16>> {
    any::<u16>().prop_map(|id| CounterDelta {
        id,
        amount: (id as i64 % 41) - 20,
    })
}

fn pncounter_strategy() -> impl Strategy<Value = PnCounter<u16>> {
    prop::collection::vec(counter_delta_strategy(), 0..8).prop_map(|deltas| {
        let mut counter = PnCounter::new();
        for d in deltas {
            counter.merge(d);
        }
        counter
    })
}

// ============================================================================
// LwwRegister Property Tests
// ============================================================================

proptest! {
    #[test]
    fn lwwreg_join_is_commutative(a in lwwreg_strategy(), b in lwwreg_strategy()) {
        prop_assert_eq!(a.join(&b), b.join(&a));
    }

    #[test]
    fn lwwreg_join_is_associative(
        a in lwwreg_strategy(),
        b in lwwreg_strategy(),
        c in lwwreg_strategy()
    ) {
        let left = a.join(&b).join(&c);
        let right = a.join(&b.join(&c));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn lwwreg_join_is_idempotent(a in lwwreg_strategy()) {
        prop_assert_eq!(a.join(&a), a);
    }

    #[test]
    fn lwwreg_bottom_is_identity(a in lwwreg_strategy()) {
        let bottom = Reg::bottom();
        prop_assert_eq!(a.join(&bottom), a.clone());
        prop_assert_eq!(bottom.join(&a), a);
    }

    #[test]
    fn lwwreg_merge_order_does_not_matter(
        deltas in prop::collection::vec(lww_delta_strategy(), 1..10).prop_shuffle(),
    ) {
        let mut forward = Reg::new();
        for d in deltas.iter().cloned() {
            forward.merge(d);
        }

        let mut backward = Reg::new();
        for d in deltas.iter().rev().cloned() {
            backward.merge(d.clone());
            // Re-applying never changes the outcome
            backward.merge(d);
        }

        prop_assert_eq!(forward, backward);
    }
}

// ============================================================================
// PnCounter Property Tests
// ============================================================================

proptest! {
    #[test]
    fn pncounter_join_is_commutative(a in pncounter_strategy(), b in pncounter_strategy()) {
        prop_assert_eq!(a.join(&b), b.join(&a));
    }

    #[test]
    fn pncounter_join_is_associative(
        a in pncounter_strategy(),
        b in pncounter_strategy(),
        c in pncounter_strategy()
    ) {
        let left = a.join(&b).join(&c);
        let right = a.join(&b.join(&c));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn pncounter_join_is_idempotent(a in pncounter_strategy()) {
        prop_assert_eq!(a.join(&a), a);
    }

    #[test]
    fn pncounter_merge_counts_each_block_once(
        deltas in prop::collection::vec(counter_delta_strategy(), 0..12),
    ) {
        let mut once = PnCounter::new();
        let mut twice = PnCounter::new();
        for d in &deltas {
            once.merge(d.clone());
            twice.merge(d.clone());
            twice.merge(d.clone());
        }
        prop_assert_eq!(once.value(), twice.value());

        let mut unique: Vec<_> = deltas.clone();
        unique.sort_by_key(|d| d.id);
        unique.dedup_by_key(|d| d.id);
        let expected: i64 = unique.iter().map(|d| d.amount).sum();
        prop_assert_eq!(once.value(), expected);
    }
}
