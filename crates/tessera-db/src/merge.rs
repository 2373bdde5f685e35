//! Persisted register state and the merge step the merkle clock drives.

use crate::collection::FieldKind;
use crate::keys;
use serde::{Deserialize, Serialize};
use tessera_core::{
    CounterDelta, DocId, FieldValue, LwwRegister, LwwState, Merge, MergeOutcome, PnCounter,
    RegisterValue,
};
use tessera_delta::{Delta, DeltaOp, DocStatus};
use tessera_merkle::{Block, Cid, ClockError, ReplicatedData, StoreError, Txn};

/// Resolved state of one `(doc, field)` register.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldState {
    Register(LwwRegister<FieldValue, Cid>),
    Counter(PnCounter<Cid>),
    Composite(LwwRegister<DocStatus, Cid>),
}

impl FieldState {
    fn empty_for(op: &DeltaOp) -> Self {
        match op {
            DeltaOp::Set(_) | DeltaOp::Tombstone => FieldState::Register(LwwRegister::new()),
            DeltaOp::Increment(_) => FieldState::Counter(PnCounter::new()),
            DeltaOp::Composite(_) => FieldState::Composite(LwwRegister::new()),
        }
    }

    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            FieldState::Register(_) => Some(FieldKind::Register),
            FieldState::Counter(_) => Some(FieldKind::Counter),
            FieldState::Composite(_) => None,
        }
    }

    /// The materialized value, `None` for tombstoned or composite state.
    pub fn resolved(&self) -> Option<FieldValue> {
        match self {
            FieldState::Register(reg) => reg.get().cloned(),
            FieldState::Counter(counter) => Some(FieldValue::Int(counter.value())),
            FieldState::Composite(_) => None,
        }
    }

    pub fn status(&self) -> Option<DocStatus> {
        match self {
            FieldState::Composite(reg) => reg.get().copied(),
            _ => None,
        }
    }

    fn apply(&mut self, cid: Cid, delta: &Delta) -> Result<MergeOutcome, ClockError> {
        let outcome = match (self, &delta.op) {
            (FieldState::Register(reg), DeltaOp::Set(v)) => reg.merge(LwwState {
                priority: delta.priority,
                id: cid,
                value: RegisterValue::Set(v.clone()),
            }),
            (FieldState::Register(reg), DeltaOp::Tombstone) => reg.merge(LwwState {
                priority: delta.priority,
                id: cid,
                value: RegisterValue::Tombstone,
            }),
            (FieldState::Counter(counter), DeltaOp::Increment(amount)) => {
                counter.merge(CounterDelta {
                    id: cid,
                    amount: *amount,
                })
            }
            (FieldState::Composite(reg), DeltaOp::Composite(status)) => reg.merge(LwwState {
                priority: delta.priority,
                id: cid,
                value: RegisterValue::Set(*status),
            }),
            (state, op) => {
                return Err(ClockError::State(format!(
                    "{:?} cannot apply to {:?} state of field {}",
                    op,
                    state.kind(),
                    delta.field
                )))
            }
        };
        Ok(outcome)
    }
}

pub(crate) fn load_state(txn: &Txn, doc_id: &DocId, field: &str) -> Result<Option<FieldState>, StoreError> {
    let key = keys::value(doc_id, field);
    match txn.get(&key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::corrupt(&key, e)),
        None => Ok(None),
    }
}

/// The register behind one `(doc, field)` clock.
pub(crate) struct FieldRegister<'a> {
    doc_id: &'a DocId,
    field: &'a str,
    /// Kind from the local schema, if the field is known.
    declared: Option<FieldKind>,
}

impl<'a> FieldRegister<'a> {
    pub(crate) fn new(doc_id: &'a DocId, field: &'a str, declared: Option<FieldKind>) -> Self {
        Self {
            doc_id,
            field,
            declared,
        }
    }
}

impl ReplicatedData for FieldRegister<'_> {
    fn merge(&self, txn: &mut Txn, block: &Block, delta: &Delta) -> Result<MergeOutcome, ClockError> {
        let mut state = match load_state(txn, self.doc_id, self.field)? {
            Some(state) => state,
            None => FieldState::empty_for(&delta.op),
        };
        if let (Some(declared), Some(kind)) = (self.declared, FieldState::empty_for(&delta.op).kind()) {
            if declared != kind {
                return Err(ClockError::State(format!(
                    "{:?} delta for {:?} field {}",
                    kind, declared, self.field
                )));
            }
        }

        let outcome = state.apply(block.cid(), delta)?;
        if outcome.is_applied() {
            let bytes = serde_json::to_vec(&state).map_err(|e| ClockError::State(e.to_string()))?;
            txn.put(keys::value(self.doc_id, self.field), bytes);
        }
        Ok(outcome)
    }
}
