pub mod id;
pub mod lattice;
pub mod lwwreg;
pub mod pncounter;
pub mod value;

pub use id::{DocId, IdError, COMPOSITE_FIELD};
pub use lattice::{Lattice, Merge, MergeOutcome};
pub use lwwreg::{LwwDelta, LwwRegister, LwwState, RegisterValue};
pub use pncounter::{CounterDelta, PnCounter};
pub use value::{FieldValue, Fields, ValueError};
