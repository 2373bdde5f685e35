//! # tessera-merkle
//!
//! Merkle-Clock DAG implementation for the Tessera document store.
//!
//! This crate provides:
//! - Content-addressed, immutable blocks with a deterministic envelope
//! - A byte-oriented datastore with atomic transactions
//! - Per-(document, field) head sets
//! - The Merkle-Clock that links, stores and merges deltas in causal order
//! - DAG walking helpers for gap-repair during sync
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_merkle::{MemoryDatastore, MerkleClock, Txn};
//!
//! let store = MemoryDatastore::shared();
//! let mut txn = Txn::new(store);
//! let clock = MerkleClock::new(doc_id, "name", &register);
//!
//! let b1 = clock.add_delta(&mut txn, DeltaOp::Set("X".into()), None, vec![])?;
//! let b2 = clock.add_delta(&mut txn, DeltaOp::Set("Y".into()), None, vec![])?;
//! assert_eq!(clock.heads(&txn)?, vec![b2.cid()]);
//! txn.commit()?;
//! ```

mod block;
mod blockstore;
mod clock;
mod datastore;
mod hash;
mod heads;
pub mod keys;
pub mod walker;

pub use block::{Block, BlockBuilder, BlockError, DagLink, ENVELOPE_VERSION};
pub use blockstore::BlockStore;
pub use clock::{pending_blocks, ClockError, MerkleClock, ProcessOutcome, ReplicatedData};
pub use datastore::{Datastore, MemoryDatastore, StoreError, Txn, WriteBatch};
pub use hash::{Cid, Hasher};
pub use heads::{Head, HeadSet};
