//! # tessera-sync
//!
//! Peer synchronization and replication for the Tessera document store.
//!
//! This crate provides:
//! - A transport abstraction and an in-memory network for tests and simulation
//! - Topic gossip: local writes advertise new heads to subscribed peers
//! - Pull-based fetching with block verification and holder fallback
//! - Replicators with persisted pending pushes and bounded retry backoff
//! - Targeted document sync with a timeout and cancellation
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_sync::{MemoryNetwork, PeerId, ReplicatorScope, SyncConfig, SyncEngine};
//!
//! let network = MemoryNetwork::new();
//! let engine = SyncEngine::start(db, network.transport(PeerId::new("peer-a")), SyncConfig::default())?;
//! engine.connect_peer(&PeerId::new("peer-b")).await?;
//! engine.set_replicator(PeerId::new("peer-b"), ReplicatorScope::collections(["Users"]))?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
mod fetch;
mod keys;
pub mod network;
pub mod peer;
pub mod replicator;
pub mod topic;

pub use config::{SyncConfig, SyncConfigBuilder};
pub use engine::{SyncEngine, SyncReport};
pub use error::{NetworkError, Result, SyncError};
pub use network::{Envelope, MemoryNetwork, MemoryTransport, Message, NetworkTransport, PeerId, WireBlock};
pub use peer::{PeerInfo, PeerState};
pub use replicator::{PendingPush, Replicator, ReplicatorScope, ReplicatorStatus};
pub use topic::{collection_topic, document_topic, SeenCache, Topic};
