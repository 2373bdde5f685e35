//! # tessera-db
//!
//! Document layer for the Tessera document store.
//!
//! This crate provides:
//! - Collection definitions with register and counter fields
//! - The document composer: local writes become per-field blocks linked by a composite block
//! - The merge processor for blocks received from peers
//! - Per-document locking and atomic transactions
//! - An in-process event broker with bounded, non-blocking fan-out
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_db::{CollectionDescription, DocumentStore, FieldKind};
//!
//! let db = DocumentStore::in_memory();
//! db.create_collection(CollectionDescription::new("Users").with_field("name", FieldKind::Register))?;
//!
//! let mut fields = Fields::new();
//! fields.insert("name".into(), "Bob".into());
//! let id = db.create("Users", fields)?;
//! db.set("Users", &id, "name", "Alice".into())?;
//! assert_eq!(db.get("Users", &id)?.get("name"), Some(&"Alice".into()));
//! ```

pub mod collection;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
mod keys;
mod locks;
pub mod merge;

pub use collection::{CollectionDescription, FieldKind};
pub use config::{BrokerConfig, DbConfig, DbConfigBuilder};
pub use document::{BatchOutcome, Document, DocumentStore};
pub use error::{DbError, Result};
pub use events::{Event, EventBroker, Subscription, SubscriptionId};
pub use merge::FieldState;
