//! Tessera Delta - field-level mutations and their wire codec
//!
//! A [`Delta`] is the payload carried by one merkle-clock block: a single
//! field mutation plus the causal metadata needed to merge it (its priority
//! and the schema version it was written under).
//!
//! # Wire format
//!
//! ```text
//! +-----+---------------------------+
//! | tag | body (JSON, tag-specific) |
//! +-----+---------------------------+
//! ```
//!
//! The leading tag selects the body layout through a static dispatch table.
//! Older tags always decode; a tag newer than this build knows about fails
//! with [`DecodeError::UnknownSchemaVersion`] so the caller can park the
//! block until an upgrade.

pub mod codec;
pub mod delta;

pub use codec::{decode, encode, encode_with_tag, DecodeError, CURRENT_TAG, LEGACY_TAG, MAX_KNOWN_TAG};
pub use delta::{Delta, DeltaOp, DocStatus};
