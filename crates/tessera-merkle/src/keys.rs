//! Key layout of the merkle namespaces in the datastore.
//!
//! ```text
//! /blocks/<cid>                     encoded block bytes
//! /heads/<doc>/<field>/<cid>        head height (u64 le)
//! /pending/<cid>                    block retained undecoded
//! ```

use crate::hash::Cid;
use tessera_core::DocId;

pub const BLOCKS: &str = "/blocks/";
pub const HEADS: &str = "/heads/";
pub const PENDING: &str = "/pending/";

pub fn block(cid: &Cid) -> Vec<u8> {
    format!("{}{}", BLOCKS, cid.to_hex()).into_bytes()
}

pub fn heads_prefix(doc_id: &DocId, field: &str) -> Vec<u8> {
    format!("{}{}/{}/", HEADS, doc_id, field).into_bytes()
}

pub fn head(doc_id: &DocId, field: &str, cid: &Cid) -> Vec<u8> {
    let mut key = heads_prefix(doc_id, field);
    key.extend_from_slice(cid.to_hex().as_bytes());
    key
}

pub fn pending(cid: &Cid) -> Vec<u8> {
    format!("{}{}", PENDING, cid.to_hex()).into_bytes()
}

/// Parse the CID at the end of a `/blocks/`, `/heads/` or `/pending/` key.
pub fn trailing_cid(key: &[u8]) -> Option<Cid> {
    let key = std::str::from_utf8(key).ok()?;
    let hex = key.rsplit('/').next()?;
    Cid::from_hex(hex)
}
