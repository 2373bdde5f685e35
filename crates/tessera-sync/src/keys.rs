//! Peerstore key layout in the shared datastore.
//!
//! ```text
//! /peers/replicators/<peer>                 replicator record (json)
//! /peers/p2p/collections/<collection>       collection topic subscription
//! /peers/p2p/docs/<collection>/<doc>        document topic subscription
//! ```

use tessera_core::DocId;

pub const REPLICATORS: &str = "/peers/replicators/";
pub const P2P_COLLECTIONS: &str = "/peers/p2p/collections/";
pub const P2P_DOCS: &str = "/peers/p2p/docs/";

pub fn replicator(peer: &str) -> Vec<u8> {
    format!("{}{}", REPLICATORS, peer).into_bytes()
}

pub fn p2p_collection(collection: &str) -> Vec<u8> {
    format!("{}{}", P2P_COLLECTIONS, collection).into_bytes()
}

pub fn p2p_doc(collection: &str, doc_id: &DocId) -> Vec<u8> {
    format!("{}{}/{}", P2P_DOCS, collection, doc_id).into_bytes()
}

/// Split a `/peers/p2p/docs/` key into collection and document.
pub fn parse_p2p_doc(key: &[u8]) -> Option<(String, DocId)> {
    let rest = std::str::from_utf8(key).ok()?.strip_prefix(P2P_DOCS)?;
    let (collection, doc) = rest.split_once('/')?;
    Some((collection.to_string(), DocId::parse(doc).ok()?))
}

/// Last path segment of a key.
pub fn last_segment(key: &[u8]) -> Option<&str> {
    std::str::from_utf8(key).ok()?.rsplit('/').next()
}
