//! Key layout of the document namespaces.
//!
//! ```text
//! /collections/<name>          CollectionDescription (JSON)
//! /docs/<collection>/<doc>     membership index
//! /doc_collection/<doc>        owning collection name
//! /values/<doc>/<field>        FieldState (JSON)
//! ```

use tessera_core::DocId;

pub const COLLECTIONS: &str = "/collections/";

pub fn collection(name: &str) -> Vec<u8> {
    format!("{}{}", COLLECTIONS, name).into_bytes()
}

pub fn docs_prefix(collection: &str) -> Vec<u8> {
    format!("/docs/{}/", collection).into_bytes()
}

pub fn doc_member(collection: &str, doc_id: &DocId) -> Vec<u8> {
    format!("/docs/{}/{}", collection, doc_id).into_bytes()
}

pub fn doc_collection(doc_id: &DocId) -> Vec<u8> {
    format!("/doc_collection/{}", doc_id).into_bytes()
}

pub fn values_prefix(doc_id: &DocId) -> Vec<u8> {
    format!("/values/{}/", doc_id).into_bytes()
}

pub fn value(doc_id: &DocId, field: &str) -> Vec<u8> {
    format!("/values/{}/{}", doc_id, field).into_bytes()
}

/// Last path segment of a key.
pub fn last_segment(key: &[u8]) -> Option<&str> {
    std::str::from_utf8(key).ok()?.rsplit('/').next()
}
