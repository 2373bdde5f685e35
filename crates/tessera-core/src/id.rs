//! Document identifiers.
//!
//! A `DocId` is derived from the collection name and the document's initial
//! field values, so re-deriving it from identical content always yields the
//! same key.

use crate::value::Fields;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Field id reserved for the document-level (composite) DAG.
pub const COMPOSITE_FIELD: &str = "_composite";

const DOC_ID_PREFIX: &str = "bae-";
const DOC_ID_HEX_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid document id: {0}")]
    InvalidDocId(String),
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocId(String);

impl DocId {
    /// Derive the id for a new document from its collection and fields.
    pub fn derive(collection: &str, fields: &Fields) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((collection.len() as u64).to_le_bytes());
        hasher.update(collection.as_bytes());
        // BTreeMap iteration is sorted, and serde_json of FieldValue is stable
        for (name, value) in fields {
            let encoded = serde_json::to_vec(value).unwrap_or_default();
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update((encoded.len() as u64).to_le_bytes());
            hasher.update(&encoded);
        }
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        DocId(format!("{}{}", DOC_ID_PREFIX, &hex[..DOC_ID_HEX_LEN]))
    }

    pub fn parse(s: &str) -> Result<Self, IdError> {
        let valid = s
            .strip_prefix(DOC_ID_PREFIX)
            .map(|hex| {
                hex.len() == DOC_ID_HEX_LEN
                    && hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
            })
            .unwrap_or(false);
        if valid {
            Ok(DocId(s.to_string()))
        } else {
            Err(IdError::InvalidDocId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({})", self.0)
    }
}

impl TryFrom<String> for DocId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        DocId::parse(&s)
    }
}

impl From<DocId> for String {
    fn from(id: DocId) -> Self {
        id.0
    }
}
