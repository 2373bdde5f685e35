//! Collection descriptions and schema versions.

use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_merkle::Cid;

/// How a field's deltas are resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Last-writer-wins register.
    Register,
    /// Sum of signed increments.
    Counter,
}

/// A named set of documents sharing a schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDescription {
    pub name: String,
    /// Content-derived id of this schema shape.
    pub schema_version_id: String,
    pub fields: BTreeMap<String, FieldKind>,
}

impl CollectionDescription {
    pub fn new(name: impl Into<String>) -> Self {
        let mut desc = Self {
            name: name.into(),
            schema_version_id: String::new(),
            fields: BTreeMap::new(),
        };
        desc.schema_version_id = desc.compute_version_id();
        desc
    }

    pub fn with_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), kind);
        self.schema_version_id = self.compute_version_id();
        self
    }

    pub fn field_kind(&self, field: &str) -> Option<FieldKind> {
        self.fields.get(field).copied()
    }

    /// Kind of `field`, or `FieldNotFound`.
    pub fn require_field(&self, field: &str) -> Result<FieldKind> {
        self.field_kind(field).ok_or_else(|| DbError::FieldNotFound {
            collection: self.name.clone(),
            field: field.to_string(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !is_identifier(&self.name) {
            return Err(DbError::InvalidCollection(format!(
                "bad collection name {:?}",
                self.name
            )));
        }
        if let Some(bad) = self.fields.keys().find(|f| !is_identifier(f) || f.starts_with('_')) {
            return Err(DbError::InvalidCollection(format!("bad field name {:?}", bad)));
        }
        if self.schema_version_id != self.compute_version_id() {
            return Err(DbError::InvalidCollection(
                "schema version id does not match fields".to_string(),
            ));
        }
        Ok(())
    }

    fn compute_version_id(&self) -> String {
        let mut bytes = self.name.as_bytes().to_vec();
        for (field, kind) in &self.fields {
            bytes.push(0);
            bytes.extend_from_slice(field.as_bytes());
            bytes.push(match kind {
                FieldKind::Register => b'r',
                FieldKind::Counter => b'c',
            });
        }
        format!("sv-{}", &Cid::of(&bytes).to_hex()[..16])
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
