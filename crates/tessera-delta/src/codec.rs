//! Versioned delta codec.

use crate::delta::{Delta, DeltaOp};
use serde::{Deserialize, Serialize};
use tessera_core::{DocId, FieldValue};
use thiserror::Error;

/// Body without schema version, set/tombstone only.
pub const LEGACY_TAG: u8 = 1;
/// Current body layout.
pub const CURRENT_TAG: u8 = 2;
pub const MAX_KNOWN_TAG: u8 = CURRENT_TAG;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed delta: {0}")]
    Malformed(String),

    #[error("unknown delta schema version tag {tag} (newest known is {max_known})")]
    UnknownSchemaVersion { tag: u8, max_known: u8 },

    #[error("delta cannot be encoded with tag {tag}: {reason}")]
    Unencodable { tag: u8, reason: String },
}

impl DecodeError {
    /// Skew errors clear up after a software upgrade; malformed bytes never do.
    pub fn is_version_skew(&self) -> bool {
        matches!(self, DecodeError::UnknownSchemaVersion { .. })
    }
}

type DecodeFn = fn(&[u8]) -> Result<Delta, DecodeError>;

static DECODERS: [(u8, DecodeFn); 2] = [(LEGACY_TAG, decode_legacy), (CURRENT_TAG, decode_current)];

#[derive(Serialize, Deserialize)]
struct LegacyBody {
    doc_id: DocId,
    field: String,
    priority: u64,
    /// `None` is a tombstone.
    value: Option<FieldValue>,
}

#[derive(Serialize, Deserialize)]
struct CurrentBody {
    doc_id: DocId,
    field: String,
    schema_version_id: Option<String>,
    priority: u64,
    op: DeltaOp,
}

/// Encode with the current tag. Output is byte-identical for equal deltas.
pub fn encode(delta: &Delta) -> Result<Vec<u8>, DecodeError> {
    encode_with_tag(delta, CURRENT_TAG)
}

pub fn encode_with_tag(delta: &Delta, tag: u8) -> Result<Vec<u8>, DecodeError> {
    let unencodable = |reason: String| DecodeError::Unencodable { tag, reason };

    let body = match tag {
        LEGACY_TAG => {
            let value = match &delta.op {
                DeltaOp::Set(v) => Some(v.clone()),
                DeltaOp::Tombstone => None,
                other => return Err(unencodable(format!("{:?} has no legacy form", other))),
            };
            serde_json::to_vec(&LegacyBody {
                doc_id: delta.doc_id.clone(),
                field: delta.field.clone(),
                priority: delta.priority,
                value,
            })
        }
        CURRENT_TAG => serde_json::to_vec(&CurrentBody {
            doc_id: delta.doc_id.clone(),
            field: delta.field.clone(),
            schema_version_id: delta.schema_version_id.clone(),
            priority: delta.priority,
            op: delta.op.clone(),
        }),
        _ => return Err(unencodable("unknown tag".to_string())),
    }
    .map_err(|e| unencodable(e.to_string()))?;

    let mut bytes = Vec::with_capacity(body.len() + 1);
    bytes.push(tag);
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Delta, DecodeError> {
    let (&tag, body) = bytes
        .split_first()
        .ok_or_else(|| DecodeError::Malformed("empty payload".to_string()))?;

    match DECODERS.iter().find(|(t, _)| *t == tag) {
        Some((_, decode_fn)) => decode_fn(body),
        None if tag > MAX_KNOWN_TAG => Err(DecodeError::UnknownSchemaVersion {
            tag,
            max_known: MAX_KNOWN_TAG,
        }),
        None => Err(DecodeError::Malformed(format!("invalid tag {}", tag))),
    }
}

fn decode_legacy(body: &[u8]) -> Result<Delta, DecodeError> {
    let body: LegacyBody =
        serde_json::from_slice(body).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let op = match body.value {
        Some(v) => DeltaOp::Set(v),
        None => DeltaOp::Tombstone,
    };
    Ok(Delta {
        doc_id: body.doc_id,
        field: body.field,
        schema_version_id: None,
        priority: body.priority,
        op,
    })
}

fn decode_current(body: &[u8]) -> Result<Delta, DecodeError> {
    let body: CurrentBody =
        serde_json::from_slice(body).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    Ok(Delta {
        doc_id: body.doc_id,
        field: body.field,
        schema_version_id: body.schema_version_id,
        priority: body.priority,
        op: body.op,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DocStatus;
    use tessera_core::Fields;

    fn doc() -> DocId {
        DocId::derive("Users", &Fields::new())
    }

    fn sample() -> Delta {
        Delta::new(doc(), "name", DeltaOp::Set(FieldValue::from("Bob")))
            .with_schema_version("v1")
            .with_priority(3)
    }

    #[test]
    fn test_encode_is_deterministic() {
        let a = encode(&sample()).unwrap();
        let b = encode(&sample().clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0], CURRENT_TAG);
    }

    #[test]
    fn test_current_roundtrip_all_ops() {
        for op in [
            DeltaOp::Set(FieldValue::List(vec![FieldValue::Int(1), FieldValue::Null])),
            DeltaOp::Tombstone,
            DeltaOp::Increment(-4),
            DeltaOp::Composite(DocStatus::Deleted),
        ] {
            let delta = Delta::new(doc(), "f", op).with_priority(9);
            assert_eq!(decode(&encode(&delta).unwrap()).unwrap(), delta);
        }
    }

    #[test]
    fn test_legacy_tag_still_decodes() {
        let mut delta = sample();
        delta.schema_version_id = None;
        let bytes = encode_with_tag(&delta, LEGACY_TAG).unwrap();
        assert_eq!(bytes[0], LEGACY_TAG);
        assert_eq!(decode(&bytes).unwrap(), delta);

        let tomb = Delta::new(doc(), "name", DeltaOp::Tombstone).with_priority(2);
        let decoded = decode(&encode_with_tag(&tomb, LEGACY_TAG).unwrap()).unwrap();
        assert_eq!(decoded.op, DeltaOp::Tombstone);
    }

    #[test]
    fn test_legacy_rejects_counter_ops() {
        let delta = Delta::new(doc(), "visits", DeltaOp::Increment(1));
        assert!(matches!(
            encode_with_tag(&delta, LEGACY_TAG),
            Err(DecodeError::Unencodable { tag: LEGACY_TAG, .. })
        ));
    }

    #[test]
    fn test_newer_tag_is_version_skew() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[0] = MAX_KNOWN_TAG + 1;
        let err = decode(&bytes).unwrap_err();
        assert!(err.is_version_skew());
        assert_eq!(
            err,
            DecodeError::UnknownSchemaVersion { tag: MAX_KNOWN_TAG + 1, max_known: MAX_KNOWN_TAG }
        );
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(decode(&[]), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(&[0, b'{', b'}']), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(&[CURRENT_TAG, b'{']), Err(DecodeError::Malformed(_))));

        let err = decode(&[CURRENT_TAG, b'{', b'}']).unwrap_err();
        assert!(!err.is_version_skew());
    }
}
