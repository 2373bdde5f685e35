//! Block envelope and builder.
//!
//! Each block in a merkle clock contains:
//! - Routing: the document and field whose DAG it belongs to
//! - A height (one more than the highest head it builds on)
//! - The previous heads of the same DAG
//! - Named links into other DAGs (composite blocks link their field blocks)
//! - An opaque delta payload, encoded by `tessera-delta`
//!
//! The envelope is a fixed-order binary layout so that identical contents
//! always produce identical bytes, and therefore identical CIDs. Routing stays
//! readable even when the delta was written by a newer schema version.

use crate::hash::Cid;
use serde::{Deserialize, Serialize};
use tessera_core::DocId;
use thiserror::Error;

pub const ENVELOPE_VERSION: u8 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block truncated at offset {0}")]
    Truncated(usize),

    #[error("unsupported block envelope version {0}")]
    UnsupportedEnvelope(u8),

    #[error("block has {0} trailing bytes")]
    TrailingBytes(usize),

    #[error("invalid block routing: {0}")]
    InvalidRouting(String),

    #[error("block hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: Cid, actual: Cid },
}

/// A named pointer into another DAG.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DagLink {
    pub name: String,
    pub cid: Cid,
}

impl DagLink {
    pub fn new(name: impl Into<String>, cid: Cid) -> Self {
        Self {
            name: name.into(),
            cid,
        }
    }
}

/// An immutable, content-addressed block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    bytes: Vec<u8>,
    doc_id: DocId,
    field: String,
    height: u64,
    heads: Vec<Cid>,
    links: Vec<DagLink>,
    delta: Vec<u8>,
}

impl Block {
    pub fn cid(&self) -> Cid {
        self.cid
    }

    /// The exact encoded bytes the CID was computed over.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Previous heads of the same DAG.
    pub fn heads(&self) -> &[Cid] {
        &self.heads
    }

    pub fn links(&self) -> &[DagLink] {
        &self.links
    }

    pub fn delta(&self) -> &[u8] {
        &self.delta
    }

    /// Every block this one causally depends on: heads, then links.
    pub fn parents(&self) -> impl Iterator<Item = Cid> + '_ {
        self.heads
            .iter()
            .copied()
            .chain(self.links.iter().map(|l| l.cid))
    }

    pub fn is_genesis(&self) -> bool {
        self.heads.is_empty()
    }

    /// Decode a block whose identity is derived from the bytes themselves.
    pub fn decode(bytes: &[u8]) -> Result<Block, BlockError> {
        let mut r = Reader { bytes, pos: 0 };

        let version = r.u8()?;
        if version != ENVELOPE_VERSION {
            return Err(BlockError::UnsupportedEnvelope(version));
        }

        let doc_id = r.string()?;
        let doc_id =
            DocId::parse(&doc_id).map_err(|e| BlockError::InvalidRouting(e.to_string()))?;
        let field = r.string()?;
        validate_field(&field)?;
        let height = r.u64()?;

        let head_count = r.u32()? as usize;
        let mut heads = Vec::with_capacity(head_count.min(1024));
        for _ in 0..head_count {
            heads.push(r.cid()?);
        }

        let link_count = r.u32()? as usize;
        let mut links = Vec::with_capacity(link_count.min(1024));
        for _ in 0..link_count {
            let name = r.string()?;
            let cid = r.cid()?;
            links.push(DagLink { name, cid });
        }

        let delta = r.bytes()?.to_vec();

        if r.pos != bytes.len() {
            return Err(BlockError::TrailingBytes(bytes.len() - r.pos));
        }

        Ok(Block {
            cid: Cid::of(bytes),
            bytes: bytes.to_vec(),
            doc_id,
            field,
            height,
            heads,
            links,
            delta,
        })
    }

    /// Decode bytes received under a claimed CID, rejecting tampered content.
    pub fn verify(expected: &Cid, bytes: &[u8]) -> Result<Block, BlockError> {
        let actual = Cid::of(bytes);
        if actual != *expected {
            return Err(BlockError::HashMismatch {
                expected: *expected,
                actual,
            });
        }
        Block::decode(bytes)
    }
}

fn validate_field(field: &str) -> Result<(), BlockError> {
    if field.is_empty() || field.contains('/') {
        return Err(BlockError::InvalidRouting(format!("bad field name {:?}", field)));
    }
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BlockError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(BlockError::Truncated(self.pos))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, BlockError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, BlockError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, BlockError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn cid(&mut self) -> Result<Cid, BlockError> {
        let mut buf = [0u8; 32];
        buf.copy_from_slice(self.take(32)?);
        Ok(Cid::from_bytes(buf))
    }

    fn bytes(&mut self) -> Result<&'a [u8], BlockError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, BlockError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| BlockError::InvalidRouting("string is not utf-8".to_string()))
    }
}

/// Builder for creating blocks.
#[derive(Clone, Debug)]
pub struct BlockBuilder {
    doc_id: DocId,
    field: String,
    height: u64,
    heads: Vec<Cid>,
    links: Vec<DagLink>,
    delta: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(doc_id: DocId, field: impl Into<String>) -> Self {
        BlockBuilder {
            doc_id,
            field: field.into(),
            height: 1,
            heads: Vec::new(),
            links: Vec::new(),
            delta: Vec::new(),
        }
    }

    pub fn with_height(mut self, height: u64) -> Self {
        self.height = height;
        self
    }

    pub fn with_heads(mut self, heads: Vec<Cid>) -> Self {
        self.heads = heads;
        self
    }

    pub fn with_link(mut self, link: DagLink) -> Self {
        self.links.push(link);
        self
    }

    pub fn with_links(mut self, links: Vec<DagLink>) -> Self {
        self.links.extend(links);
        self
    }

    pub fn with_delta(mut self, delta: Vec<u8>) -> Self {
        self.delta = delta;
        self
    }

    /// Encode the envelope and compute its CID.
    pub fn build(mut self) -> Result<Block, BlockError> {
        validate_field(&self.field)?;

        // Heads and links are sets; sort so equal sets encode identically
        self.heads.sort();
        self.heads.dedup();
        self.links.sort();
        self.links.dedup();

        let mut bytes = Vec::with_capacity(128 + self.delta.len());
        bytes.push(ENVELOPE_VERSION);
        put_bytes(&mut bytes, self.doc_id.as_str().as_bytes());
        put_bytes(&mut bytes, self.field.as_bytes());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(&(self.heads.len() as u32).to_le_bytes());
        for head in &self.heads {
            bytes.extend_from_slice(head.as_bytes());
        }
        bytes.extend_from_slice(&(self.links.len() as u32).to_le_bytes());
        for link in &self.links {
            put_bytes(&mut bytes, link.name.as_bytes());
            bytes.extend_from_slice(link.cid.as_bytes());
        }
        put_bytes(&mut bytes, &self.delta);

        Ok(Block {
            cid: Cid::of(&bytes),
            bytes,
            doc_id: self.doc_id,
            field: self.field,
            height: self.height,
            heads: self.heads,
            links: self.links,
            delta: self.delta,
        })
    }
}

fn put_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}
