//! Content identifiers for blocks.
//!
//! Uses SHA-256 over the encoded block bytes. Ordering on `Cid` is the
//! lexicographic order of the raw bytes, which is what register tie-breaks use.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte SHA-256 hash used as a Content Identifier (CID).
///
/// Serializes as a hex string so it can key JSON maps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid([u8; 32]);

impl Cid {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Cid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash a complete block encoding.
    pub fn of(data: &[u8]) -> Self {
        Hasher::hash(data)
    }

    /// Convert to hex string for display.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Create from hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(hex_str, 16).ok()?;
        }
        Some(Cid(bytes))
    }

    /// Truncated display (first 8 chars).
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Cid::from_hex(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid cid {:?}", s)))
    }
}

/// Incremental SHA-256 producing a [`Cid`].
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Hasher {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> Cid {
        let result = self.inner.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Cid(bytes)
    }

    pub fn hash(data: &[u8]) -> Cid {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(Cid::of(b"hello world"), Cid::of(b"hello world"));
        assert_ne!(Cid::of(b"hello"), Cid::of(b"world"));
    }

    #[test]
    fn test_hex_roundtrip() {
        let cid = Cid::of(b"test data");
        assert_eq!(Cid::from_hex(&cid.to_hex()), Some(cid));
        assert_eq!(Cid::from_hex("zz"), None);
        assert_eq!(cid.short().len(), 8);
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher = Hasher::new();
        hasher.update(b"hello");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), Cid::of(b"helloworld"));
    }

    #[test]
    fn test_serde_as_hex() {
        let cid = Cid::of(b"x");
        let json = serde_json::to_string(&cid).unwrap();
        assert_eq!(json, format!("\"{}\"", cid.to_hex()));
        assert_eq!(serde_json::from_str::<Cid>(&json).unwrap(), cid);
        assert!(serde_json::from_str::<Cid>("\"abc\"").is_err());
    }

    #[test]
    fn test_order_is_bytewise() {
        let mut low = [0u8; 32];
        let mut high = [0u8; 32];
        low[0] = 0x01;
        high[0] = 0x02;
        low[31] = 0xff;
        assert!(Cid::from_bytes(low) < Cid::from_bytes(high));
    }
}
