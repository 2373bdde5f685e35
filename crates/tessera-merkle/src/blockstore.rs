//! Content-addressed block storage.

use crate::block::Block;
use crate::datastore::{StoreError, Txn};
use crate::hash::Cid;
use crate::keys;

/// Put/Get/Has over encoded block bytes keyed by their hash.
pub trait BlockStore {
    /// Store bytes under their CID. Storing identical bytes twice is a no-op.
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<Cid, StoreError>;

    fn get_bytes(&self, cid: &Cid) -> Result<Option<Vec<u8>>, StoreError>;

    fn has_block(&self, cid: &Cid) -> Result<bool, StoreError>;

    fn put_block(&mut self, block: &Block) -> Result<Cid, StoreError> {
        self.put_bytes(block.bytes())
    }

    /// Load and decode a stored block.
    fn get_block(&self, cid: &Cid) -> Result<Option<Block>, StoreError> {
        match self.get_bytes(cid)? {
            Some(bytes) => Block::decode(&bytes)
                .map(Some)
                .map_err(|e| StoreError::corrupt(&keys::block(cid), e)),
            None => Ok(None),
        }
    }
}

impl BlockStore for Txn {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<Cid, StoreError> {
        let cid = Cid::of(bytes);
        let key = keys::block(&cid);
        if !self.has(&key)? {
            self.put(key, bytes.to_vec());
        }
        Ok(cid)
    }

    fn get_bytes(&self, cid: &Cid) -> Result<Option<Vec<u8>>, StoreError> {
        self.get(&keys::block(cid))
    }

    fn has_block(&self, cid: &Cid) -> Result<bool, StoreError> {
        self.has(&keys::block(cid))
    }
}
