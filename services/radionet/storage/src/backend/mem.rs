//! In-memory storage backend for development and testing

use crate::layout::{ERASED, STORE_SIZE};
use crate::{check_range, BlockStore, StorageError};
use tracing::trace;

/// In-memory block store, erased on creation
#[derive(Debug, Clone)]
pub struct MemoryStore {
    bytes: Vec<u8>,
    /// Number of `write_block` calls, for wear accounting in tests
    writes: usize,
}

impl MemoryStore {
    /// Create an erased store of the standard size
    pub fn new() -> Self {
        Self::with_capacity(STORE_SIZE)
    }

    /// Create an erased store of `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: vec![ERASED; capacity],
            writes: 0,
        }
    }

    /// Create a store holding `bytes`
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes, writes: 0 }
    }

    /// Number of writes since creation
    pub fn write_count(&self) -> usize {
        self.writes
    }

    /// Current contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemoryStore {
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn read_block(&self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        check_range(offset, buf.len(), self.bytes.len())?;
        buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_block(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        check_range(offset, data.len(), self.bytes.len())?;
        trace!("store write offset={} len={}", offset, data.len());
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        self.writes += 1;
        Ok(())
    }
}
