//! Persisted node state for radionet.
//!
//! A node keeps a few bytes of state across restarts: its id, its parent,
//! its distance to the gateway, the child route table and a small region
//! the application may use freely. All of it lives in a 1024-byte
//! byte-addressable store where an erased byte reads as `0xFF`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod layout;
pub mod state;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Access outside the store
    #[error("Access out of range: offset {offset} len {len} capacity {capacity}")]
    OutOfRange {
        /// First byte accessed
        offset: usize,
        /// Bytes accessed
        len: usize,
        /// Store size
        capacity: usize,
    },
}

/// Byte-addressable persistent store
pub trait BlockStore: Send {
    /// Size of the store in bytes
    fn capacity(&self) -> usize;

    /// Fill `buf` from `offset`
    fn read_block(&self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Write `data` at `offset`
    fn write_block(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError>;

    /// Read one byte
    fn read_byte(&self, offset: usize) -> Result<u8, StorageError> {
        let mut b = [0u8; 1];
        self.read_block(offset, &mut b)?;
        Ok(b[0])
    }

    /// Write one byte
    fn write_byte(&mut self, offset: usize, value: u8) -> Result<(), StorageError> {
        self.write_block(offset, &[value])
    }
}

impl<S: BlockStore + ?Sized> BlockStore for Box<S> {
    fn capacity(&self) -> usize {
        (**self).capacity()
    }

    fn read_block(&self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        (**self).read_block(offset, buf)
    }

    fn write_block(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        (**self).write_block(offset, data)
    }
}

/// Check that `offset..offset + len` lies inside a store of `capacity` bytes
pub(crate) fn check_range(offset: usize, len: usize, capacity: usize) -> Result<(), StorageError> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(StorageError::OutOfRange {
            offset,
            len,
            capacity,
        }),
    }
}

/// Storage backend configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageMode {
    /// In-memory storage (dev/tests only)
    #[default]
    InMemory,
    /// Image file with a CRC trailer
    File {
        /// Image file path
        path: PathBuf,
        /// Fsync frequency (1 = every write, N = every N writes)
        #[serde(default = "default_fsync_every")]
        fsync_every: u32,
    },
}

fn default_fsync_every() -> u32 {
    1
}

// Re-export backend implementations
pub use backend::file::{FileStore, FileStoreConfig};
pub use backend::mem::MemoryStore;
pub use state::{ControllerSettings, NodeIdentity, NodeStorage, UNKNOWN_DISTANCE};

/// Open a store from configuration
pub fn open_store(mode: &StorageMode) -> Result<Box<dyn BlockStore>, StorageError> {
    match mode {
        StorageMode::InMemory => Ok(Box::new(MemoryStore::new())),
        StorageMode::File { path, fsync_every } => {
            let config = FileStoreConfig {
                path: path.clone(),
                fsync_every: *fsync_every,
            };
            Ok(Box::new(FileStore::open(config)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_check() {
        assert!(check_range(0, 1024, 1024).is_ok());
        assert!(check_range(1023, 2, 1024).is_err());
        assert!(check_range(usize::MAX, 2, 1024).is_err());
    }

    #[test]
    fn test_open_in_memory() {
        let store = open_store(&StorageMode::InMemory).unwrap();
        assert_eq!(store.capacity(), layout::STORE_SIZE);
        assert_eq!(store.read_byte(0).unwrap(), layout::ERASED);
    }

    #[test]
    fn test_open_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let mode = StorageMode::File {
            path: dir.path().join("node.img"),
            fsync_every: 4,
        };
        let mut store = open_store(&mode).unwrap();
        store.write_byte(10, 3).unwrap();
        assert_eq!(store.read_byte(10).unwrap(), 3);
    }
}
