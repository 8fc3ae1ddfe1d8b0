//! File-backed storage with CRC recovery

use crate::layout::{ERASED, STORE_SIZE};
use crate::{check_range, BlockStore, StorageError};
use bytes::{Buf, BufMut};
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Size of the CRC trailer after the image
const TRAILER_SIZE: usize = 4;

/// Configuration for the file-backed store
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Image file path
    pub path: PathBuf,
    /// Fsync frequency (1 = every write, N = every N writes)
    pub fsync_every: u32,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./radionet.img"),
            fsync_every: 1,
        }
    }
}

/// Block store persisted as a single image file
///
/// The file holds the full image followed by a little-endian CRC32 of it.
/// A missing, short or corrupt file opens as an erased store.
pub struct FileStore {
    config: FileStoreConfig,
    bytes: Vec<u8>,
    file: File,
    /// Write counter for fsync batching
    write_counter: u32,
}

impl FileStore {
    /// Open or create the image
    pub fn open(config: FileStoreConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let bytes = match Self::decode_image(&raw) {
            Ok(bytes) => {
                info!("Loaded store image from {}", config.path.display());
                bytes
            }
            Err(e) => {
                if !raw.is_empty() {
                    warn!(
                        "Discarding store image {}: {}",
                        config.path.display(),
                        e
                    );
                }
                vec![ERASED; STORE_SIZE]
            }
        };

        Ok(Self {
            config,
            bytes,
            file,
            write_counter: 0,
        })
    }

    fn compute_crc(image: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(image);
        hasher.finalize()
    }

    fn decode_image(raw: &[u8]) -> Result<Vec<u8>, StorageError> {
        if raw.len() != STORE_SIZE + TRAILER_SIZE {
            return Err(StorageError::Corruption(format!(
                "image is {} bytes, expected {}",
                raw.len(),
                STORE_SIZE + TRAILER_SIZE
            )));
        }

        let (image, mut trailer) = raw.split_at(STORE_SIZE);
        let stored = trailer.get_u32_le();
        let actual = Self::compute_crc(image);
        if stored != actual {
            return Err(StorageError::Corruption(format!(
                "CRC mismatch: stored {:08x}, computed {:08x}",
                stored, actual
            )));
        }
        Ok(image.to_vec())
    }

    fn persist(&mut self) -> Result<(), StorageError> {
        let mut image = Vec::with_capacity(self.bytes.len() + TRAILER_SIZE);
        image.put_slice(&self.bytes);
        image.put_u32_le(Self::compute_crc(&self.bytes));

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&image)?;
        self.file.set_len(image.len() as u64)?;

        self.write_counter += 1;
        if self.write_counter >= self.config.fsync_every.max(1) {
            self.file.sync_data()?;
            self.write_counter = 0;
            debug!("Synced store image {}", self.config.path.display());
        }
        Ok(())
    }

    /// Force pending writes to disk
    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.file.sync_data()?;
        self.write_counter = 0;
        Ok(())
    }

    /// Image path
    pub fn path(&self) -> &std::path::Path {
        &self.config.path
    }
}

impl BlockStore for FileStore {
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
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> FileStoreConfig {
        FileStoreConfig {
            path: dir.join("state").join("node.img"),
            fsync_every: 1,
        }
    }

    #[test]
    fn test_missing_file_reads_erased() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(config(dir.path())).unwrap();
        assert_eq!(store.capacity(), STORE_SIZE);
        assert_eq!(store.read_byte(0).unwrap(), ERASED);
    }

    #[test]
    fn test_writes_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = FileStore::open(config(dir.path())).unwrap();
            store.write_block(0, &[7, 0, 1]).unwrap();
        }

        let store = FileStore::open(config(dir.path())).unwrap();
        let mut buf = [0u8; 3];
        store.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, [7, 0, 1]);

        let raw = std::fs::read(store.path()).unwrap();
        assert_eq!(raw.len(), STORE_SIZE + TRAILER_SIZE);
    }

    #[test]
    fn test_corrupt_image_reads_erased() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let mut store = FileStore::open(cfg.clone()).unwrap();
            store.write_byte(5, 42).unwrap();
        }

        let mut raw = std::fs::read(&cfg.path).unwrap();
        raw[5] ^= 0x01;
        std::fs::write(&cfg.path, &raw).unwrap();

        let store = FileStore::open(cfg).unwrap();
        assert_eq!(store.read_byte(5).unwrap(), ERASED);
    }

    #[test]
    fn test_fsync_batching() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.fsync_every = 3;
        let mut store = FileStore::open(cfg).unwrap();

        store.write_byte(1, 1).unwrap();
        store.write_byte(2, 2).unwrap();
        assert_eq!(store.write_counter, 2);
        store.write_byte(3, 3).unwrap();
        assert_eq!(store.write_counter, 0);
    }
}
