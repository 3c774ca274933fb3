//! Underlying byte stores.
//!
//! The engine never touches paths itself; it hands serialized block records to
//! a [`BlockStore`] and asks it for them back. [`MemoryStore`] keeps
//! everything in process, [`DirStore`] lays objects out on disk.
//!
//! ## DirStore Layout
//!
//! ```text
//! <root>/<id hex 0..2>/<id hex 2..64>        block records, record i at i * 4128
//! <root>/<id hex 0..2>/<id hex 2..64>.meta   {"logical_size": N}
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::debug;

use crate::error::SecureFsError;
use crate::metadata::ObjectMetadata;
use crate::types::Id;
use crate::{Result, RECORD_LENGTH};

/// Storage collaborator for block records and logical sizes.
pub trait BlockStore: Send + Sync {
    /// Record bytes for a block, or `None` if it was never stored
    fn get_block(&self, id: &Id, index: u64) -> Result<Option<Vec<u8>>>;

    fn put_block(&self, id: &Id, index: u64, record: &[u8]) -> Result<()>;

    /// Logical size, or `None` for an unknown object
    fn get_logical_size(&self, id: &Id) -> Result<Option<u64>>;

    fn set_logical_size(&self, id: &Id, size: u64) -> Result<()>;

    /// Number of block slots physically present for the object
    fn stored_blocks(&self, id: &Id) -> Result<u64>;
}

fn check_record(record: &[u8]) -> Result<()> {
    if record.len() != RECORD_LENGTH {
        return Err(SecureFsError::InvalidLength {
            expected: RECORD_LENGTH,
            actual: record.len(),
        });
    }
    Ok(())
}

#[derive(Default)]
struct MemoryObject {
    blocks: BTreeMap<u64, Vec<u8>>,
    logical_size: Option<u64>,
}

/// In-process store, for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<Id, MemoryObject>>,
}

fn poisoned<T>(_: T) -> SecureFsError {
    SecureFsError::storage("memory store lock poisoned")
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Result<Vec<Id>> {
        let objects = self.objects.read().map_err(poisoned)?;
        Ok(objects.keys().copied().collect())
    }

    /// Direct mutable access to a stored record, for corruption tests
    pub fn with_block_mut<R>(
        &self,
        id: &Id,
        index: u64,
        f: impl FnOnce(&mut Vec<u8>) -> R,
    ) -> Result<Option<R>> {
        let mut objects = self.objects.write().map_err(poisoned)?;
        Ok(objects
            .get_mut(id)
            .and_then(|o| o.blocks.get_mut(&index))
            .map(f))
    }
}

impl BlockStore for MemoryStore {
    fn get_block(&self, id: &Id, index: u64) -> Result<Option<Vec<u8>>> {
        let objects = self.objects.read().map_err(poisoned)?;
        Ok(objects.get(id).and_then(|o| o.blocks.get(&index)).cloned())
    }

    fn put_block(&self, id: &Id, index: u64, record: &[u8]) -> Result<()> {
        check_record(record)?;
        let mut objects = self.objects.write().map_err(poisoned)?;
        objects
            .entry(*id)
            .or_default()
            .blocks
            .insert(index, record.to_vec());
        Ok(())
    }

    fn get_logical_size(&self, id: &Id) -> Result<Option<u64>> {
        let objects = self.objects.read().map_err(poisoned)?;
        Ok(objects.get(id).and_then(|o| o.logical_size))
    }

    fn set_logical_size(&self, id: &Id, size: u64) -> Result<()> {
        let mut objects = self.objects.write().map_err(poisoned)?;
        objects.entry(*id).or_default().logical_size = Some(size);
        Ok(())
    }

    fn stored_blocks(&self, id: &Id) -> Result<u64> {
        let objects = self.objects.read().map_err(poisoned)?;
        Ok(objects
            .get(id)
            .and_then(|o| o.blocks.keys().next_back())
            .map_or(0, |last| last + 1))
    }
}

/// Directory-backed store: one file of fixed-size records per object.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an object's record file
    pub fn object_path(&self, id: &Id) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    fn open_for_write(&self, id: &Id) -> Result<File> {
        let path = self.object_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?)
    }

    fn file_len(&self, id: &Id) -> Result<Option<u64>> {
        match fs::metadata(self.object_path(id)) {
            Ok(m) => Ok(Some(m.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn record_offset(index: u64) -> Result<u64> {
    index
        .checked_mul(RECORD_LENGTH as u64)
        .ok_or_else(|| SecureFsError::storage(format!("block index {index} out of range")))
}

impl BlockStore for DirStore {
    fn get_block(&self, id: &Id, index: u64) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(id);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let offset = record_offset(index)?;
        let len = file.metadata()?.len();
        // A short trailing record is treated as absent
        if len < offset.saturating_add(RECORD_LENGTH as u64) {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut record = vec![0u8; RECORD_LENGTH];
        file.read_exact(&mut record)?;
        Ok(Some(record))
    }

    fn put_block(&self, id: &Id, index: u64, record: &[u8]) -> Result<()> {
        check_record(record)?;
        let offset = record_offset(index)?;
        let mut file = self.open_for_write(id)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(record)?;
        debug!(id = %id, block = index, "stored block record");
        Ok(())
    }

    fn get_logical_size(&self, id: &Id) -> Result<Option<u64>> {
        let meta_path = ObjectMetadata::path_for(&self.object_path(id));
        Ok(ObjectMetadata::load(&meta_path)?.map(|m| m.logical_size))
    }

    fn set_logical_size(&self, id: &Id, size: u64) -> Result<()> {
        let path = self.object_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        ObjectMetadata { logical_size: size }.store(&ObjectMetadata::path_for(&path))
    }

    fn stored_blocks(&self, id: &Id) -> Result<u64> {
        Ok(self.file_len(id)?.map_or(0, |len| len / RECORD_LENGTH as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(fill: u8) -> Vec<u8> {
        vec![fill; RECORD_LENGTH]
    }

    #[test]
    fn test_memory_store_blocks() {
        let store = MemoryStore::new();
        let id = Id::from_bytes([1; 32]);
        assert_eq!(store.get_block(&id, 0).unwrap(), None);
        assert_eq!(store.stored_blocks(&id).unwrap(), 0);

        store.put_block(&id, 2, &record(7)).unwrap();
        assert_eq!(store.get_block(&id, 2).unwrap(), Some(record(7)));
        assert_eq!(store.get_block(&id, 1).unwrap(), None);
        assert_eq!(store.stored_blocks(&id).unwrap(), 3);
    }

    #[test]
    fn test_memory_store_rejects_bad_record() {
        let store = MemoryStore::new();
        let id = Id::from_bytes([1; 32]);
        assert!(store.put_block(&id, 0, &[0u8; 10]).is_err());
    }

    #[test]
    fn test_memory_store_sizes() {
        let store = MemoryStore::new();
        let id = Id::from_bytes([1; 32]);
        assert_eq!(store.get_logical_size(&id).unwrap(), None);
        store.set_logical_size(&id, 99).unwrap();
        assert_eq!(store.get_logical_size(&id).unwrap(), Some(99));
        assert_eq!(store.ids().unwrap(), vec![id]);
    }

    #[test]
    fn test_dir_store_layout() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::new(tmp.path());
        let id = Id::from_bytes([0xAB; 32]);

        store.put_block(&id, 0, &record(1)).unwrap();
        store.set_logical_size(&id, 10).unwrap();

        let path = store.object_path(&id);
        assert_eq!(path, tmp.path().join("ab").join("ab".repeat(31)));
        assert_eq!(fs::metadata(&path).unwrap().len(), RECORD_LENGTH as u64);
        assert!(tmp
            .path()
            .join("ab")
            .join(format!("{}.meta", "ab".repeat(31)))
            .exists());
    }

    #[test]
    fn test_dir_store_sparse_gap_reads_zero_record() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::new(tmp.path());
        let id = Id::from_bytes([3; 32]);

        store.put_block(&id, 2, &record(5)).unwrap();
        assert_eq!(store.stored_blocks(&id).unwrap(), 3);
        assert_eq!(store.get_block(&id, 2).unwrap(), Some(record(5)));
        // The gap the filesystem filled in comes back as zeros
        assert_eq!(store.get_block(&id, 0).unwrap(), Some(record(0)));
        assert_eq!(store.get_block(&id, 3).unwrap(), None);
    }

    #[test]
    fn test_dir_store_missing_object() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::new(tmp.path());
        let id = Id::from_bytes([4; 32]);
        assert_eq!(store.get_block(&id, 0).unwrap(), None);
        assert_eq!(store.get_logical_size(&id).unwrap(), None);
        assert_eq!(store.stored_blocks(&id).unwrap(), 0);
    }

    #[test]
    fn test_dir_store_overwrite() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::new(tmp.path());
        let id = Id::from_bytes([6; 32]);
        store.put_block(&id, 0, &record(1)).unwrap();
        store.put_block(&id, 1, &record(2)).unwrap();
        store.put_block(&id, 0, &record(3)).unwrap();
        assert_eq!(store.get_block(&id, 0).unwrap(), Some(record(3)));
        assert_eq!(store.get_block(&id, 1).unwrap(), Some(record(2)));
    }
}
