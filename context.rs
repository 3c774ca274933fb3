//! Per-object encryption context.
//!
//! An [`ObjectContext`] binds one object id to its derived content key and
//! its logical size, and turns block reads/writes into record traffic on a
//! [`BlockStore`]. Reads take `&self` and may run concurrently; writes and
//! truncation take `&mut self`, so overlapping writers need the caller's lock.
//!
//! Blocks are always stored as full 4096-byte ciphertext units. The logical
//! size, not the record, says how much of the final block is real data.
//! Invariant: bytes of the final block past the logical size decrypt to zero.

use tracing::{debug, warn};

use crate::config::MountFlags;
use crate::encryptor::{associated_data, block_nonce, BlockEncryptor, BlockRecord};
use crate::error::SecureFsError;
use crate::kdf::derive_subkey;
use crate::store::BlockStore;
use crate::types::{Id, Key};
use crate::{Result, BLOCK_SIZE};

const CONTENT_KEY_INFO: &[u8] = b"content-key";

/// Whether block tags are checked on read.
///
/// Tags are computed on write in both modes, so the on-disk format does not
/// depend on the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Verified,
    /// No-authentication mount: tags are written but never checked
    Unverified,
}

impl AuthMode {
    pub fn from_flags(flags: MountFlags) -> Self {
        if flags.no_authentication() {
            AuthMode::Unverified
        } else {
            AuthMode::Verified
        }
    }
}

/// Outcome of reading one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRead {
    /// Plaintext, trimmed to the logical size for the final block
    Data(Vec<u8>),
    /// The block starts at or past the logical end of the object
    BeyondEnd,
}

impl BlockRead {
    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            BlockRead::Data(d) => Some(d),
            BlockRead::BeyondEnd => None,
        }
    }
}

fn block_start(index: u64) -> Option<u64> {
    index.checked_mul(BLOCK_SIZE as u64)
}

pub struct ObjectContext<'s, S: BlockStore + ?Sized> {
    store: &'s S,
    id: Id,
    encryptor: BlockEncryptor,
    logical_size: u64,
    mode: AuthMode,
    read_only: bool,
}

impl<'s, S: BlockStore + ?Sized> ObjectContext<'s, S> {
    /// Derive the object's content key and load its logical size.
    pub fn open(store: &'s S, id: Id, master: &Key, mode: AuthMode) -> Result<Self> {
        let content_key = derive_subkey(master, id.as_bytes(), CONTENT_KEY_INFO)?;
        let encryptor = BlockEncryptor::new(&content_key)?;
        let logical_size = store.get_logical_size(&id)?.unwrap_or(0);
        debug!(id = %id, logical_size, ?mode, "opened object context");
        Ok(Self {
            store,
            id,
            encryptor,
            logical_size,
            mode,
            read_only: false,
        })
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    pub fn block_count(&self) -> u64 {
        self.logical_size.div_ceil(BLOCK_SIZE as u64)
    }

    /// Read block `index`. Holes read as zeros; a bad tag fails closed.
    pub fn read_block(&self, index: u64) -> Result<BlockRead> {
        let start = match block_start(index) {
            Some(s) if s < self.logical_size => s,
            _ => return Ok(BlockRead::BeyondEnd),
        };
        let len = (self.logical_size - start).min(BLOCK_SIZE as u64) as usize;
        let mut plaintext = self.load_block(index)?;
        plaintext.truncate(len);
        Ok(BlockRead::Data(plaintext))
    }

    /// Encrypt and store a whole block; `plaintext` shorter than a block is
    /// zero-padded. Extends the logical size if the write ends past it.
    pub fn write_block(&mut self, index: u64, plaintext: &[u8]) -> Result<()> {
        self.check_writable()?;
        if plaintext.len() > BLOCK_SIZE {
            return Err(SecureFsError::BlockTooLarge(plaintext.len()));
        }
        let end = block_start(index)
            .and_then(|s| s.checked_add(plaintext.len() as u64))
            .ok_or_else(|| {
                SecureFsError::invalid_parameter(format!("block index {index} out of range"))
            })?;

        if end > self.logical_size {
            self.scrub_stale(self.logical_size, index)?;
        }
        self.store_block(index, plaintext)?;
        debug!(id = %self.id, block = index, len = plaintext.len(), "wrote block");

        if end > self.logical_size {
            self.set_size(end)?;
        }
        Ok(())
    }

    /// Set the logical size. Shrinking zeroes the tail of the new final
    /// block but deletes no ciphertext.
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        self.check_writable()?;
        let old_size = self.logical_size;
        if new_size < old_size {
            let tail = (new_size % BLOCK_SIZE as u64) as usize;
            if tail != 0 {
                let index = new_size / BLOCK_SIZE as u64;
                let mut block = self.load_block(index)?;
                block[tail..].fill(0);
                self.store_block(index, &block)?;
            }
        } else if new_size > old_size {
            self.scrub_stale(old_size, new_size.div_ceil(BLOCK_SIZE as u64))?;
        }
        debug!(id = %self.id, old_size, new_size, "truncated object");
        self.set_size(new_size)
    }

    /// Read up to `len` bytes at `offset`, clamped to the logical size.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = offset.saturating_add(len as u64).min(self.logical_size);
        if offset >= end {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let index = pos / BLOCK_SIZE as u64;
            let in_block = (pos % BLOCK_SIZE as u64) as usize;
            let data = match self.read_block(index)? {
                BlockRead::Data(d) => d,
                BlockRead::BeyondEnd => break,
            };
            let take = (data.len() - in_block).min((end - pos) as usize);
            out.extend_from_slice(&data[in_block..in_block + take]);
            pos += take as u64;
        }
        Ok(out)
    }

    /// Write `data` at `offset`, merging with existing content of partially
    /// covered blocks.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut pos = offset;
        let mut remaining = data;
        while !remaining.is_empty() {
            let index = pos / BLOCK_SIZE as u64;
            let in_block = (pos % BLOCK_SIZE as u64) as usize;
            let take = remaining.len().min(BLOCK_SIZE - in_block);
            let start = index * BLOCK_SIZE as u64;

            let existing_len = if start < self.logical_size {
                (self.logical_size - start).min(BLOCK_SIZE as u64) as usize
            } else {
                0
            };

            if in_block == 0 && take >= existing_len {
                self.write_block(index, &remaining[..take])?;
            } else {
                let mut block = if existing_len > 0 {
                    self.load_block(index)?
                } else {
                    vec![0u8; BLOCK_SIZE]
                };
                block[in_block..in_block + take].copy_from_slice(&remaining[..take]);
                let len = existing_len.max(in_block + take);
                self.write_block(index, &block[..len])?;
            }

            remaining = &remaining[take..];
            pos += take as u64;
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(SecureFsError::ReadOnly);
        }
        Ok(())
    }

    fn set_size(&mut self, size: u64) -> Result<()> {
        self.store.set_logical_size(&self.id, size)?;
        self.logical_size = size;
        Ok(())
    }

    /// Full-size plaintext of a block, zeros for a hole.
    fn load_block(&self, index: u64) -> Result<Vec<u8>> {
        let record = match self.store.get_block(&self.id, index)? {
            Some(bytes) => BlockRecord::from_bytes(&bytes)?,
            None => return Ok(vec![0u8; BLOCK_SIZE]),
        };
        if record.is_hole() {
            return Ok(vec![0u8; BLOCK_SIZE]);
        }

        match self.mode {
            AuthMode::Verified => {
                let nonce = block_nonce(&self.id, index);
                let ad = associated_data(&self.id, index);
                self.encryptor
                    .decrypt_block(&nonce, &record.ciphertext[..], &record.tag, &ad)
                    .inspect_err(|e| {
                        if e.is_authentication_failure() {
                            warn!(id = %self.id, block = index, "block failed authentication");
                        }
                    })
            }
            AuthMode::Unverified => Ok(self
                .encryptor
                .decrypt_block_unverified(&record.ciphertext[..], &record.tag)),
        }
    }

    fn store_block(&self, index: u64, plaintext: &[u8]) -> Result<()> {
        let mut padded = [0u8; BLOCK_SIZE];
        padded[..plaintext.len()].copy_from_slice(plaintext);

        let nonce = block_nonce(&self.id, index);
        let ad = associated_data(&self.id, index);
        let (ciphertext, tag) = self.encryptor.encrypt_block(&nonce, &padded, &ad)?;
        let record = BlockRecord::new(&ciphertext, tag)?;
        self.store.put_block(&self.id, index, &record.to_bytes())
    }

    /// Overwrite leftover ciphertext in whole blocks from `from_size` up to
    /// (not including) `until_block`, so a regrown range reads as zeros.
    fn scrub_stale(&self, from_size: u64, until_block: u64) -> Result<()> {
        let first = from_size.div_ceil(BLOCK_SIZE as u64);
        let last = until_block.min(self.store.stored_blocks(&self.id)?);
        for index in first..last {
            let Some(bytes) = self.store.get_block(&self.id, index)? else {
                continue;
            };
            if !BlockRecord::from_bytes(&bytes)?.is_hole() {
                debug!(id = %self.id, block = index, "zeroing stale block");
                self.store_block(index, &[])?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn master() -> Key {
        Key::from_bytes([0x5A; 32])
    }

    fn open(store: &MemoryStore, id: Id) -> ObjectContext<'_, MemoryStore> {
        ObjectContext::open(store, id, &master(), AuthMode::Verified).unwrap()
    }

    #[test]
    fn test_empty_object_reads_beyond_end() {
        let store = MemoryStore::new();
        let ctx = open(&store, Id::from_bytes([1; 32]));
        assert_eq!(ctx.logical_size(), 0);
        assert_eq!(ctx.block_count(), 0);
        assert_eq!(ctx.read_block(0).unwrap(), BlockRead::BeyondEnd);
    }

    #[test]
    fn test_write_read_partial_block() {
        let store = MemoryStore::new();
        let mut ctx = open(&store, Id::from_bytes([1; 32]));
        ctx.write_block(0, b"hello world").unwrap();
        assert_eq!(ctx.logical_size(), 11);
        assert_eq!(
            ctx.read_block(0).unwrap(),
            BlockRead::Data(b"hello world".to_vec())
        );
        assert_eq!(ctx.read_block(1).unwrap(), BlockRead::BeyondEnd);
    }

    #[test]
    fn test_hole_reads_as_zeros() {
        let store = MemoryStore::new();
        let mut ctx = open(&store, Id::from_bytes([2; 32]));
        ctx.write_block(3, &[0xEE; 100]).unwrap();
        assert_eq!(ctx.logical_size(), 3 * BLOCK_SIZE as u64 + 100);
        assert_eq!(
            ctx.read_block(1).unwrap(),
            BlockRead::Data(vec![0u8; BLOCK_SIZE])
        );
        assert_eq!(store.get_block(ctx.id(), 1).unwrap(), None);
    }

    #[test]
    fn test_size_persists_across_contexts() {
        let store = MemoryStore::new();
        let id = Id::from_bytes([3; 32]);
        {
            let mut ctx = open(&store, id);
            ctx.write_block(1, &[7u8; BLOCK_SIZE]).unwrap();
        }
        let ctx = open(&store, id);
        assert_eq!(ctx.logical_size(), 2 * BLOCK_SIZE as u64);
        assert_eq!(
            ctx.read_block(1).unwrap(),
            BlockRead::Data(vec![7u8; BLOCK_SIZE])
        );
    }

    #[test]
    fn test_truncate_shrink_then_regrow_reads_zeros() {
        let store = MemoryStore::new();
        let mut ctx = open(&store, Id::from_bytes([4; 32]));
        ctx.write_block(0, &[1u8; BLOCK_SIZE]).unwrap();
        ctx.write_block(1, &[2u8; BLOCK_SIZE]).unwrap();

        ctx.truncate(100).unwrap();
        assert_eq!(ctx.read_block(1).unwrap(), BlockRead::BeyondEnd);
        assert_eq!(ctx.read_block(0).unwrap(), BlockRead::Data(vec![1u8; 100]));
        // Ciphertext for block 1 is still there
        assert!(store.get_block(ctx.id(), 1).unwrap().is_some());

        ctx.truncate(2 * BLOCK_SIZE as u64).unwrap();
        let mut expected = vec![1u8; 100];
        expected.resize(BLOCK_SIZE, 0);
        assert_eq!(ctx.read_block(0).unwrap(), BlockRead::Data(expected));
        assert_eq!(
            ctx.read_block(1).unwrap(),
            BlockRead::Data(vec![0u8; BLOCK_SIZE])
        );
    }

    #[test]
    fn test_write_past_stale_blocks_zeroes_them() {
        let store = MemoryStore::new();
        let mut ctx = open(&store, Id::from_bytes([5; 32]));
        for i in 0..3 {
            ctx.write_block(i, &[9u8; BLOCK_SIZE]).unwrap();
        }
        ctx.truncate(0).unwrap();
        ctx.write_block(2, b"tail").unwrap();
        assert_eq!(
            ctx.read_block(0).unwrap(),
            BlockRead::Data(vec![0u8; BLOCK_SIZE])
        );
        assert_eq!(
            ctx.read_block(1).unwrap(),
            BlockRead::Data(vec![0u8; BLOCK_SIZE])
        );
        assert_eq!(ctx.read_block(2).unwrap(), BlockRead::Data(b"tail".to_vec()));
    }

    #[test]
    fn test_tampered_record_fails_closed() {
        let store = MemoryStore::new();
        let mut ctx = open(&store, Id::from_bytes([6; 32]));
        ctx.write_block(0, b"secret").unwrap();
        store
            .with_block_mut(ctx.id(), 0, |r| r[0] ^= 0x01)
            .unwrap();
        let err = ctx.read_block(0).unwrap_err();
        assert!(matches!(
            err,
            SecureFsError::AuthenticationFailure { block: 0, .. }
        ));
    }

    #[test]
    fn test_unverified_mode_skips_tag_check() {
        let store = MemoryStore::new();
        let id = Id::from_bytes([7; 32]);
        let mut ctx = open(&store, id);
        ctx.write_block(0, b"secret").unwrap();
        store
            .with_block_mut(&id, 0, |r| {
                // Past the tag bytes that seed the keystream
                let last = r.len() - 1;
                r[last] ^= 0xFF;
            })
            .unwrap();

        let ctx = ObjectContext::open(&store, id, &master(), AuthMode::Unverified).unwrap();
        assert_eq!(ctx.read_block(0).unwrap(), BlockRead::Data(b"secret".to_vec()));
    }

    #[test]
    fn test_wrong_master_key_fails() {
        let store = MemoryStore::new();
        let id = Id::from_bytes([8; 32]);
        open(&store, id).write_block(0, b"data").unwrap();
        let other = ObjectContext::open(
            &store,
            id,
            &Key::from_bytes([0x11; 32]),
            AuthMode::Verified,
        )
        .unwrap();
        assert!(other.read_block(0).unwrap_err().is_authentication_failure());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let store = MemoryStore::new();
        let mut ctx = open(&store, Id::from_bytes([9; 32])).with_read_only(true);
        assert!(matches!(
            ctx.write_block(0, b"x"),
            Err(SecureFsError::ReadOnly)
        ));
        assert!(matches!(ctx.truncate(10), Err(SecureFsError::ReadOnly)));
    }

    #[test]
    fn test_byte_range_io() {
        let store = MemoryStore::new();
        let mut ctx = open(&store, Id::from_bytes([10; 32]));
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        ctx.write_at(0, &data).unwrap();
        assert_eq!(ctx.logical_size(), 10_000);
        assert_eq!(ctx.block_count(), 3);

        ctx.write_at(4090, b"0123456789").unwrap();
        let mut expected = data.clone();
        expected[4090..4100].copy_from_slice(b"0123456789");
        assert_eq!(ctx.read_at(0, 20_000).unwrap(), expected);
        assert_eq!(ctx.read_at(4088, 4).unwrap(), &expected[4088..4092]);
        assert!(ctx.read_at(10_000, 5).unwrap().is_empty());
    }

    #[test]
    fn test_write_at_past_end_leaves_zero_gap() {
        let store = MemoryStore::new();
        let mut ctx = open(&store, Id::from_bytes([11; 32]));
        ctx.write_at(0, b"abc").unwrap();
        ctx.write_at(5000, b"xyz").unwrap();
        let all = ctx.read_at(0, 6000).unwrap();
        assert_eq!(all.len(), 5003);
        assert_eq!(&all[..3], b"abc");
        assert!(all[3..5000].iter().all(|&b| b == 0));
        assert_eq!(&all[5000..], b"xyz");
    }

    #[test]
    fn test_block_rewrite_does_not_reveal_plaintext_xor() {
        let store = MemoryStore::new();
        let id = Id::from_bytes([12; 32]);
        let mut ctx = open(&store, id);
        let p1 = [b'A'; BLOCK_SIZE];
        let p2 = [b'B'; BLOCK_SIZE];

        ctx.write_block(0, &p1).unwrap();
        let r1 = store.get_block(&id, 0).unwrap().unwrap();
        ctx.write_block(0, &p2).unwrap();
        let r2 = store.get_block(&id, 0).unwrap().unwrap();

        let ct_xor: Vec<u8> = r1[..BLOCK_SIZE]
            .iter()
            .zip(&r2[..BLOCK_SIZE])
            .map(|(a, b)| a ^ b)
            .collect();
        let pt_xor: Vec<u8> = p1.iter().zip(&p2).map(|(a, b)| a ^ b).collect();
        assert_ne!(ct_xor, pt_xor);

        // Recovering p2 from both records and p1 must fail
        let guess: Vec<u8> = r1[..BLOCK_SIZE]
            .iter()
            .zip(&r2[..BLOCK_SIZE])
            .zip(&p1)
            .map(|((a, b), p)| a ^ b ^ p)
            .collect();
        assert_ne!(guess, p2.to_vec());
        assert_eq!(ctx.read_block(0).unwrap(), BlockRead::Data(p2.to_vec()));
    }

    #[test]
    fn test_partial_rewrite_changes_whole_record() {
        let store = MemoryStore::new();
        let id = Id::from_bytes([13; 32]);
        let mut ctx = open(&store, id);
        ctx.write_at(0, &[0x11; BLOCK_SIZE]).unwrap();
        let before = store.get_block(&id, 0).unwrap().unwrap();
        ctx.write_at(10, b"x").unwrap();
        let after = store.get_block(&id, 0).unwrap().unwrap();

        // Untouched plaintext bytes must not keep their ciphertext
        let unchanged = before[..BLOCK_SIZE]
            .iter()
            .zip(&after[..BLOCK_SIZE])
            .filter(|(a, b)| a == b)
            .count();
        assert!(unchanged < BLOCK_SIZE / 2);
    }
}
