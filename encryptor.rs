//! Authenticated block codec.
//!
//! Each block is authenticated with HMAC-SHA256 and encrypted with an
//! XChaCha20 keystream whose nonce is taken from that tag (synthetic IV).
//! The tag covers the position nonce, the associated data and the plaintext,
//! so a block only verifies at its own position in its own object, and
//! rewriting a block with different content never reuses a keystream.
//!
//! ## Record Format
//!
//! ```text
//! [ciphertext: 4096][tag: 32]
//! tag        = HMAC(mac_key, nonce || ad || plaintext || le64(len(ad)) || le64(len(plaintext)))
//! ciphertext = plaintext XOR XChaCha20(cipher_key, tag[0..24])
//! ad         = object_id (32) || block_index (8, little-endian)
//! nonce      = object_id[0..16] || block_index (8, little-endian)
//! ```
//!
//! Identical plaintext written to the same position yields the identical
//! record; nothing else about the content is revealed by a rewrite.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use zeroize::Zeroizing;

use crate::error::SecureFsError;
use crate::kdf::derive_subkey;
use crate::mac::{mac_parts, Tag};
use crate::types::{Id, Key};
use crate::util::{ct_eq, is_all_zeros, read_le_u64};
use crate::{Result, AD_LENGTH, BLOCK_SIZE, ID_LENGTH, MAC_LENGTH, NONCE_LENGTH, RECORD_LENGTH};

const CIPHER_KEY_INFO: &[u8] = b"block-cipher";
const MAC_KEY_INFO: &[u8] = b"block-mac";

pub type BlockNonce = [u8; NONCE_LENGTH];

/// Deterministic per-block position nonce, bound into the tag
pub fn block_nonce(id: &Id, index: u64) -> BlockNonce {
    let mut nonce = [0u8; NONCE_LENGTH];
    nonce[..16].copy_from_slice(&id.as_bytes()[..16]);
    nonce[16..].copy_from_slice(&index.to_le_bytes());
    nonce
}

/// Associated data binding a block to its object and position
pub fn associated_data(id: &Id, index: u64) -> [u8; AD_LENGTH] {
    let mut ad = [0u8; AD_LENGTH];
    ad[..ID_LENGTH].copy_from_slice(id.as_bytes());
    ad[ID_LENGTH..].copy_from_slice(&index.to_le_bytes());
    ad
}

/// Block encryptor keyed by one object's content sub-key.
pub struct BlockEncryptor {
    cipher_key: Key,
    mac_key: Key,
}

impl BlockEncryptor {
    pub fn new(block_key: &Key) -> Result<Self> {
        Ok(Self {
            cipher_key: derive_subkey(block_key, b"", CIPHER_KEY_INFO)?,
            mac_key: derive_subkey(block_key, b"", MAC_KEY_INFO)?,
        })
    }

    fn apply_keystream(&self, tag: &Tag, buf: &mut [u8]) {
        let mut iv = [0u8; NONCE_LENGTH];
        iv.copy_from_slice(&tag[..NONCE_LENGTH]);
        let mut cipher = XChaCha20::new(self.cipher_key.as_bytes().into(), (&iv).into());
        cipher.apply_keystream(buf);
    }

    fn tag(&self, nonce: &BlockNonce, plaintext: &[u8], ad: &[u8]) -> Tag {
        let ad_len = (ad.len() as u64).to_le_bytes();
        let pt_len = (plaintext.len() as u64).to_le_bytes();
        mac_parts(
            self.mac_key.as_bytes(),
            &[&nonce[..], ad, plaintext, &ad_len[..], &pt_len[..]],
        )
    }

    /// Encrypts exactly `plaintext.len()` bytes and tags the result.
    pub fn encrypt_block(
        &self,
        nonce: &BlockNonce,
        plaintext: &[u8],
        ad: &[u8],
    ) -> Result<(Vec<u8>, Tag)> {
        if plaintext.len() > BLOCK_SIZE {
            return Err(SecureFsError::BlockTooLarge(plaintext.len()));
        }
        let tag = self.tag(nonce, plaintext, ad);
        let mut ciphertext = plaintext.to_vec();
        self.apply_keystream(&tag, &mut ciphertext);
        Ok((ciphertext, tag))
    }

    /// Decrypts and checks the tag in constant time; on mismatch the
    /// candidate plaintext is wiped and never returned.
    ///
    /// The returned [`SecureFsError::AuthenticationFailure`] carries the
    /// position taken from `ad` when it has the standard layout.
    pub fn decrypt_block(
        &self,
        nonce: &BlockNonce,
        ciphertext: &[u8],
        tag: &[u8],
        ad: &[u8],
    ) -> Result<Vec<u8>> {
        let Ok(tag) = Tag::try_from(tag) else {
            return Err(authentication_failure(ad));
        };
        let mut plaintext = Zeroizing::new(self.decrypt_block_unverified(ciphertext, &tag));
        let expected = self.tag(nonce, &plaintext, ad);
        if !ct_eq(&expected, &tag) {
            return Err(authentication_failure(ad));
        }
        Ok(std::mem::take(&mut *plaintext))
    }

    /// Decrypt without checking the tag. Only for no-authentication mounts.
    pub(crate) fn decrypt_block_unverified(&self, ciphertext: &[u8], tag: &Tag) -> Vec<u8> {
        let mut plaintext = ciphertext.to_vec();
        self.apply_keystream(tag, &mut plaintext);
        plaintext
    }
}

fn authentication_failure(ad: &[u8]) -> SecureFsError {
    let position = if ad.len() == AD_LENGTH {
        Id::from_slice(&ad[..ID_LENGTH])
            .and_then(|id| Ok((id, read_le_u64(&ad[ID_LENGTH..])?)))
            .ok()
    } else {
        None
    };
    let (id, block) = position.unwrap_or((Id::from_bytes([0u8; ID_LENGTH]), 0));
    SecureFsError::AuthenticationFailure { id, block }
}

/// One serialized block: full-size ciphertext followed by its tag.
#[derive(Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub ciphertext: Box<[u8; BLOCK_SIZE]>,
    pub tag: Tag,
}

impl BlockRecord {
    pub fn new(ciphertext: &[u8], tag: Tag) -> Result<Self> {
        let ciphertext: Box<[u8; BLOCK_SIZE]> = ciphertext
            .to_vec()
            .into_boxed_slice()
            .try_into()
            .map_err(|c: Box<[u8]>| SecureFsError::InvalidLength {
                expected: BLOCK_SIZE,
                actual: c.len(),
            })?;
        Ok(Self { ciphertext, tag })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_LENGTH {
            return Err(SecureFsError::InvalidLength {
                expected: RECORD_LENGTH,
                actual: bytes.len(),
            });
        }
        let mut tag = [0u8; MAC_LENGTH];
        tag.copy_from_slice(&bytes[BLOCK_SIZE..]);
        Self::new(&bytes[..BLOCK_SIZE], tag)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_LENGTH);
        out.extend_from_slice(&self.ciphertext[..]);
        out.extend_from_slice(&self.tag);
        out
    }

    /// An all-zero record stands for a block that was never written
    pub fn is_hole(&self) -> bool {
        is_all_zeros(&self.ciphertext[..]) && is_all_zeros(&self.tag)
    }
}

impl std::fmt::Debug for BlockRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRecord")
            .field("tag", &hex::encode(self.tag))
            .finish_non_exhaustive()
    }
}
