//! # SecureFS - Encrypted-at-rest Block Engine
//!
//! SecureFS maps logical file content onto encrypted, integrity-protected
//! block records kept in an ordinary directory tree. This crate is the engine
//! underneath: it turns a passphrase into a key hierarchy, derives a sub-key
//! per object, and encrypts/authenticates 4 KiB blocks with fail-closed
//! decryption.
//!
//! ## Key Hierarchy
//!
//! ```text
//! passphrase ──PBKDF2-HMAC-SHA256 (auto-calibrated)──► password key
//!   └── key-wrap sub-key (HKDF) ──XChaCha20-Poly1305──► master key (random, stored wrapped)
//!         └── content sub-key per object (HKDF, salt = object id)
//!               ├── block-cipher key (XChaCha20 keystream, nonce from the tag)
//!               └── block-mac key    (HMAC-SHA256 tag)
//! ```
//!
//! ## Block Record Layout
//!
//! ```text
//! [ciphertext: 4096][tag: 32]
//! AD         = object_id (32) || block_index (8, little-endian)
//! nonce      = object_id[0..16] || block_index (8, little-endian)
//! tag        = HMAC-SHA256(mac_key, nonce || AD || plaintext || lengths)
//! ciphertext = plaintext XOR XChaCha20(cipher_key, tag[0..24])
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use securefs::{key_manager::KeyManager, store::MemoryStore, BlockRead, Id, Key};
//! use securefs::config::MountFlags;
//!
//! fn main() -> Result<(), securefs::SecureFsError> {
//!     let km = KeyManager::from_master_key(Key::generate(), MountFlags::empty());
//!     let store = MemoryStore::new();
//!     let id = Id::generate();
//!
//!     let mut ctx = km.open_object(&store, id)?;
//!     ctx.write_block(0, b"sensitive data")?;
//!
//!     if let BlockRead::Data(bytes) = ctx.read_block(0)? {
//!         assert_eq!(bytes, b"sensitive data");
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod encryptor;
pub mod enumerate;
pub mod error;
pub mod kdf;
pub mod key_manager;
pub mod mac;
pub mod metadata;
pub mod store;
pub mod types;
pub mod util;

/// Length of every key in the hierarchy (256-bit)
pub const KEY_LENGTH: usize = 32;

/// Length of an object identifier
pub const ID_LENGTH: usize = 32;

/// Logical block size of an object's content stream
pub const BLOCK_SIZE: usize = 4096;

/// Length of an HMAC-SHA256 block tag
pub const MAC_LENGTH: usize = 32;

/// Length of an XChaCha20 nonce (192-bit)
pub const NONCE_LENGTH: usize = 24;

/// Length of a serialized block record: ciphertext followed by tag
pub const RECORD_LENGTH: usize = BLOCK_SIZE + MAC_LENGTH;

/// Length of the associated data bound into every block tag
pub const AD_LENGTH: usize = ID_LENGTH + 8;

// Re-export common types for convenience
pub use context::{AuthMode, BlockRead, ObjectContext};
pub use error::SecureFsError;
pub use types::{Id, Key};

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, SecureFsError>;
