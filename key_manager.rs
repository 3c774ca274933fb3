//! Mount session handle and password-protected key file.
//!
//! This module provides [`KeyManager`], which owns the master key for the
//! lifetime of a mount and opens per-object contexts, and [`KeyFile`], the
//! on-disk JSON that stores the master key wrapped under a password.
//!
//! ## Security Features
//!
//! - Keys are zeroized on drop; the master key is shared read-only via `Arc`
//! - Unix file permissions set to 0600 (owner read/write only)
//! - The PBKDF2 iteration count is calibrated at creation and persisted
//! - Password derivation runs on a blocking worker, never on the async runtime
//!
//! ## Key File Format
//!
//! ```text
//! {
//!   "version": 1,
//!   "salt": "<hex, 32 bytes>",
//!   "iterations": 160000,
//!   "encrypted_key": { "nonce": "<hex, 24 bytes>", "ciphertext": "<hex, 32 + 16 bytes>" }
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chacha20poly1305::aead::{Aead, AeadCore, OsRng, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::config::{Config, KdfConfig, MountFlags};
use crate::context::{AuthMode, ObjectContext};
use crate::error::SecureFsError;
use crate::kdf::{derive_key_with_iterations, derive_master_key, derive_subkey};
use crate::store::BlockStore;
use crate::types::{Id, Key};
use crate::util::{random_array, write_le_u32};
use crate::{KEY_LENGTH, NONCE_LENGTH};

pub const KEY_FILE_VERSION: u32 = 1;
const SALT_LENGTH: usize = 32;
const KEY_WRAP_INFO: &[u8] = b"key-wrap";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    pub nonce: String,
    pub ciphertext: String,
}

/// Password-protected master key, as persisted next to the storage root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub version: u32,
    pub salt: String,
    pub iterations: u32,
    pub encrypted_key: WrappedKey,
}

/// AAD binding the wrapped key to the format version and work factor
fn wrap_aad(version: u32, iterations: u32) -> std::result::Result<[u8; 8], SecureFsError> {
    let mut aad = [0u8; 8];
    write_le_u32(version, &mut aad[..4])?;
    write_le_u32(iterations, &mut aad[4..])?;
    Ok(aad)
}

fn wrap_cipher(password_key: &Key, salt: &[u8]) -> std::result::Result<XChaCha20Poly1305, SecureFsError> {
    let wrap_key = derive_subkey(password_key, salt, KEY_WRAP_INFO)?;
    Ok(XChaCha20Poly1305::new(wrap_key.as_bytes().into()))
}

impl KeyFile {
    /// Wrap `master` under `password`. CPU-bound: calibrates and runs PBKDF2.
    pub fn seal(
        master: &Key,
        password: &[u8],
        kdf: KdfConfig,
    ) -> std::result::Result<Self, SecureFsError> {
        let salt: [u8; SALT_LENGTH] = random_array();
        let (password_key, iterations) =
            derive_master_key(password, &salt, kdf.min_iterations, kdf.min_seconds)?;
        let cipher = wrap_cipher(&password_key, &salt)?;

        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let aad = wrap_aad(KEY_FILE_VERSION, iterations)?;
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: master.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|e| SecureFsError::key(format!("key wrapping failed: {e}")))?;

        Ok(Self {
            version: KEY_FILE_VERSION,
            salt: hex::encode(salt),
            iterations,
            encrypted_key: WrappedKey {
                nonce: hex::encode(nonce),
                ciphertext: hex::encode(ciphertext),
            },
        })
    }

    /// Re-derive the password key with the stored iteration count and unwrap.
    pub fn open(&self, password: &[u8]) -> std::result::Result<Key, SecureFsError> {
        if self.version != KEY_FILE_VERSION {
            return Err(SecureFsError::format(format!(
                "unsupported key file version: {}",
                self.version
            )));
        }
        let salt = hex::decode(&self.salt)
            .map_err(|e| SecureFsError::format(format!("invalid salt encoding: {e}")))?;
        let nonce_bytes = hex::decode(&self.encrypted_key.nonce)
            .map_err(|e| SecureFsError::format(format!("invalid nonce encoding: {e}")))?;
        let nonce: [u8; NONCE_LENGTH] =
            nonce_bytes
                .as_slice()
                .try_into()
                .map_err(|_| SecureFsError::InvalidLength {
                    expected: NONCE_LENGTH,
                    actual: nonce_bytes.len(),
                })?;
        let ciphertext = hex::decode(&self.encrypted_key.ciphertext)
            .map_err(|e| SecureFsError::format(format!("invalid key encoding: {e}")))?;

        let password_key = derive_key_with_iterations(password, &salt, self.iterations)?;
        let cipher = wrap_cipher(&password_key, &salt)?;
        let aad = wrap_aad(self.version, self.iterations)?;

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    &XNonce::from(nonce),
                    Payload {
                        msg: &ciphertext,
                        aad: &aad,
                    },
                )
                .map_err(|_| {
                    SecureFsError::key("key unwrapping failed: wrong password or corrupted key file")
                })?,
        );
        if plaintext.len() != KEY_LENGTH {
            return Err(SecureFsError::key(format!(
                "unwrapped key has wrong size: {} bytes (expected {})",
                plaintext.len(),
                KEY_LENGTH
            )));
        }
        Key::from_slice(&plaintext)
    }
}

async fn read_key_file(path: &Path) -> Result<KeyFile> {
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading key file {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing key file {}", path.display()))
}

/// Write the key file with owner-only permissions. `replace` swaps an
/// existing file atomically; otherwise an existing file is an error.
async fn write_key_file(path: &Path, key_file: &KeyFile, replace: bool) -> Result<()> {
    let json = serde_json::to_vec_pretty(key_file)?;
    let path_buf = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        use std::fs::OpenOptions;
        use std::io::Write;

        let target = if replace {
            let mut tmp = path_buf.as_os_str().to_owned();
            tmp.push(".tmp");
            std::path::PathBuf::from(tmp)
        } else {
            path_buf.clone()
        };

        let mut options = OpenOptions::new();
        options.write(true);
        if replace {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut f = options
            .open(&target)
            .with_context(|| format!("creating key file {}", target.display()))?;
        f.write_all(&json)?;
        f.sync_all()?;
        if replace {
            std::fs::rename(&target, &path_buf)?;
        }
        Ok::<(), anyhow::Error>(())
    })
    .await??;
    Ok(())
}

/// Session handle owning the master key for the duration of a mount.
///
/// Cloning shares the same key read-only; it is zeroized when the last
/// handle drops.
#[derive(Clone)]
pub struct KeyManager {
    master: Arc<Key>,
    flags: MountFlags,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("master", &"[REDACTED]")
            .field("flags", &self.flags)
            .finish()
    }
}

impl KeyManager {
    pub fn from_master_key(master: Key, flags: MountFlags) -> Self {
        Self {
            master: Arc::new(master),
            flags,
        }
    }

    /// Generate a fresh master key and write it wrapped under `password`.
    pub async fn create(cfg: &Config, password: &[u8]) -> Result<Self> {
        let path = cfg.key_file_path();
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking existence of {}", path.display()))?
        {
            anyhow::bail!("key file {} already exists", path.display());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        info!(path = %path.display(), "generating new master key");
        let master = Key::generate();
        let sealed = {
            let master = master.clone();
            let password = Zeroizing::new(password.to_vec());
            let kdf = cfg.kdf;
            tokio::task::spawn_blocking(move || KeyFile::seal(&master, &password, kdf)).await??
        };
        info!(iterations = sealed.iterations, "derived key-wrapping key");

        write_key_file(&path, &sealed, false).await?;
        Ok(Self::from_master_key(master, cfg.flags))
    }

    /// Unlock the master key from the configured key file.
    pub async fn unlock(cfg: &Config, password: &[u8]) -> Result<Self> {
        let path = cfg.key_file_path();
        let key_file = read_key_file(&path).await?;
        info!(path = %path.display(), iterations = key_file.iterations, "unlocking key file");

        let password = Zeroizing::new(password.to_vec());
        let master = tokio::task::spawn_blocking(move || key_file.open(&password))
            .await?
            .inspect_err(|e| warn!(error = %e, "failed to unlock key file"))?;
        Ok(Self::from_master_key(master, cfg.flags))
    }

    /// Re-wrap the same master key under a new password. Object keys are
    /// unaffected since they derive from the master key alone.
    pub async fn change_password(cfg: &Config, old: &[u8], new: &[u8]) -> Result<()> {
        let km = Self::unlock(cfg, old).await?;
        let master = km.master_key().clone();
        let password = Zeroizing::new(new.to_vec());
        let kdf = cfg.kdf;
        let sealed =
            tokio::task::spawn_blocking(move || KeyFile::seal(&master, &password, kdf)).await??;

        let path = cfg.key_file_path();
        write_key_file(&path, &sealed, true).await?;
        info!(path = %path.display(), iterations = sealed.iterations, "password changed");
        Ok(())
    }

    pub fn master_key(&self) -> &Key {
        &self.master
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    pub fn auth_mode(&self) -> AuthMode {
        AuthMode::from_flags(self.flags)
    }

    /// Open the encryption context for one object
    pub fn open_object<'s, S: BlockStore + ?Sized>(
        &self,
        store: &'s S,
        id: Id,
    ) -> std::result::Result<ObjectContext<'s, S>, SecureFsError> {
        Ok(ObjectContext::open(store, id, &self.master, self.auth_mode())?
            .with_read_only(self.flags.read_only()))
    }
}
