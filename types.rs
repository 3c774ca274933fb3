//! Fixed-size key and identifier types.
//!
//! [`Key`] holds secret material: constant-time equality, redacted `Debug`,
//! zeroized on drop. [`Id`] is a public identifier with ordinary equality and
//! hashing so it can key maps and sets.

use std::fmt;
use std::str::FromStr;

use zeroize::Zeroize;

use crate::error::SecureFsError;
use crate::util::{ct_eq, random_array};
use crate::{Result, ID_LENGTH, KEY_LENGTH};

/// A 256-bit key. Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct Key {
    bytes: [u8; KEY_LENGTH],
}

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| SecureFsError::InvalidLength {
                    expected: KEY_LENGTH,
                    actual: bytes.len(),
                })?;
        Ok(Self { bytes })
    }

    /// Generate a random key from the OS CSPRNG
    pub fn generate() -> Self {
        Self {
            bytes: random_array(),
        }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.bytes
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        ct_eq(&self.bytes, &other.bytes)
    }
}

impl Eq for Key {}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key").field("bytes", &"[REDACTED]").finish()
    }
}

/// Identifier of one object's content stream in the underlying store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; ID_LENGTH]);

impl Id {
    pub const fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; ID_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| SecureFsError::InvalidLength {
                    expected: ID_LENGTH,
                    actual: bytes.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Fresh random identifier for a newly created object
    pub fn generate() -> Self {
        Self(random_array())
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.to_hex())
    }
}

impl FromStr for Id {
    type Err = SecureFsError;

    fn from_str(s: &str) -> Result<Self> {
        // Lowercase only, so a parsed id always maps back to the same name
        if s.len() != ID_LENGTH * 2
            || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(SecureFsError::MalformedIdentifier(s.to_string()));
        }
        let mut bytes = [0u8; ID_LENGTH];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| SecureFsError::MalformedIdentifier(s.to_string()))?;
        Ok(Self(bytes))
    }
}
