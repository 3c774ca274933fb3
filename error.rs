use thiserror::Error;

use crate::types::Id;

/// Custom error types for SecureFS operations
#[derive(Debug, Error)]
pub enum SecureFsError {
    /// Tag verification failed; no plaintext is released for this block
    #[error("authentication failed for object {id} block {block}")]
    AuthenticationFailure { id: Id, block: u64 },

    /// Requested key expansion output is longer than HKDF can produce
    #[error("requested {requested} bytes of key material, at most {max} supported")]
    LengthExceeded { requested: usize, max: usize },

    /// A name that does not parse as a 32-byte hex identifier
    #[error("malformed identifier: {0}")]
    MalformedIdentifier(String),

    /// Fixed-width value built from a slice of the wrong length
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Plaintext handed to the block codec exceeds one block
    #[error("block of {0} bytes exceeds the block size")]
    BlockTooLarge(usize),

    /// Key derivation parameters that cannot be honoured
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Write attempted on a read-only mount
    #[error("mount is read-only")]
    ReadOnly,

    /// Key-related errors (wrong password, corrupted key file)
    #[error("Key error: {0}")]
    Key(String),

    /// Underlying byte store and I/O errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// On-disk format errors (version mismatch, corrupted records)
    #[error("Format error: {0}")]
    Format(String),
}

impl SecureFsError {
    pub fn key(msg: impl Into<String>) -> Self {
        Self::Key(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// True for integrity failures, which callers must treat as corruption
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailure { .. })
    }
}

impl From<std::io::Error> for SecureFsError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SecureFsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Format(err.to_string())
    }
}
