//! Fixed-width binary primitives.
//!
//! Endian codecs over byte slices, constant-time comparison and OS randomness.
//! Everything the on-disk layout serializes goes through these helpers.

use rand_core::{OsRng, RngCore};
use subtle::ConstantTimeEq;

use crate::error::SecureFsError;
use crate::Result;

fn check_len(buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() < expected {
        return Err(SecureFsError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Write `value` little-endian into the first 8 bytes of `out`
pub fn write_le_u64(value: u64, out: &mut [u8]) -> Result<()> {
    check_len(out, 8)?;
    out[..8].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Read a little-endian u64 from the first 8 bytes of `input`
pub fn read_le_u64(input: &[u8]) -> Result<u64> {
    check_len(input, 8)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&input[..8]);
    Ok(u64::from_le_bytes(bytes))
}

pub fn write_be_u64(value: u64, out: &mut [u8]) -> Result<()> {
    check_len(out, 8)?;
    out[..8].copy_from_slice(&value.to_be_bytes());
    Ok(())
}

pub fn read_be_u64(input: &[u8]) -> Result<u64> {
    check_len(input, 8)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&input[..8]);
    Ok(u64::from_be_bytes(bytes))
}

pub fn write_le_u32(value: u32, out: &mut [u8]) -> Result<()> {
    check_len(out, 4)?;
    out[..4].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn read_le_u32(input: &[u8]) -> Result<u32> {
    check_len(input, 4)?;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&input[..4]);
    Ok(u32::from_le_bytes(bytes))
}

pub fn write_be_u32(value: u32, out: &mut [u8]) -> Result<()> {
    check_len(out, 4)?;
    out[..4].copy_from_slice(&value.to_be_bytes());
    Ok(())
}

pub fn read_be_u32(input: &[u8]) -> Result<u32> {
    check_len(input, 4)?;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&input[..4]);
    Ok(u32::from_be_bytes(bytes))
}

pub fn is_all_zeros(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0)
}

/// Constant-time equality. Slices of different length compare unequal
/// (the length itself is not secret).
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}
