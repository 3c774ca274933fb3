//! Key derivation: passphrase → key via auto-calibrated PBKDF2-HMAC-SHA256,
//! and HKDF-SHA256 expansion of subordinate keys.
//!
//! The PBKDF2 work factor is the larger of a caller floor and whatever count
//! takes `min_seconds` on this host. The host rate is measured once per
//! process; the count actually used is returned so it can be persisted next
//! to the salt, since reproducing the key requires the exact same count.

use std::sync::OnceLock;
use std::time::Instant;

use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::SecureFsError;
use crate::types::Key;
use crate::{Result, KEY_LENGTH, MAC_LENGTH};

/// HKDF-SHA256 can expand to at most 255 hash blocks
pub const MAX_EXPAND_LENGTH: usize = 255 * MAC_LENGTH;

/// Iterations used for the one-off host speed probe
const CALIBRATION_PROBE_ITERATIONS: u32 = 20_000;

/// Measured PBKDF2 iterations per second on this host
static ITERATIONS_PER_SECOND: OnceLock<f64> = OnceLock::new();

fn iterations_per_second() -> f64 {
    *ITERATIONS_PER_SECOND.get_or_init(|| {
        let mut out = [0u8; KEY_LENGTH];
        let start = Instant::now();
        pbkdf2_hmac::<Sha256>(
            b"calibration",
            b"calibration-salt",
            CALIBRATION_PROBE_ITERATIONS,
            &mut out,
        );
        let elapsed = start.elapsed().as_secs_f64().max(1e-6);
        let rate = CALIBRATION_PROBE_ITERATIONS as f64 / elapsed;
        debug!(rate = rate as u64, "calibrated PBKDF2 iterations per second");
        rate
    })
}

/// Iteration count meeting both the floor and the time target
pub fn calibrated_iterations(min_iterations: u32, min_seconds: f64) -> Result<u32> {
    if !min_seconds.is_finite() || min_seconds < 0.0 {
        return Err(SecureFsError::invalid_parameter(format!(
            "min_seconds must be a finite non-negative number, got {min_seconds}"
        )));
    }
    let floor = min_iterations.max(1);
    if min_seconds == 0.0 {
        return Ok(floor);
    }
    let timed = (iterations_per_second() * min_seconds).ceil();
    let timed = if timed >= u32::MAX as f64 {
        u32::MAX
    } else {
        timed as u32
    };
    Ok(floor.max(timed))
}

/// Derive a key from a password, auto-calibrating the iteration count.
///
/// Returns the key and the iteration count actually used.
pub fn derive_master_key(
    password: &[u8],
    salt: &[u8],
    min_iterations: u32,
    min_seconds: f64,
) -> Result<(Key, u32)> {
    let iterations = calibrated_iterations(min_iterations, min_seconds)?;
    let key = derive_key_with_iterations(password, salt, iterations)?;
    Ok((key, iterations))
}

/// Re-derive a key with a known iteration count (no calibration)
pub fn derive_key_with_iterations(password: &[u8], salt: &[u8], iterations: u32) -> Result<Key> {
    if iterations == 0 {
        return Err(SecureFsError::invalid_parameter(
            "iteration count must be at least 1",
        ));
    }
    debug!(iterations, salt_len = salt.len(), "deriving key from password");
    let mut out = Zeroizing::new([0u8; KEY_LENGTH]);
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out[..]);
    Ok(Key::from_bytes(*out))
}

/// HKDF-SHA256 (RFC 5869): extract with `salt`, expand with `info`.
pub fn expand_key(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    out_len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let mut okm = Zeroizing::new(vec![0u8; out_len]);
    expand_key_into(ikm, salt, info, &mut okm)?;
    Ok(okm)
}

pub fn expand_key_into(ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<()> {
    if out.len() > MAX_EXPAND_LENGTH {
        return Err(SecureFsError::LengthExceeded {
            requested: out.len(),
            max: MAX_EXPAND_LENGTH,
        });
    }
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
    hkdf.expand(info, out)
        .map_err(|_| SecureFsError::LengthExceeded {
            requested: out.len(),
            max: MAX_EXPAND_LENGTH,
        })
}

/// Derive a [`Key`] from `master` under a salt and domain label
pub fn derive_subkey(master: &Key, salt: &[u8], info: &[u8]) -> Result<Key> {
    let mut okm = Zeroizing::new([0u8; KEY_LENGTH]);
    expand_key_into(master.as_bytes(), salt, info, &mut okm[..])?;
    Ok(Key::from_bytes(*okm))
}
