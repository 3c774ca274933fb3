//! HMAC-SHA256, the one keyed primitive behind block tags and HKDF.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::MAC_LENGTH;

type HmacSha256 = Hmac<Sha256>;

/// An HMAC-SHA256 authentication tag
pub type Tag = [u8; MAC_LENGTH];

fn keyed(key: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length
    <HmacSha256 as Mac>::new_from_slice(key)
        .expect("BUG: HMAC-SHA256 accepts keys of any length, this should never fail")
}

pub fn mac(key: &[u8], message: &[u8]) -> Tag {
    mac_parts(key, &[message])
}

/// MAC over the concatenation of `parts`, without building the concatenation
pub fn mac_parts(key: &[u8], parts: &[&[u8]]) -> Tag {
    let mut h = keyed(key);
    for part in parts {
        h.update(part);
    }
    h.finalize().into_bytes().into()
}

/// Constant-time tag check
pub fn verify_mac(key: &[u8], message: &[u8], tag: &[u8]) -> bool {
    verify_mac_parts(key, &[message], tag)
}

pub fn verify_mac_parts(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
    if tag.len() != MAC_LENGTH {
        return false;
    }
    let mut h = keyed(key);
    for part in parts {
        h.update(part);
    }
    h.verify_slice(tag).is_ok()
}
