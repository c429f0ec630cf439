//! Credential proofs and identifiers.
//!
//! Tokens and secrets never travel in the clear. A proof is
//! `blake3(key || ":" || timestamp)` in hex, and proofs are compared in
//! constant time.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::{RngExt, rng};
use subtle::ConstantTimeEq;

/// Maximum accepted clock skew for signed timestamps.
pub const MAX_TIMESTAMP_SKEW_SECS: u64 = 15 * 60;

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub fn sign(key: &str, timestamp: i64) -> String {
    let mut h = blake3::Hasher::new();
    h.update(key.as_bytes());
    h.update(b":");
    h.update(timestamp.to_string().as_bytes());
    h.finalize().to_hex().to_string()
}

/// Verifies that `proof` was produced by [`sign`] with the same key and timestamp.
pub fn verify(key: &str, timestamp: i64, proof: &str) -> bool {
    secrets_match(&sign(key, timestamp), proof)
}

pub fn timestamp_fresh(timestamp: i64, now: i64) -> bool {
    now.abs_diff(timestamp) <= MAX_TIMESTAMP_SKEW_SECS
}

/// Constant-time equality of two secrets of any length.
///
/// Both sides are hashed first so the comparison runs over equal-length
/// digests and does not leak the secret length.
pub fn secrets_match(a: &str, b: &str) -> bool {
    let ha = blake3::hash(a.as_bytes());
    let hb = blake3::hash(b.as_bytes());
    ct_eq(ha.as_bytes(), hb.as_bytes())
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rng().fill(&mut buf[..]);
    let mut out = String::with_capacity(n * 2);
    for b in buf {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

pub fn new_run_id() -> String {
    random_hex(16)
}

pub fn new_peering_id() -> String {
    random_hex(12)
}

pub fn new_request_id() -> u64 {
    rng().random::<u64>()
}
