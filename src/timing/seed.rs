//! Stable seeds derived from creator identity and time.
//!
//! Seeds are the first 8 bytes (big-endian) of a SHA-256 digest over a
//! versioned payload in which every part is prefixed with its byte length. The same inputs produce the same seed in
//! every process, on every platform.

use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};

/// Bumping this changes every seed the crate produces.
pub const SEED_VERSION: &str = "seed-v2";

/// Namespace for jitter offsets.
pub const JITTER_NAMESPACE: &str = "jitter";
/// Namespace for follow-up delays.
pub const FOLLOWUP_NAMESPACE: &str = "followup";
/// Namespace for rotation decisions.
pub const ROTATION_NAMESPACE: &str = "rotation";

/// Derive a seed from `(namespace, creator_id, timestamp)`.
///
/// Only the minute of `timestamp` contributes; seconds are ignored.
pub fn seed(namespace: &str, creator_id: &str, timestamp: NaiveDateTime) -> u64 {
    let minute = timestamp.format("%Y-%m-%dT%H:%M").to_string();
    stable_hash(&[namespace, creator_id, &minute])
}

/// Hash an arbitrary list of string parts with the seed construction.
pub fn stable_hash(parts: &[&str]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(SEED_VERSION.as_bytes());
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
