//! Stable hashing for deterministic resource names.

use sha2::{Digest, Sha256};

/// Compute the hex SHA256 digest of a string.
pub fn sha256_str(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash `parts` joined with `:` and keep the first `len` hex characters.
///
/// The same inputs always give the same digest, across runs and hosts.
pub fn stable_digest(parts: &[&str], len: usize) -> String {
    let mut digest = sha256_str(&parts.join(":"));
    digest.truncate(len);
    digest
}
