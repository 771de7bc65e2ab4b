//! Digest primitive used to verify fetched data
//!
//! The cache treats the hash function as an external collaborator: anything
//! that can map a byte buffer to a fixed-size digest will do. [`Sha256Digest`]
//! is the stock implementation; tests substitute instrumented primitives to
//! observe verification order or inject mismatches.

use sha2::{Digest, Sha256};

/// Fixed digest size, in bytes, used throughout the hash hierarchy.
pub const DIGEST_LEN: usize = 32;

/// A fixed-size cryptographic digest over a byte buffer.
pub trait DigestPrimitive: Send + Sync {
    fn compute(&self, data: &[u8]) -> [u8; DIGEST_LEN];
}

/// SHA-256 digest primitive.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Digest;

impl DigestPrimitive for Sha256Digest {
    fn compute(&self, data: &[u8]) -> [u8; DIGEST_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }
}
