//! # SHA-256 Hashing
//!
//! Double SHA-256 for block and message identifiers, and BIP-340 style
//! tagged hashes for domain separated challenges.

use sha2::{Digest, Sha256};

/// 256-bit hash output.
pub type Hash = [u8; 32];

/// Incremental double SHA-256 writer.
///
/// Fields are appended in a fixed order by the caller; the writer itself is
/// format agnostic.
#[derive(Clone, Default)]
pub struct HashWriter {
    inner: Sha256,
}

impl HashWriter {
    /// Create new writer.
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    /// Append raw bytes.
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    /// Append a little-endian u32.
    pub fn update_u32(&mut self, value: u32) -> &mut Self {
        self.inner.update(value.to_le_bytes());
        self
    }

    /// Append a little-endian u64.
    pub fn update_u64(&mut self, value: u64) -> &mut Self {
        self.inner.update(value.to_le_bytes());
        self
    }

    /// Finalize as SHA-256(SHA-256(data)).
    pub fn finalize(self) -> Hash {
        let first = self.inner.finalize();
        Sha256::digest(first).into()
    }
}

/// Double SHA-256 (one-shot).
pub fn sha256d(data: &[u8]) -> Hash {
    let mut writer = HashWriter::new();
    writer.update(data);
    writer.finalize()
}

/// Tagged hash: `SHA-256(SHA-256(tag) || SHA-256(tag) || parts...)`.
pub fn tagged_hash(tag: &[u8], parts: &[&[u8]]) -> Hash {
    let tag_hash = Sha256::digest(tag);
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}
