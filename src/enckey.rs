//! Content-encryption key derivation
//!
//! Each component may run with at-rest encryption of its working
//! directory. The 256-bit key is derived by SHA-256 over a user-supplied
//! passphrase. The worker holds at most one key at a time and replaces it
//! on every `execute` that carries a new passphrase; the previous buffer
//! is wiped when it is dropped.

use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Sentinel placed in the `execute` payload when no key is configured.
pub const NO_KEY: &str = "NULL";

/// A derived 256-bit content-encryption key.
///
/// The raw bytes are zeroized on drop.
pub struct ContentKey {
    key: [u8; 32],
}

impl ContentKey {
    /// Derives a key from a passphrase: SHA-256 over the passphrase bytes.
    pub fn derive(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// The raw key material, consumed by the component runtime.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl Drop for ContentKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("ContentKey(..)")
    }
}
