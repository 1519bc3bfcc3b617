use sha2::{Digest, Sha256};

use crate::TransferError;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Validates a client-supplied digest and returns it in lowercase.
pub fn normalize_digest(digest: &str) -> Result<String, TransferError> {
    let digest = digest.trim();
    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(TransferError::InvalidRequest(format!(
            "digest must be 64 hex characters: {digest:?}"
        )));
    }
    Ok(digest.to_ascii_lowercase())
}

/// Incremental SHA-256 over a byte stream fed in order.
///
/// Cloning snapshots the state, so a digest can be inspected without
/// ending the stream.
#[derive(Clone, Default)]
pub struct DigestEngine {
    hasher: Sha256,
    bytes_hashed: u64,
}

impl DigestEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_hashed += data.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl std::fmt::Debug for DigestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestEngine")
            .field("bytes_hashed", &self.bytes_hashed)
            .finish_non_exhaustive()
    }
}
