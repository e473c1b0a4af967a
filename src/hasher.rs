//! Double-SHA-256 stream hashing used to frame tree digests.

use crate::types::DigestBytes;
use sha2::{Digest, Sha256};

/// Accumulates a byte stream and finalizes it to SHA-256d, the digest the
/// surrounding ledger uses for all of its tree hashing.
#[derive(Clone, Debug, Default)]
pub struct HashWriter {
    engine: Sha256,
}

impl HashWriter {
    /// Creates a writer over the empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes to the stream.
    pub fn write(&mut self, bytes: &[u8]) {
        self.engine.update(bytes);
    }

    /// Consumes the writer and returns SHA-256(SHA-256(stream)).
    pub fn finalize(self) -> DigestBytes {
        Sha256::digest(self.engine.finalize()).into()
    }
}
