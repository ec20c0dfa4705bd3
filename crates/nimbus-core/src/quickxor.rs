//! quickXorHash content hashing.
//!
//! The remote store declares a quickXorHash for every file: a 160-bit
//! checksum where each input byte is XORed into a circular bit
//! register at position `(11 * index) mod 160`, and the total length
//! is XORed into the trailing 64 bits at finalization. The result is
//! exchanged Base64-encoded.
//!
//! Hydration recomputes the hash over the downloaded bytes and
//! compares it to the declared value; the upload manager hashes local
//! content before flushing so the record carries an up-to-date value.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::domain::newtypes::ContentHash;
use crate::domain::DomainError;

/// Width of the hash register in bits.
const WIDTH_IN_BITS: usize = 160;

/// Bit distance between consecutive input bytes in the register.
const SHIFT: usize = 11;

/// Streaming quickXorHash state.
///
/// Mirrors the `update`/`finalize` shape of the `sha2` digests used
/// elsewhere in the workspace so call sites read the same.
#[derive(Debug, Clone)]
pub struct QuickXorHasher {
    register: [u8; WIDTH_IN_BITS / 8],
    bit_pos: usize,
    length: u64,
}

impl QuickXorHasher {
    /// Create a fresh hasher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            register: [0u8; WIDTH_IN_BITS / 8],
            bit_pos: 0,
            length: 0,
        }
    }

    /// Absorb a chunk of input.
    pub fn update(&mut self, data: &[u8]) {
        for &b in data {
            let byte_pos = self.bit_pos / 8;
            let bit_offset = self.bit_pos % 8;

            // XOR the byte in at the current bit offset; bits that
            // spill past the byte boundary wrap into the next register
            // byte (circularly at the register end).
            let spread = (b as u16) << bit_offset;
            self.register[byte_pos] ^= (spread & 0xff) as u8;
            self.register[(byte_pos + 1) % self.register.len()] ^= (spread >> 8) as u8;

            self.bit_pos = (self.bit_pos + SHIFT) % WIDTH_IN_BITS;
        }
        self.length += data.len() as u64;
    }

    /// Finalize: stamp the length into the trailing 64 bits and return
    /// the 20-byte digest.
    #[must_use]
    pub fn finalize(mut self) -> [u8; WIDTH_IN_BITS / 8] {
        let length_bytes = self.length.to_le_bytes();
        let tail = self.register.len() - length_bytes.len();
        for (i, lb) in length_bytes.iter().enumerate() {
            self.register[tail + i] ^= lb;
        }
        self.register
    }

    /// Finalize and Base64-encode, producing the wire form.
    #[must_use]
    pub fn finalize_base64(self) -> String {
        BASE64.encode(self.finalize())
    }

    /// Finalize into a validated [`ContentHash`].
    pub fn finalize_hash(self) -> Result<ContentHash, DomainError> {
        ContentHash::new(self.finalize_base64())
    }

    /// Total bytes absorbed so far.
    #[must_use]
    pub fn bytes_hashed(&self) -> u64 {
        self.length
    }
}

impl Default for QuickXorHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a full in-memory buffer.
#[must_use]
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = QuickXorHasher::new();
    hasher.update(data);
    hasher.finalize_base64()
}

/// Hash a file on disk, streaming in 64 KiB blocks.
pub fn hash_file(path: &std::path::Path) -> std::io::Result<String> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = QuickXorHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_base64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        // Zero bytes, zero length stamp: the digest is all zeros.
        assert_eq!(hash_bytes(b""), "AAAAAAAAAAAAAAAAAAAAAAAAAAA=");
    }

    #[test]
    fn test_single_ff_byte() {
        // 0xFF lands at bit 0; length 1 XORs into register byte 12.
        assert_eq!(hash_bytes(&[0xFF]), "/wAAAAAAAAAAAAAAAQAAAAAAAAA=");
    }

    #[test]
    fn test_two_bytes_cross_boundary() {
        // 'a' at bit 0, 'b' at bit 11 (register bytes 1 and 2).
        assert_eq!(hash_bytes(b"ab"), "YRADAAAAAAAAAAAAAgAAAAAAAAA=");
    }

    #[test]
    fn test_incremental_equals_oneshot() {
        let data = b"The quick brown fox jumps over the lazy dog, repeatedly.";
        let oneshot = hash_bytes(data);

        let mut hasher = QuickXorHasher::new();
        for chunk in data.chunks(7) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize_base64(), oneshot);
    }

    #[test]
    fn test_length_differentiates_zero_padding() {
        // Same register content, different lengths: the length stamp
        // must distinguish them.
        assert_ne!(hash_bytes(&[0u8; 160]), hash_bytes(&[0u8; 320]));
    }

    #[test]
    fn test_register_wraps_past_160_bytes() {
        // Byte 160 maps back to bit 0; the hash must still differ from
        // the 160-byte prefix alone.
        let long = vec![0x41u8; 200];
        let short = vec![0x41u8; 160];
        assert_ne!(hash_bytes(&long), hash_bytes(&short));
    }

    #[test]
    fn test_output_is_valid_content_hash() {
        let mut hasher = QuickXorHasher::new();
        hasher.update(b"hello");
        let hash = hasher.finalize_hash().unwrap();
        assert_eq!(hash.as_str().len(), 28);
    }

    #[test]
    fn test_bytes_hashed_tracks_input() {
        let mut hasher = QuickXorHasher::new();
        hasher.update(b"hel");
        hasher.update(b"lo");
        assert_eq!(hasher.bytes_hashed(), 5);
    }

    #[test]
    fn test_hash_file_matches_hash_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let data = b"file content for hashing";
        std::fs::write(&path, data).unwrap();

        assert_eq!(hash_file(&path).unwrap(), hash_bytes(data));
    }
}
