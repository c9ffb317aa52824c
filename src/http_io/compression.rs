//! Block compression (§4.4): "Deflate with a configurable level; objects shorter than a
//! threshold are stored raw."

use crate::error::{Result, StoreError};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compresses `data` at `level` (0-9). Callers are expected to have already checked
/// `data.len()` against the configured threshold.
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data)?;
    encoder.finish().map_err(StoreError::from)
}

/// Decompresses `data`, which must inflate to exactly `original_len` bytes; a shorter or
/// longer result is an integrity failure rather than silently truncating or growing the
/// block.
pub fn decompress(data: &[u8], original_len: usize) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(original_len);
    decoder.read_to_end(&mut out)?;
    if out.len() != original_len {
        return Err(StoreError::integrity(format!(
            "decompressed length {} does not match expected length {}",
            out.len(),
            original_len
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let compressed = compress(&data, 6).unwrap();
        assert!(compressed.len() < data.len());
        let restored = decompress(&compressed, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn wrong_expected_length_is_integrity_error() {
        let data = vec![7u8; 4096];
        let compressed = compress(&data, 6).unwrap();
        let err = decompress(&compressed, data.len() - 1).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Integrity);
    }
}
