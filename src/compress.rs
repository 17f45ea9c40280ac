//! Whole-buffer compression behind a narrow trait.
//!
//! Attribute streams compress their entire chunk payload as one block, and
//! toast slices compress each slice independently; both record the exact
//! decompressed size next to the compressed bytes, so decompression is done
//! with a known output size and anything else is treated as corruption.
//!
//! The engine ships LZ4 block compression (`lz4_flex`) and a no-op
//! implementation for embedders that want raw storage. The trait is the seam:
//! nothing else in the crate names a compression crate.

use eyre::{ensure, eyre, Result};

pub trait Compression {
    /// Compresses `data`. Returns `None` when compression is not worthwhile
    /// (output would not be smaller); callers then store the input raw.
    fn compress(&self, data: &[u8]) -> Option<Vec<u8>>;

    /// Decompresses `data` into exactly `decompressed_len` bytes.
    fn decompress(&self, data: &[u8], decompressed_len: usize) -> Result<Vec<u8>>;
}

/// LZ4 block compression. The default for streams and toast slices.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compression;

impl Compression for Lz4Compression {
    fn compress(&self, data: &[u8]) -> Option<Vec<u8>> {
        let compressed = lz4_flex::compress(data);
        if compressed.len() < data.len() {
            Some(compressed)
        } else {
            None
        }
    }

    fn decompress(&self, data: &[u8], decompressed_len: usize) -> Result<Vec<u8>> {
        let out = lz4_flex::decompress(data, decompressed_len)
            .map_err(|e| eyre!("lz4 decompression failed: {}", e))?;
        ensure!(
            out.len() == decompressed_len,
            "decompressed size mismatch: expected {}, got {}",
            decompressed_len,
            out.len()
        );
        Ok(out)
    }
}

/// Stores everything raw. `compress` always declines.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl Compression for NoCompression {
    fn compress(&self, _data: &[u8]) -> Option<Vec<u8>> {
        None
    }

    fn decompress(&self, data: &[u8], decompressed_len: usize) -> Result<Vec<u8>> {
        ensure!(
            data.len() == decompressed_len,
            "raw payload size mismatch: expected {}, got {}",
            decompressed_len,
            data.len()
        );
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_roundtrip_compressible_data() {
        let data = vec![7u8; 4096];
        let compressed = Lz4Compression.compress(&data).expect("should shrink");
        assert!(compressed.len() < data.len());

        let restored = Lz4Compression.decompress(&compressed, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn lz4_declines_incompressible_data() {
        // Tiny inputs gain a literal-run header and never shrink.
        assert!(Lz4Compression.compress(&[1, 2, 3]).is_none());
    }

    #[test]
    fn lz4_rejects_wrong_decompressed_len() {
        let data = vec![7u8; 4096];
        let compressed = Lz4Compression.compress(&data).unwrap();
        assert!(Lz4Compression.decompress(&compressed, 17).is_err());
    }

    #[test]
    fn no_compression_passthrough() {
        assert!(NoCompression.compress(&[0u8; 1000]).is_none());
        let restored = NoCompression.decompress(b"abc", 3).unwrap();
        assert_eq!(restored, b"abc");
        assert!(NoCompression.decompress(b"abc", 4).is_err());
    }
}
