//! # Attribute Streams
//!
//! An attribute stream is the unit in which one column's values are stored
//! on a B-tree leaf: a self-contained encoded run of (row id, value-or-null)
//! elements, optionally compressed as a whole.
//!
//! ## Stream layout
//!
//! ```text
//! +--------------------+--------------------------------------+
//! | Header (22 bytes)  | Payload (chunk sequence, see chunk.rs)|
//! +--------------------+--------------------------------------+
//! ```
//!
//! Header fields (little-endian):
//!
//! ```text
//! Offset  Size  Field                 Description
//! ------  ----  --------------------  --------------------------------
//! 0       4     size                  Total stream size, header included
//! 4       2     flags                 Bit 0: payload is compressed
//! 6       4     decompressed_size     Payload size after decompression
//! 10      4     decompressed_bufsize  Buffer size to allocate (>= size)
//! 14      8     last_tid              Highest row id in the stream
//! ```
//!
//! When the compressed flag is set the whole payload is one compressed
//! block; a decoder must test the flag and decompress before chunk
//! iteration. An uncompressed stream's `decompressed_size` equals its
//! payload length, so the field doubles as a corruption check in both modes.
//!
//! ## Module layout
//!
//! - `varint`: delta/length integer encoding
//! - `chunk`: the per-chunk element codec
//! - `encoder`: merge + re-encode runs into a stream
//! - `decoder`: chunk-at-a-time decoding

pub mod chunk;
pub mod decoder;
pub mod encoder;
pub mod varint;

pub use chunk::{decode_chunk, encode_chunk, DecodedChunk, CHUNK_MAX_ELEMS};
pub use decoder::{decode_stream, StreamDecoder};
pub use encoder::{encode_stream, merge_items};

use eyre::{ensure, Result};

use crate::types::RowId;

pub const STREAM_HEADER_SIZE: usize = 22;
pub const STREAM_COMPRESSED: u16 = 0x0001;

/// Minimum payload size before compression is attempted.
pub const MIN_COMPRESS_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Total stream size in bytes, header included.
    pub size: u32,
    pub flags: u16,
    pub decompressed_size: u32,
    pub decompressed_bufsize: u32,
    pub last_tid: RowId,
}

impl StreamHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() >= STREAM_HEADER_SIZE,
            "buffer too small for stream header: {} < {}",
            data.len(),
            STREAM_HEADER_SIZE
        );
        Ok(Self {
            size: u32::from_le_bytes(data[0..4].try_into().unwrap()), // INVARIANT: length checked above
            flags: u16::from_le_bytes(data[4..6].try_into().unwrap()),
            decompressed_size: u32::from_le_bytes(data[6..10].try_into().unwrap()),
            decompressed_bufsize: u32::from_le_bytes(data[10..14].try_into().unwrap()),
            last_tid: u64::from_le_bytes(data[14..22].try_into().unwrap()),
        })
    }

    pub fn write_to(&self, data: &mut [u8]) {
        debug_assert!(data.len() >= STREAM_HEADER_SIZE);
        data[0..4].copy_from_slice(&self.size.to_le_bytes());
        data[4..6].copy_from_slice(&self.flags.to_le_bytes());
        data[6..10].copy_from_slice(&self.decompressed_size.to_le_bytes());
        data[10..14].copy_from_slice(&self.decompressed_bufsize.to_le_bytes());
        data[14..22].copy_from_slice(&self.last_tid.to_le_bytes());
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & STREAM_COMPRESSED != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = StreamHeader {
            size: 1000,
            flags: STREAM_COMPRESSED,
            decompressed_size: 4000,
            decompressed_bufsize: 4096,
            last_tid: 99,
        };
        let mut buf = [0u8; STREAM_HEADER_SIZE];
        header.write_to(&mut buf);

        let restored = StreamHeader::from_bytes(&buf).unwrap();
        assert_eq!(restored, header);
        assert!(restored.is_compressed());
    }

    #[test]
    fn header_too_small_is_error() {
        assert!(StreamHeader::from_bytes(&[0u8; 10]).is_err());
    }
}
