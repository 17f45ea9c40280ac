//! Chunk-at-a-time stream decoding.
//!
//! `StreamDecoder::begin` validates the header and decompresses the payload
//! when flagged; `next_chunk` then walks the chunk sequence forward, each
//! chunk anchored at its predecessor's last row id. The decoder checks the
//! continuity invariants as it goes and reports violations as corruption
//! rather than producing garbage items.

use eyre::{ensure, Result};

use super::chunk::{decode_chunk, DecodedChunk};
use super::{StreamHeader, STREAM_HEADER_SIZE};
use crate::compress::Compression;
use crate::types::{AttrDesc, RowId, StreamItem};

pub struct StreamDecoder {
    desc: AttrDesc,
    payload: Vec<u8>,
    pos: usize,
    prev_tid: RowId,
    header: StreamHeader,
}

impl StreamDecoder {
    /// Parses the stream header, decompressing the payload if flagged.
    pub fn begin(
        bytes: &[u8],
        desc: AttrDesc,
        compression: &dyn Compression,
    ) -> Result<StreamDecoder> {
        let header = StreamHeader::from_bytes(bytes)?;
        ensure!(
            header.size as usize == bytes.len(),
            "corrupt stream: header size {} != buffer size {}",
            header.size,
            bytes.len()
        );
        ensure!(
            header.decompressed_size <= header.decompressed_bufsize,
            "corrupt stream: decompressed size {} exceeds declared bufsize {}",
            header.decompressed_size,
            header.decompressed_bufsize
        );

        let stored = &bytes[STREAM_HEADER_SIZE..];
        let payload = if header.is_compressed() {
            compression.decompress(stored, header.decompressed_size as usize)?
        } else {
            ensure!(
                stored.len() == header.decompressed_size as usize,
                "corrupt stream: raw payload is {} bytes, header says {}",
                stored.len(),
                header.decompressed_size
            );
            stored.to_vec()
        };

        Ok(StreamDecoder {
            desc,
            payload,
            pos: 0,
            prev_tid: 0,
            header,
        })
    }

    /// The last row id covered by the stream, per the header.
    pub fn last_tid(&self) -> RowId {
        self.header.last_tid
    }

    pub fn is_compressed(&self) -> bool {
        self.header.is_compressed()
    }

    /// Position of the decode cursor within the decompressed payload.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// The decompressed payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decodes the next chunk, or returns `None` at the end of the payload.
    /// The final chunk must land exactly on the header's last row id.
    pub fn next_chunk(&mut self) -> Result<Option<DecodedChunk>> {
        if self.pos >= self.payload.len() {
            ensure!(
                self.prev_tid == self.header.last_tid,
                "corrupt stream: chunks end at row id {}, header says {}",
                self.prev_tid,
                self.header.last_tid
            );
            return Ok(None);
        }

        let chunk = decode_chunk(&self.payload[self.pos..], self.prev_tid, &self.desc)?;
        ensure!(
            chunk.last_tid <= self.header.last_tid,
            "corrupt stream: chunk reaches row id {} past header last id {}",
            chunk.last_tid,
            self.header.last_tid
        );
        self.pos += chunk.consumed;
        self.prev_tid = chunk.last_tid;
        Ok(Some(chunk))
    }
}

/// Decodes a whole stream into items. An empty slice decodes to no items.
pub fn decode_stream(
    bytes: &[u8],
    desc: &AttrDesc,
    compression: &dyn Compression,
) -> Result<Vec<StreamItem>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let mut decoder = StreamDecoder::begin(bytes, *desc, compression)?;
    let mut items = Vec::new();
    while let Some(chunk) = decoder.next_chunk()? {
        items.extend(chunk.items);
    }
    Ok(items)
}
