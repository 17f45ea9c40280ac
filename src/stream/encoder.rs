//! Stream encoding: merge a sorted run into an existing stream and re-encode.
//!
//! Encoding always rebuilds the whole stream. That sounds heavy but is the
//! point of the two-streams-per-leaf design: writes land in a small insert
//! buffer whose re-encode cost is trivial, and the large base stream is only
//! rebuilt on compaction.

use eyre::{ensure, Result};

use super::chunk::{encode_chunk, CHUNK_MAX_ELEMS};
use super::decoder::decode_stream;
use super::{StreamHeader, MIN_COMPRESS_SIZE, STREAM_COMPRESSED, STREAM_HEADER_SIZE};
use crate::compress::Compression;
use crate::types::{AttrDesc, StreamItem};

/// Merges `new` into `existing` (both sorted by tid, strictly increasing).
/// On tid collision the new item wins; this is how updates overwrite.
pub fn merge_items(existing: Vec<StreamItem>, new: &[StreamItem]) -> Vec<StreamItem> {
    if existing.is_empty() {
        return new.to_vec();
    }
    if new.is_empty() {
        return existing;
    }

    let mut merged = Vec::with_capacity(existing.len() + new.len());
    let mut old_iter = existing.into_iter().peekable();
    let mut new_iter = new.iter().peekable();

    loop {
        match (old_iter.peek(), new_iter.peek()) {
            (Some(o), Some(n)) => {
                if o.tid < n.tid {
                    merged.push(old_iter.next().unwrap());
                } else if o.tid > n.tid {
                    merged.push(new_iter.next().unwrap().clone());
                } else {
                    old_iter.next();
                    merged.push(new_iter.next().unwrap().clone());
                }
            }
            (Some(_), None) => merged.push(old_iter.next().unwrap()),
            (None, Some(_)) => merged.push(new_iter.next().unwrap().clone()),
            (None, None) => break,
        }
    }
    merged
}

/// Encodes a sorted item run as a complete stream. Returns an empty vec for
/// an empty run (an absent stream).
pub fn encode_items(
    items: &[StreamItem],
    desc: &AttrDesc,
    compression: &dyn Compression,
    allow_compress: bool,
) -> Result<Vec<u8>> {
    if items.is_empty() {
        return Ok(Vec::new());
    }
    for pair in items.windows(2) {
        ensure!(
            pair[0].tid < pair[1].tid,
            "stream run must be strictly increasing: {} then {}",
            pair[0].tid,
            pair[1].tid
        );
    }

    let mut payload = Vec::new();
    let mut prev_tid = 0;
    for group in items.chunks(CHUNK_MAX_ELEMS) {
        encode_chunk(&mut payload, group, prev_tid, desc)?;
        prev_tid = group.last().unwrap().tid; // INVARIANT: chunks() groups are non-empty
    }

    let last_tid = items.last().unwrap().tid;
    let mut flags = 0;
    let decompressed_size = payload.len() as u32;

    let stored = if allow_compress && payload.len() >= MIN_COMPRESS_SIZE {
        match compression.compress(&payload) {
            Some(compressed) => {
                flags |= STREAM_COMPRESSED;
                compressed
            }
            None => payload,
        }
    } else {
        payload
    };

    let mut out = vec![0u8; STREAM_HEADER_SIZE + stored.len()];
    StreamHeader {
        size: out.len() as u32,
        flags,
        decompressed_size,
        decompressed_bufsize: decompressed_size,
        last_tid,
    }
    .write_to(&mut out);
    out[STREAM_HEADER_SIZE..].copy_from_slice(&stored);
    Ok(out)
}

/// Decodes `existing` (empty slice or `None` = absent), merges `items` into
/// it, and re-encodes: existing bytes + ordered run in, stream bytes out.
pub fn encode_stream(
    existing: Option<&[u8]>,
    items: &[StreamItem],
    desc: &AttrDesc,
    compression: &dyn Compression,
    allow_compress: bool,
) -> Result<Vec<u8>> {
    let old = match existing {
        Some(bytes) if !bytes.is_empty() => decode_stream(bytes, desc, compression)?,
        _ => Vec::new(),
    };
    let merged = merge_items(old, items);
    encode_items(&merged, desc, compression, allow_compress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{Lz4Compression, NoCompression};

    fn varlen() -> AttrDesc {
        AttrDesc::variable(1)
    }

    fn run(tids: &[u64]) -> Vec<StreamItem> {
        tids.iter()
            .map(|&t| StreamItem::new(t, Some(t.to_le_bytes().to_vec())))
            .collect()
    }

    #[test]
    fn merge_interleaves_and_shadows() {
        let old = run(&[1, 3, 5]);
        let mut new = run(&[2, 3]);
        new[1].value = Some(b"updated".to_vec());

        let merged = merge_items(old, &new);
        let tids: Vec<u64> = merged.iter().map(|i| i.tid).collect();
        assert_eq!(tids, vec![1, 2, 3, 5]);
        assert_eq!(merged[2].value.as_deref(), Some(b"updated".as_ref()));
    }

    #[test]
    fn empty_run_encodes_to_empty_stream() {
        let bytes = encode_items(&[], &varlen(), &NoCompression, false).unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn unsorted_run_is_rejected() {
        let items = vec![StreamItem::new(5, None), StreamItem::new(3, None)];
        assert!(encode_items(&items, &varlen(), &NoCompression, false).is_err());
    }

    #[test]
    fn encode_merges_into_existing_stream() {
        let first = encode_items(&run(&[1, 2]), &varlen(), &NoCompression, false).unwrap();
        let second =
            encode_stream(Some(&first), &run(&[3, 4]), &varlen(), &NoCompression, false).unwrap();

        let items = decode_stream(&second, &varlen(), &NoCompression).unwrap();
        let tids: Vec<u64> = items.iter().map(|i| i.tid).collect();
        assert_eq!(tids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn compression_flag_set_only_when_it_shrinks() {
        // Highly repetitive values compress well.
        let items: Vec<StreamItem> = (1..=200)
            .map(|t| StreamItem::new(t, Some(vec![0xAB; 40])))
            .collect();
        let bytes = encode_items(&items, &varlen(), &Lz4Compression, true).unwrap();
        let header = StreamHeader::from_bytes(&bytes).unwrap();
        assert!(header.is_compressed());
        assert!((header.decompressed_size as usize) > bytes.len() - STREAM_HEADER_SIZE);

        // A tiny run stays raw.
        let bytes = encode_items(&run(&[1]), &varlen(), &Lz4Compression, true).unwrap();
        assert!(!StreamHeader::from_bytes(&bytes).unwrap().is_compressed());
    }

    #[test]
    fn multi_chunk_streams_split_at_max_elems() {
        let items = run(&(1..=300).collect::<Vec<u64>>());
        let bytes = encode_items(&items, &varlen(), &NoCompression, false).unwrap();
        let decoded = decode_stream(&bytes, &varlen(), &NoCompression).unwrap();
        assert_eq!(decoded, items);
    }
}
