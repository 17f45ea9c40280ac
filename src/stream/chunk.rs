//! # Chunk Codec
//!
//! A stream's payload is a sequence of chunks, each covering a contiguous
//! run of row ids. Chunks are self-delimiting given the attribute descriptor
//! and the previous chunk's last row id:
//!
//! ```text
//! count        varint, >= 1 (a zero-element chunk is corruption)
//! first delta  varint, >= 1; first_tid = prev_tid + delta
//! deltas       (count - 1) varints, each >= 1
//! null bitmap  ceil(count / 8) bytes, set bit = null
//! values       non-null elements only, in tid order:
//!                fixed-width: fixed_len raw bytes each
//!                variable:    varint length + bytes
//! ```
//!
//! Delta-encoding against `prev_tid` is what lets a decoder walk a stream
//! front to back without backtracking: each chunk hands the next one its
//! anchor. Row ids are strictly increasing within and across chunks by
//! construction (every delta is at least 1).

use eyre::{bail, ensure, Result};

use super::varint::{get_varint, put_varint};
use crate::types::{AttrDesc, RowId, StreamItem};

/// Upper bound on elements per chunk. Keeps the per-chunk tid array small
/// enough to re-encode cheaply during insert-buffer merges.
pub const CHUNK_MAX_ELEMS: usize = 128;

/// A decoded chunk plus the bookkeeping needed to continue the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedChunk {
    pub prev_tid: RowId,
    pub first_tid: RowId,
    pub last_tid: RowId,
    pub items: Vec<StreamItem>,
    /// Bytes consumed from the payload by this chunk.
    pub consumed: usize,
}

/// Appends one chunk covering `items` to `out`. `items` must be non-empty,
/// sorted, and strictly above `prev_tid`.
pub fn encode_chunk(
    out: &mut Vec<u8>,
    items: &[StreamItem],
    prev_tid: RowId,
    desc: &AttrDesc,
) -> Result<()> {
    ensure!(!items.is_empty(), "refusing to encode an empty chunk");
    ensure!(
        items.len() <= CHUNK_MAX_ELEMS,
        "chunk of {} elements exceeds maximum {}",
        items.len(),
        CHUNK_MAX_ELEMS
    );

    put_varint(out, items.len() as u64);

    let mut last = prev_tid;
    for item in items {
        ensure!(
            item.tid > last,
            "row ids must be strictly increasing: {} after {}",
            item.tid,
            last
        );
        put_varint(out, item.tid - last);
        last = item.tid;
    }

    let mut bitmap = vec![0u8; items.len().div_ceil(8)];
    for (i, item) in items.iter().enumerate() {
        if item.is_null() {
            bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    out.extend_from_slice(&bitmap);

    for item in items {
        if let Some(value) = &item.value {
            desc.check_value(value)?;
            if desc.is_variable() {
                put_varint(out, value.len() as u64);
            }
            out.extend_from_slice(value);
        }
    }

    Ok(())
}

/// Decodes the chunk at the front of `buf`, anchored at `prev_tid`.
pub fn decode_chunk(buf: &[u8], prev_tid: RowId, desc: &AttrDesc) -> Result<DecodedChunk> {
    let mut pos = 0;

    let (count, n) = get_varint(buf)?;
    pos += n;
    if count == 0 {
        bail!("corrupt stream: zero-element chunk");
    }
    ensure!(
        count as usize <= CHUNK_MAX_ELEMS,
        "corrupt stream: chunk claims {} elements (maximum {})",
        count,
        CHUNK_MAX_ELEMS
    );
    let count = count as usize;

    let mut tids = Vec::with_capacity(count);
    let mut last = prev_tid;
    for _ in 0..count {
        ensure!(pos < buf.len(), "corrupt stream: truncated tid deltas");
        let (delta, n) = get_varint(&buf[pos..])?;
        pos += n;
        ensure!(delta >= 1, "corrupt stream: non-increasing row id delta");
        last = last
            .checked_add(delta)
            .ok_or_else(|| eyre::eyre!("corrupt stream: row id overflow"))?;
        tids.push(last);
    }

    let bitmap_len = count.div_ceil(8);
    ensure!(
        pos + bitmap_len <= buf.len(),
        "corrupt stream: truncated null bitmap"
    );
    let bitmap = &buf[pos..pos + bitmap_len];
    pos += bitmap_len;

    let mut items = Vec::with_capacity(count);
    for (i, &tid) in tids.iter().enumerate() {
        let is_null = bitmap[i / 8] & (1 << (i % 8)) != 0;
        if is_null {
            items.push(StreamItem::new(tid, None));
            continue;
        }

        let len = match desc.fixed_len {
            Some(len) => len as usize,
            None => {
                ensure!(pos < buf.len(), "corrupt stream: truncated value length");
                let (len, n) = get_varint(&buf[pos..])?;
                pos += n;
                usize::try_from(len)
                    .map_err(|_| eyre::eyre!("corrupt stream: value length {} overflows", len))?
            }
        };
        ensure!(
            pos.checked_add(len).is_some_and(|end| end <= buf.len()),
            "corrupt stream: value extends past chunk buffer ({} + {} > {})",
            pos,
            len,
            buf.len()
        );
        items.push(StreamItem::new(tid, Some(buf[pos..pos + len].to_vec())));
        pos += len;
    }

    Ok(DecodedChunk {
        prev_tid,
        first_tid: tids[0],
        last_tid: *tids.last().unwrap(), // INVARIANT: count >= 1
        items,
        consumed: pos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varlen() -> AttrDesc {
        AttrDesc::variable(1)
    }

    fn fixed8() -> AttrDesc {
        AttrDesc::fixed(1, 8, true)
    }

    #[test]
    fn varlen_roundtrip_with_null() {
        let items = vec![
            StreamItem::new(10, Some(b"a".to_vec())),
            StreamItem::new(11, None),
            StreamItem::new(12, Some(b"ccc".to_vec())),
        ];

        let mut buf = Vec::new();
        encode_chunk(&mut buf, &items, 0, &varlen()).unwrap();

        let chunk = decode_chunk(&buf, 0, &varlen()).unwrap();
        assert_eq!(chunk.first_tid, 10);
        assert_eq!(chunk.last_tid, 12);
        assert_eq!(chunk.items, items);
        assert_eq!(chunk.consumed, buf.len());
    }

    #[test]
    fn fixed_width_roundtrip() {
        let items: Vec<StreamItem> = (1..=5)
            .map(|i| StreamItem::new(i, Some((i as u64).to_le_bytes().to_vec())))
            .collect();

        let mut buf = Vec::new();
        encode_chunk(&mut buf, &items, 0, &fixed8()).unwrap();

        let chunk = decode_chunk(&buf, 0, &fixed8()).unwrap();
        assert_eq!(chunk.items, items);
    }

    #[test]
    fn anchor_carries_across_chunks() {
        let first = vec![StreamItem::new(100, Some(b"x".to_vec()))];
        let second = vec![StreamItem::new(200, Some(b"y".to_vec()))];

        let mut buf = Vec::new();
        encode_chunk(&mut buf, &first, 0, &varlen()).unwrap();
        encode_chunk(&mut buf, &second, 100, &varlen()).unwrap();

        let c1 = decode_chunk(&buf, 0, &varlen()).unwrap();
        assert_eq!(c1.last_tid, 100);
        let c2 = decode_chunk(&buf[c1.consumed..], c1.last_tid, &varlen()).unwrap();
        assert_eq!(c2.prev_tid, 100);
        assert_eq!(c2.first_tid, 200);
    }

    #[test]
    fn zero_element_chunk_is_corruption() {
        let buf = vec![0u8];
        let err = decode_chunk(&buf, 0, &varlen()).unwrap_err();
        assert!(err.to_string().contains("zero-element"));
    }

    #[test]
    fn non_increasing_tids_rejected_at_encode() {
        let items = vec![
            StreamItem::new(5, Some(b"a".to_vec())),
            StreamItem::new(5, Some(b"b".to_vec())),
        ];
        let mut buf = Vec::new();
        assert!(encode_chunk(&mut buf, &items, 0, &varlen()).is_err());
        // Also below the anchor.
        let items = vec![StreamItem::new(3, None)];
        assert!(encode_chunk(&mut buf, &items, 3, &varlen()).is_err());
    }

    #[test]
    fn truncated_values_are_corruption() {
        let items = vec![StreamItem::new(1, Some(vec![7u8; 50]))];
        let mut buf = Vec::new();
        encode_chunk(&mut buf, &items, 0, &varlen()).unwrap();

        assert!(decode_chunk(&buf[..buf.len() - 1], 0, &varlen()).is_err());
    }

    #[test]
    fn wrong_fixed_width_rejected_at_encode() {
        let items = vec![StreamItem::new(1, Some(vec![0u8; 4]))];
        let mut buf = Vec::new();
        assert!(encode_chunk(&mut buf, &items, 0, &fixed8()).is_err());
    }
}
