//! # Leaf Pages: Two Streams and a Write-Absorption Policy
//!
//! A leaf holds one column's values for the row-id range `[lokey, hikey)` in
//! up to two attribute streams:
//!
//! ```text
//! +--------+-------------------+--............--+----------------+---------+
//! | Header | base stream       |  free space    | insert buffer  | Trailer |
//! | (8B)   | (8 .. lower)      |                | (upper..special)| (28B)  |
//! +--------+-------------------+--............--+----------------+---------+
//! ```
//!
//! The base stream is append-mostly and usually compressed. The insert
//! buffer absorbs new writes cheaply: each write decodes and re-encodes only
//! the small buffer, never the base. When the buffer outgrows its threshold
//! or the page's free space, the two are merged ("compaction") and the base
//! is rebuilt with compression; when even the merged stream cannot fit, the
//! caller splits the leaf.
//!
//! At read time the buffer shadows the base: an element present in both
//! streams at the same row id resolves to the buffer's version, which is by
//! construction the newer write.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::compress::Compression;
use crate::config::EngineOptions;
use crate::storage::page::{self, BtreeTrailer, PageHeader, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::stream::{
    decode_stream, encoder::encode_items, merge_items, StreamDecoder, StreamHeader,
    STREAM_HEADER_SIZE,
};
use crate::types::{AttrDesc, PageNo, RowId, StreamItem};

/// Bytes available to streams on a leaf.
pub const LEAF_CAPACITY: usize = PAGE_SIZE - PAGE_HEADER_SIZE - BtreeTrailer::SIZE;

/// Fill target for the pieces of a split leaf, leaving headroom so a split
/// page can absorb writes without immediately splitting again.
pub const LEAF_SPLIT_FILL: usize = LEAF_CAPACITY * 3 / 4;

#[derive(Debug)]
pub struct LeafNode<'a> {
    data: &'a [u8],
    trailer: BtreeTrailer,
}

impl<'a> LeafNode<'a> {
    pub fn from_page(data: &'a [u8], page_no: PageNo) -> Result<Self> {
        let trailer = BtreeTrailer::from_page(data, page_no)?;
        ensure!(
            trailer.is_leaf(),
            "page {}: expected B-tree leaf, found level {}",
            page_no,
            trailer.level
        );
        let header = PageHeader::from_bytes(data)?;
        header.validate(page_no)?;
        Ok(Self { data, trailer })
    }

    pub fn trailer(&self) -> &BtreeTrailer {
        &self.trailer
    }

    fn header(&self) -> &PageHeader {
        PageHeader::from_bytes(self.data).unwrap()
    }

    /// The base stream's bytes; empty slice when absent.
    pub fn base_stream(&self) -> &'a [u8] {
        &self.data[PAGE_HEADER_SIZE..self.header().lower() as usize]
    }

    /// The insert buffer's bytes; empty slice when absent.
    pub fn insert_stream(&self) -> &'a [u8] {
        &self.data[self.header().upper() as usize..self.header().special() as usize]
    }

    /// Streams present on this leaf, base first.
    pub fn streams(&self) -> SmallVec<[&'a [u8]; 2]> {
        let mut streams = SmallVec::new();
        if !self.base_stream().is_empty() {
            streams.push(self.base_stream());
        }
        if !self.insert_stream().is_empty() {
            streams.push(self.insert_stream());
        }
        streams
    }

    pub fn free_space(&self) -> usize {
        self.header().free_space()
    }

    /// Highest row id present, from the stream headers alone (no decode).
    pub fn last_tid(&self) -> Result<RowId> {
        let mut last = 0;
        for stream in self.streams() {
            let header = StreamHeader::from_bytes(stream)?;
            last = last.max(header.last_tid);
        }
        Ok(last)
    }

    /// All elements on the leaf in row-id order, buffer shadowing base.
    pub fn items(
        &self,
        desc: &AttrDesc,
        compression: &dyn Compression,
    ) -> Result<Vec<StreamItem>> {
        let base = decode_stream(self.base_stream(), desc, compression)?;
        let buffer = decode_stream(self.insert_stream(), desc, compression)?;
        Ok(merge_items(base, &buffer))
    }

    /// Point lookup, walking chunks with early exit. The insert buffer is
    /// consulted first because its entries shadow the base stream.
    pub fn find(
        &self,
        desc: &AttrDesc,
        compression: &dyn Compression,
        tid: RowId,
    ) -> Result<Option<Option<Vec<u8>>>> {
        for stream in [self.insert_stream(), self.base_stream()] {
            if stream.is_empty() {
                continue;
            }
            if let Some(value) = find_in_stream(stream, desc, compression, tid)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

fn find_in_stream(
    stream: &[u8],
    desc: &AttrDesc,
    compression: &dyn Compression,
    tid: RowId,
) -> Result<Option<Option<Vec<u8>>>> {
    let mut decoder = StreamDecoder::begin(stream, *desc, compression)?;
    if tid > decoder.last_tid() {
        return Ok(None);
    }
    while let Some(chunk) = decoder.next_chunk()? {
        if chunk.last_tid < tid {
            continue;
        }
        if chunk.first_tid > tid {
            return Ok(None);
        }
        return Ok(chunk
            .items
            .into_iter()
            .find(|item| item.tid == tid)
            .map(|item| item.value));
    }
    Ok(None)
}

/// Initializes `data` as an empty leaf for the given range.
pub fn init_leaf_page(data: &mut [u8], trailer: BtreeTrailer) -> Result<()> {
    ensure!(trailer.is_leaf(), "leaf trailer must have level 0");
    page::init_page(data, BtreeTrailer::SIZE)?;
    trailer.write_to(data);
    Ok(())
}

/// Rewrites a leaf's streams in place. Pass an empty slice to clear one.
pub fn set_streams(data: &mut [u8], base: &[u8], insert: &[u8]) -> Result<()> {
    let header = PageHeader::from_bytes(data)?;
    let special = header.special() as usize;
    ensure!(
        PAGE_HEADER_SIZE + base.len() + insert.len() <= special,
        "streams of {} + {} bytes exceed leaf capacity {}",
        base.len(),
        insert.len(),
        special - PAGE_HEADER_SIZE
    );

    let lower = PAGE_HEADER_SIZE + base.len();
    let upper = special - insert.len();
    data[PAGE_HEADER_SIZE..lower].copy_from_slice(base);
    data[upper..special].copy_from_slice(insert);

    let header = PageHeader::from_bytes_mut(data)?;
    header.set_lower(lower as u16);
    header.set_upper(upper as u16);
    Ok(())
}

/// Outcome of applying a write batch to a leaf.
#[derive(Debug)]
pub enum LeafApply {
    /// The batch was absorbed (into the buffer, or via compaction).
    Done,
    /// Even the compacted stream cannot fit; the caller must split. Carries
    /// every element of the leaf, batch merged in, in row-id order.
    NeedsSplit(Vec<StreamItem>),
}

/// Applies a sorted batch to a leaf page in place.
pub fn apply_to_leaf(
    data: &mut [u8],
    page_no: PageNo,
    batch: &[StreamItem],
    desc: &AttrDesc,
    opts: &EngineOptions,
    compression: &dyn Compression,
) -> Result<LeafApply> {
    let (base_bytes, buffer_items) = {
        let node = LeafNode::from_page(data, page_no)?;
        let buffer = decode_stream(node.insert_stream(), desc, compression)?;
        (node.base_stream().to_vec(), buffer)
    };

    // Fast path: grow only the insert buffer.
    let buffer_items = merge_items(buffer_items, batch);
    let buffer_bytes = encode_items(&buffer_items, desc, compression, false)?;
    if buffer_bytes.len() <= opts.insert_buffer_max
        && base_bytes.len() + buffer_bytes.len() <= LEAF_CAPACITY
    {
        set_streams(data, &base_bytes, &buffer_bytes)?;
        return Ok(LeafApply::Done);
    }

    // Compaction: merge the buffer into the base and recompress.
    let base_items = decode_stream(&base_bytes, desc, compression)?;
    let all_items = merge_items(base_items, &buffer_items);
    let compacted = encode_items(&all_items, desc, compression, opts.compress)?;
    if compacted.len() <= LEAF_CAPACITY {
        tracing::debug!(
            page = page_no,
            size = compacted.len(),
            "compacted leaf streams"
        );
        set_streams(data, &compacted, &[])?;
        return Ok(LeafApply::Done);
    }

    Ok(LeafApply::NeedsSplit(all_items))
}

fn estimated_item_size(item: &StreamItem, prev_tid: RowId, desc: &AttrDesc) -> usize {
    use crate::stream::varint::varint_len;

    // Tid delta varint + a bitmap byte's worth of slack, plus the value
    // bytes and, for variable-length values, the length prefix.
    let value = match (&item.value, desc.fixed_len) {
        (None, _) => 0,
        (Some(v), Some(_)) => v.len(),
        (Some(v), None) => v.len() + varint_len(v.len() as u64),
    };
    varint_len(item.tid.saturating_sub(prev_tid)) + 1 + value
}

/// Partitions an oversized item run into consecutive parts, each targeted at
/// `LEAF_SPLIT_FILL` estimated bytes. Used by the split path; always returns
/// at least two parts for a run that overflowed a leaf.
pub fn split_parts(items: Vec<StreamItem>, desc: &AttrDesc) -> Result<Vec<Vec<StreamItem>>> {
    ensure!(items.len() >= 2, "cannot split a run of {} items", items.len());

    let total: usize = {
        let mut prev = 0;
        items
            .iter()
            .map(|i| {
                let size = estimated_item_size(i, prev, desc);
                prev = i.tid;
                size
            })
            .sum()
    };
    let target = LEAF_SPLIT_FILL.min(total / 2 + 1);

    let mut parts: Vec<Vec<StreamItem>> = Vec::new();
    let mut current: Vec<StreamItem> = Vec::new();
    let mut current_size = STREAM_HEADER_SIZE;
    let mut prev_tid = 0;
    for item in items {
        let size = estimated_item_size(&item, prev_tid, desc);
        prev_tid = item.tid;
        if size + STREAM_HEADER_SIZE > LEAF_CAPACITY {
            bail!("single value of ~{} bytes cannot fit on a leaf page", size);
        }
        if !current.is_empty() && current_size + size > target {
            parts.push(std::mem::take(&mut current));
            current_size = STREAM_HEADER_SIZE;
        }
        current_size += size;
        current.push(item);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    ensure!(parts.len() >= 2, "split produced a single part");
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::NoCompression;
    use crate::types::MAX_ROW_ID;

    fn varlen() -> AttrDesc {
        AttrDesc::variable(1)
    }

    fn leaf_trailer() -> BtreeTrailer {
        BtreeTrailer {
            lokey: 1,
            hikey: MAX_ROW_ID,
            next: 0,
            attno: 1,
            level: 0,
            flags: 0,
        }
    }

    fn fresh_leaf() -> Vec<u8> {
        let mut data = vec![0u8; PAGE_SIZE];
        init_leaf_page(&mut data, leaf_trailer()).unwrap();
        data
    }

    fn run(tids: &[u64]) -> Vec<StreamItem> {
        tids.iter()
            .map(|&t| StreamItem::new(t, Some(format!("v{}", t).into_bytes())))
            .collect()
    }

    fn opts() -> EngineOptions {
        EngineOptions::default()
    }

    #[test]
    fn fresh_leaf_has_no_streams() {
        let data = fresh_leaf();
        let node = LeafNode::from_page(&data, 1).unwrap();
        assert!(node.streams().is_empty());
        assert_eq!(node.free_space(), LEAF_CAPACITY);
        assert_eq!(node.last_tid().unwrap(), 0);
    }

    #[test]
    fn small_batch_lands_in_insert_buffer() {
        let mut data = fresh_leaf();
        let outcome = apply_to_leaf(
            &mut data,
            1,
            &run(&[1, 2, 3]),
            &varlen(),
            &opts(),
            &NoCompression,
        )
        .unwrap();
        assert!(matches!(outcome, LeafApply::Done));

        let node = LeafNode::from_page(&data, 1).unwrap();
        assert!(node.base_stream().is_empty());
        assert!(!node.insert_stream().is_empty());
        assert_eq!(node.items(&varlen(), &NoCompression).unwrap(), run(&[1, 2, 3]));
    }

    #[test]
    fn buffer_overflow_triggers_compaction() {
        let mut data = fresh_leaf();
        let mut next_tid = 1;
        // Push enough through the buffer that it must compact at least once.
        for _ in 0..20 {
            let tids: Vec<u64> = (next_tid..next_tid + 20).collect();
            next_tid += 20;
            let outcome =
                apply_to_leaf(&mut data, 1, &run(&tids), &varlen(), &opts(), &NoCompression)
                    .unwrap();
            assert!(matches!(outcome, LeafApply::Done));
        }

        let node = LeafNode::from_page(&data, 1).unwrap();
        assert!(!node.base_stream().is_empty());
        let items = node.items(&varlen(), &NoCompression).unwrap();
        assert_eq!(items.len(), 400);
        assert_eq!(node.last_tid().unwrap(), 400);
    }

    #[test]
    fn buffer_shadows_base_at_same_tid() {
        let mut data = fresh_leaf();
        // Force tid 5 into the base via compaction...
        let big: Vec<u64> = (1..=300).collect();
        apply_to_leaf(&mut data, 1, &run(&big), &varlen(), &opts(), &NoCompression).unwrap();
        {
            let node = LeafNode::from_page(&data, 1).unwrap();
            assert!(!node.base_stream().is_empty());
        }
        // ...then overwrite it through the buffer.
        let update = vec![StreamItem::new(5, Some(b"new".to_vec()))];
        apply_to_leaf(&mut data, 1, &update, &varlen(), &opts(), &NoCompression).unwrap();

        let node = LeafNode::from_page(&data, 1).unwrap();
        assert_eq!(
            node.find(&varlen(), &NoCompression, 5).unwrap(),
            Some(Some(b"new".to_vec()))
        );
        // Merged view has one element per tid.
        let items = node.items(&varlen(), &NoCompression).unwrap();
        assert_eq!(items.len(), 300);
    }

    #[test]
    fn find_distinguishes_null_and_missing() {
        let mut data = fresh_leaf();
        let items = vec![
            StreamItem::new(10, Some(b"a".to_vec())),
            StreamItem::new(11, None),
        ];
        apply_to_leaf(&mut data, 1, &items, &varlen(), &opts(), &NoCompression).unwrap();

        let node = LeafNode::from_page(&data, 1).unwrap();
        assert_eq!(
            node.find(&varlen(), &NoCompression, 10).unwrap(),
            Some(Some(b"a".to_vec()))
        );
        assert_eq!(node.find(&varlen(), &NoCompression, 11).unwrap(), Some(None));
        assert_eq!(node.find(&varlen(), &NoCompression, 12).unwrap(), None);
    }

    #[test]
    fn oversized_run_requests_split() {
        let mut data = fresh_leaf();
        let items: Vec<StreamItem> = (1..=10)
            .map(|t| StreamItem::new(t, Some(vec![t as u8; 1500])))
            .collect();

        let outcome =
            apply_to_leaf(&mut data, 1, &items, &varlen(), &opts(), &NoCompression).unwrap();
        match outcome {
            LeafApply::NeedsSplit(all) => assert_eq!(all.len(), 10),
            LeafApply::Done => panic!("expected split request"),
        }
    }

    #[test]
    fn split_parts_balances_bytes() {
        let items: Vec<StreamItem> = (1..=10)
            .map(|t| StreamItem::new(t, Some(vec![t as u8; 1500])))
            .collect();
        let parts = split_parts(items.clone(), &varlen()).unwrap();
        assert!(parts.len() >= 2);

        // Parts concatenate back to the original run.
        let rejoined: Vec<StreamItem> = parts.iter().flatten().cloned().collect();
        assert_eq!(rejoined, items);

        // Each part fits a leaf comfortably.
        for part in &parts {
            let bytes = encode_items(part, &varlen(), &NoCompression, false).unwrap();
            assert!(bytes.len() <= LEAF_CAPACITY);
        }
    }

    #[test]
    fn single_item_too_large_for_page_is_capacity_error() {
        let items = vec![
            StreamItem::new(1, Some(vec![0u8; PAGE_SIZE])),
            StreamItem::new(2, Some(vec![0u8; PAGE_SIZE])),
        ];
        assert!(split_parts(items, &varlen()).is_err());
    }
}
