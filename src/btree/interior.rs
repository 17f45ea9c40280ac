//! # Internal B-tree Pages
//!
//! An internal page routes by row-id range. Its item area holds packed
//! 12-byte entries, sorted by separator:
//!
//! ```text
//! Entry: [ lokey: u64 | child: u32 ]
//! ```
//!
//! The entry at position i covers `[entry[i].lokey, entry[i+1].lokey)`
//! (the last entry runs to the page's hikey), so routing is a binary search
//! for the last entry at or below the target. The first entry's lokey always
//! equals the page's own lokey.
//!
//! Fan-out is bounded only by page capacity: (8192 - 8 - 28) / 12 = 679
//! entries per page.

use eyre::{bail, ensure, Result};

use crate::storage::page::{self, BtreeTrailer, PageHeader, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::types::{PageNo, RowId};

pub const INTERNAL_ENTRY_SIZE: usize = 12;

pub const INTERNAL_CAPACITY: usize =
    (PAGE_SIZE - PAGE_HEADER_SIZE - BtreeTrailer::SIZE) / INTERNAL_ENTRY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Downlink {
    pub lokey: RowId,
    pub child: PageNo,
}

#[derive(Debug)]
pub struct InteriorNode<'a> {
    data: &'a [u8],
    trailer: BtreeTrailer,
}

impl<'a> InteriorNode<'a> {
    pub fn from_page(data: &'a [u8], page_no: PageNo) -> Result<Self> {
        let trailer = BtreeTrailer::from_page(data, page_no)?;
        ensure!(
            trailer.level > 0,
            "page {}: expected internal B-tree page, found leaf",
            page_no
        );
        let header = PageHeader::from_bytes(data)?;
        header.validate(page_no)?;
        ensure!(
            (header.lower() as usize - PAGE_HEADER_SIZE) % INTERNAL_ENTRY_SIZE == 0,
            "page {}: internal item area is not a whole number of entries",
            page_no
        );
        Ok(Self { data, trailer })
    }

    pub fn trailer(&self) -> &BtreeTrailer {
        &self.trailer
    }

    pub fn entry_count(&self) -> usize {
        let header = PageHeader::from_bytes(self.data).unwrap();
        (header.lower() as usize - PAGE_HEADER_SIZE) / INTERNAL_ENTRY_SIZE
    }

    pub fn entry(&self, index: usize) -> Downlink {
        let off = PAGE_HEADER_SIZE + index * INTERNAL_ENTRY_SIZE;
        Downlink {
            lokey: page::read_u64(self.data, off),
            child: page::read_u32(self.data, off + 8),
        }
    }

    pub fn entries(&self) -> Vec<Downlink> {
        (0..self.entry_count()).map(|i| self.entry(i)).collect()
    }

    /// Child page covering `tid`: the last entry with `lokey <= tid`.
    pub fn find_child(&self, tid: RowId, page_no: PageNo) -> Result<PageNo> {
        let count = self.entry_count();
        ensure!(count > 0, "page {}: internal page with no entries", page_no);
        if self.entry(0).lokey > tid {
            bail!(
                "page {}: row id {} below the page's first separator {}",
                page_no,
                tid,
                self.entry(0).lokey
            );
        }

        let mut lo = 0;
        let mut hi = count;
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            if self.entry(mid).lokey <= tid {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Ok(self.entry(lo).child)
    }
}

/// Initializes `data` as an internal page holding `entries` (sorted).
pub fn init_internal_page(data: &mut [u8], trailer: BtreeTrailer, entries: &[Downlink]) -> Result<()> {
    ensure!(trailer.level > 0, "internal page must have level > 0");
    ensure!(
        entries.len() <= INTERNAL_CAPACITY,
        "{} downlinks exceed internal page capacity {}",
        entries.len(),
        INTERNAL_CAPACITY
    );
    for pair in entries.windows(2) {
        ensure!(
            pair[0].lokey < pair[1].lokey,
            "downlink separators must be strictly increasing"
        );
    }

    page::init_page(data, BtreeTrailer::SIZE)?;
    trailer.write_to(data);

    let mut off = PAGE_HEADER_SIZE;
    for entry in entries {
        data[off..off + 8].copy_from_slice(&entry.lokey.to_le_bytes());
        data[off + 8..off + 12].copy_from_slice(&entry.child.to_le_bytes());
        off += INTERNAL_ENTRY_SIZE;
    }
    let header = PageHeader::from_bytes_mut(data)?;
    header.set_lower(off as u16);
    Ok(())
}

/// Rewrites an existing internal page's entry list in place, keeping its
/// trailer. Fails if the entries exceed capacity.
pub fn rewrite_entries(data: &mut [u8], page_no: PageNo, entries: &[Downlink]) -> Result<()> {
    let trailer = BtreeTrailer::from_page(data, page_no)?;
    init_internal_page(data, trailer, entries)
}
