//! # The Metapage
//!
//! Page 0 of every table. Its trailer anchors the undo log (head, tail, the
//! counter of the first record on the tail page, and the oldest-retained
//! pointer), the free-page list head, and engine flag bits. Its item area
//! holds the attribute-root directory: the page number of each attribute's
//! B-tree root, indexed by attribute number, with slot 0 for the meta tree.
//!
//! The metapage is the single hottest shared resource in a table. Every
//! mutation goes through `update_trailer` or `set_attribute_root`, each of
//! which performs one read-modify-write under the caller's exclusive lock
//! scope and leaves the page internally consistent; there are no multi-call
//! update sequences to interleave.
//!
//! ## Trailer layout (40 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -------------------------------
//! 0       8     undo_tail_first_counter
//! 8       8     oldest_undo.counter
//! 16      4     undo_head
//! 20      4     undo_tail
//! 24      4     oldest_undo.blkno
//! 28      4     fpm_head
//! 32      4     flags
//! 36      2     oldest_undo.offset
//! 38      2     page tag (META)
//! ```

use eyre::{bail, ensure, Result};

use super::page::{self, check_trailer, read_u16, read_u32, read_u64, META_PAGE_TAG, PAGE_SIZE};
use super::Storage;
use crate::types::{AttrNo, PageNo};
use crate::undo::UndoRecPtr;

/// The metapage always lives at page 0.
pub const META_BLK: PageNo = 0;

const DIR_HEADER: usize = page::PAGE_HEADER_SIZE;
const DIR_SLOT_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaTrailer {
    pub undo_head: PageNo,
    pub undo_tail: PageNo,
    pub undo_tail_first_counter: u64,
    pub oldest_undo: UndoRecPtr,
    pub fpm_head: PageNo,
    pub flags: u32,
}

impl MetaTrailer {
    pub const SIZE: usize = 40;

    pub fn from_page(data: &[u8], page_no: PageNo) -> Result<Self> {
        let base = check_trailer(data, page_no, META_PAGE_TAG, Self::SIZE)?;
        Ok(Self {
            undo_tail_first_counter: read_u64(data, base),
            oldest_undo: UndoRecPtr {
                counter: read_u64(data, base + 8),
                blkno: read_u32(data, base + 24),
                offset: read_u16(data, base + 36),
            },
            undo_head: read_u32(data, base + 16),
            undo_tail: read_u32(data, base + 20),
            fpm_head: read_u32(data, base + 28),
            flags: read_u32(data, base + 32),
        })
    }

    pub fn write_to(&self, data: &mut [u8]) {
        debug_assert!(data.len() == PAGE_SIZE);
        let base = PAGE_SIZE - Self::SIZE;
        data[base..base + 8].copy_from_slice(&self.undo_tail_first_counter.to_le_bytes());
        data[base + 8..base + 16].copy_from_slice(&self.oldest_undo.counter.to_le_bytes());
        data[base + 16..base + 20].copy_from_slice(&self.undo_head.to_le_bytes());
        data[base + 20..base + 24].copy_from_slice(&self.undo_tail.to_le_bytes());
        data[base + 24..base + 28].copy_from_slice(&self.oldest_undo.blkno.to_le_bytes());
        data[base + 28..base + 32].copy_from_slice(&self.fpm_head.to_le_bytes());
        data[base + 32..base + 36].copy_from_slice(&self.flags.to_le_bytes());
        data[base + 36..base + 38].copy_from_slice(&self.oldest_undo.offset.to_le_bytes());
        data[base + 38..base + 40].copy_from_slice(&META_PAGE_TAG.to_le_bytes());
    }
}

/// Initializes page 0 with an empty trailer and a root directory sized for
/// `natts` real attributes plus the meta tree. Root slots start at 0
/// (no tree yet); trees are created lazily on first insert.
pub fn init_metapage(data: &mut [u8], natts: AttrNo) -> Result<()> {
    let slots = natts as usize + 1;
    let lower = DIR_HEADER + 4 + slots * DIR_SLOT_SIZE;
    ensure!(
        lower <= PAGE_SIZE - MetaTrailer::SIZE,
        "too many attributes for the metapage directory: {}",
        natts
    );

    page::init_page(data, MetaTrailer::SIZE)?;
    data[DIR_HEADER..DIR_HEADER + 4].copy_from_slice(&(slots as u32).to_le_bytes());
    {
        let header = page::PageHeader::from_bytes_mut(data)?;
        header.set_lower(lower as u16);
    }
    MetaTrailer::default().write_to(data);
    Ok(())
}

/// Reads the trailer from page 0.
pub fn read_trailer<S: Storage>(storage: &S) -> Result<MetaTrailer> {
    MetaTrailer::from_page(storage.page(META_BLK)?, META_BLK)
}

/// One read-modify-write of the metapage trailer. The closure sees the
/// current trailer and edits it in place; the result is written back before
/// this returns, so the page never holds a half-applied update.
pub fn update_trailer<S, F>(storage: &mut S, f: F) -> Result<MetaTrailer>
where
    S: Storage,
    F: FnOnce(&mut MetaTrailer),
{
    let data = storage.page_mut(META_BLK)?;
    let mut trailer = MetaTrailer::from_page(data, META_BLK)?;
    f(&mut trailer);
    trailer.write_to(data);
    Ok(trailer)
}

/// Number of directory slots (attributes + 1 for the meta tree).
pub fn directory_slots<S: Storage>(storage: &S) -> Result<u32> {
    let data = storage.page(META_BLK)?;
    // Trailer check also validates that page 0 really is a metapage.
    MetaTrailer::from_page(data, META_BLK)?;
    Ok(read_u32(data, DIR_HEADER))
}

fn slot_offset(data: &[u8], attno: AttrNo) -> Result<usize> {
    let slots = read_u32(data, DIR_HEADER);
    if attno as u32 >= slots {
        bail!(
            "attribute {} out of range (directory has {} slots)",
            attno,
            slots
        );
    }
    Ok(DIR_HEADER + 4 + attno as usize * DIR_SLOT_SIZE)
}

/// Root page of an attribute's B-tree; 0 when the tree does not exist yet.
pub fn attribute_root<S: Storage>(storage: &S, attno: AttrNo) -> Result<PageNo> {
    let data = storage.page(META_BLK)?;
    MetaTrailer::from_page(data, META_BLK)?;
    let off = slot_offset(data, attno)?;
    Ok(read_u32(data, off))
}

pub fn set_attribute_root<S: Storage>(storage: &mut S, attno: AttrNo, root: PageNo) -> Result<()> {
    let data = storage.page_mut(META_BLK)?;
    MetaTrailer::from_page(data, META_BLK)?;
    let off = slot_offset(data, attno)?;
    data[off..off + 4].copy_from_slice(&root.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn meta_storage(natts: AttrNo) -> MemStorage {
        let mut storage = MemStorage::new(1);
        init_metapage(storage.page_mut(0).unwrap(), natts).unwrap();
        storage
    }

    #[test]
    fn init_creates_empty_trailer_and_directory() {
        let storage = meta_storage(3);

        let trailer = read_trailer(&storage).unwrap();
        assert_eq!(trailer, MetaTrailer::default());
        assert_eq!(directory_slots(&storage).unwrap(), 4);
        for attno in 0..4 {
            assert_eq!(attribute_root(&storage, attno).unwrap(), 0);
        }
    }

    #[test]
    fn trailer_update_roundtrip() {
        let mut storage = meta_storage(1);

        update_trailer(&mut storage, |m| {
            m.undo_head = 5;
            m.undo_tail = 9;
            m.undo_tail_first_counter = 42;
            m.oldest_undo = UndoRecPtr {
                counter: 17,
                blkno: 5,
                offset: 128,
            };
            m.fpm_head = 3;
            m.flags = 1;
        })
        .unwrap();

        let trailer = read_trailer(&storage).unwrap();
        assert_eq!(trailer.undo_head, 5);
        assert_eq!(trailer.undo_tail, 9);
        assert_eq!(trailer.undo_tail_first_counter, 42);
        assert_eq!(trailer.oldest_undo.counter, 17);
        assert_eq!(trailer.oldest_undo.blkno, 5);
        assert_eq!(trailer.oldest_undo.offset, 128);
        assert_eq!(trailer.fpm_head, 3);
        assert_eq!(trailer.flags, 1);
    }

    #[test]
    fn attribute_roots_are_independent() {
        let mut storage = meta_storage(2);

        set_attribute_root(&mut storage, 0, 10).unwrap();
        set_attribute_root(&mut storage, 2, 20).unwrap();

        assert_eq!(attribute_root(&storage, 0).unwrap(), 10);
        assert_eq!(attribute_root(&storage, 1).unwrap(), 0);
        assert_eq!(attribute_root(&storage, 2).unwrap(), 20);
    }

    #[test]
    fn out_of_range_attribute_is_error() {
        let storage = meta_storage(1);
        assert!(attribute_root(&storage, 2).is_err());
    }

    #[test]
    fn non_meta_page_is_rejected() {
        let storage = MemStorage::new(1);
        assert!(read_trailer(&storage).is_err());
    }
}
