//! Log management: append at the tail, read by pointer, scan forward,
//! truncate from the head.
//!
//! The metapage anchors everything: `undo_head`/`undo_tail` bound the page
//! chain, `undo_tail_first_counter` is the counter of the first record on
//! the tail page (the next counter is derived from it by walking the tail
//! page's self-describing records, never inferred from page order), and
//! `oldest_undo` is the watermark below which records may be discarded.
//!
//! Truncation keeps the tail page even when it falls wholly below the
//! watermark; retaining it preserves counter continuity for the next append
//! and keeps head/tail handling free of empty-log special cases after the
//! first append.

use eyre::{bail, ensure, Result};
use tracing::debug;

use super::record::{UndoOp, UndoRecord, UNDO_RECORD_HEADER_SIZE};
use super::UndoRecPtr;
use crate::storage::meta;
use crate::storage::page::{
    self, PageHeader, UndoTrailer, PAGE_HEADER_SIZE, PAGE_SIZE, UNDO_PAGE_TAG,
};
use crate::storage::{freelist, Storage};
use crate::types::{CancelToken, PageNo, RowId, TxnId, INVALID_PAGE_NO};

/// Bytes available for records on one undo page.
pub const UNDO_PAGE_CAPACITY: usize = PAGE_SIZE - PAGE_HEADER_SIZE - UndoTrailer::SIZE;

fn init_undo_page(data: &mut [u8]) -> Result<()> {
    page::init_page(data, UndoTrailer::SIZE)?;
    UndoTrailer {
        next: INVALID_PAGE_NO,
    }
    .write_to(data);
    Ok(())
}

/// Parses every record on an undo page, verifying self-pointers.
pub fn page_records(data: &[u8], blkno: PageNo) -> Result<Vec<UndoRecord>> {
    UndoTrailer::from_page(data, blkno)?;
    let header = PageHeader::from_bytes(data)?;
    header.validate(blkno)?;

    let lower = header.lower() as usize;
    let mut records = Vec::new();
    let mut offset = PAGE_HEADER_SIZE;
    while offset < lower {
        let record = UndoRecord::from_bytes(&data[offset..])?;
        if record.ptr.blkno != blkno || record.ptr.offset as usize != offset {
            bail!(
                "page {}: undo record at offset {} claims to live at page {} offset {}",
                blkno,
                offset,
                record.ptr.blkno,
                record.ptr.offset
            );
        }
        offset += record.serialized_size();
        records.push(record);
    }
    Ok(records)
}

/// Counter the next record on this page would get, and the append offset.
fn tail_state(data: &[u8], blkno: PageNo, tail_first_counter: u64) -> Result<(u64, usize)> {
    let records = page_records(data, blkno)?;
    let header = PageHeader::from_bytes(data)?;
    match records.last() {
        Some(last) => Ok((last.ptr.counter + 1, header.lower() as usize)),
        None => Ok((tail_first_counter, header.lower() as usize)),
    }
}

/// Appends one record and returns its pointer. Seals the tail page and
/// allocates a new one when the record does not fit.
pub fn append_record<S: Storage>(
    storage: &mut S,
    op: UndoOp,
    txn_id: TxnId,
    tid: RowId,
    prev: UndoRecPtr,
    payload: &[u8],
) -> Result<UndoRecPtr> {
    let size = UNDO_RECORD_HEADER_SIZE + payload.len();
    ensure!(
        size <= UNDO_PAGE_CAPACITY,
        "undo record of {} bytes exceeds page capacity {}",
        size,
        UNDO_PAGE_CAPACITY
    );

    let trailer = meta::read_trailer(storage)?;

    let (target, counter, offset) = if trailer.undo_tail == INVALID_PAGE_NO {
        // First record ever: create the initial page and anchor the chain.
        let blkno = freelist::allocate_page(storage)?;
        init_undo_page(storage.page_mut(blkno)?)?;
        let counter = trailer.undo_tail_first_counter.max(1);
        meta::update_trailer(storage, |m| {
            m.undo_head = blkno;
            m.undo_tail = blkno;
            m.undo_tail_first_counter = counter;
        })?;
        (blkno, counter, PAGE_HEADER_SIZE)
    } else {
        let tail = trailer.undo_tail;
        let (counter, offset) = tail_state(
            storage.page(tail)?,
            tail,
            trailer.undo_tail_first_counter,
        )?;

        if offset + size <= PAGE_SIZE - UndoTrailer::SIZE {
            (tail, counter, offset)
        } else {
            // Seal the tail: link its successor, then move the tail anchor.
            let blkno = freelist::allocate_page(storage)?;
            init_undo_page(storage.page_mut(blkno)?)?;
            UndoTrailer { next: blkno }.write_to(storage.page_mut(tail)?);
            meta::update_trailer(storage, |m| {
                m.undo_tail = blkno;
                m.undo_tail_first_counter = counter;
            })?;
            debug!(sealed = tail, tail = blkno, "sealed undo page");
            (blkno, counter, PAGE_HEADER_SIZE)
        }
    };

    let ptr = UndoRecPtr {
        counter,
        blkno: target,
        offset: offset as u16,
    };
    let record = UndoRecord {
        ptr,
        op,
        txn_id,
        tid,
        prev,
        payload: payload.to_vec(),
    };

    let data = storage.page_mut(target)?;
    record.write_to(&mut data[offset..])?;
    let header = PageHeader::from_bytes_mut(data)?;
    header.set_lower((offset + size) as u16);

    Ok(ptr)
}

/// Reads the record at `ptr`. Not-found (`None`) covers the normal cases of
/// absence: an invalid pointer, a pointer below the oldest-retained
/// watermark, or one past the current tail. A pointer that should be live
/// but lands on a non-UNDO page or a disagreeing record is corruption.
pub fn read_record<S: Storage>(storage: &S, ptr: UndoRecPtr) -> Result<Option<UndoRecord>> {
    if !ptr.is_valid() {
        return Ok(None);
    }
    let trailer = meta::read_trailer(storage)?;
    if ptr.counter < trailer.oldest_undo.counter {
        return Ok(None);
    }
    if ptr.blkno >= storage.page_count() {
        return Ok(None);
    }

    let data = storage.page(ptr.blkno)?;
    UndoTrailer::from_page(data, ptr.blkno)?;
    let header = PageHeader::from_bytes(data)?;
    header.validate(ptr.blkno)?;

    let offset = ptr.offset as usize;
    if offset < PAGE_HEADER_SIZE || offset >= header.lower() as usize {
        return Ok(None);
    }

    let record = UndoRecord::from_bytes(&data[offset..])?;
    if record.ptr != ptr {
        bail!(
            "page {}: undo record at offset {} has self-pointer (counter {}, page {}, offset {}), expected counter {}",
            ptr.blkno,
            offset,
            record.ptr.counter,
            record.ptr.blkno,
            record.ptr.offset,
            ptr.counter
        );
    }
    Ok(Some(record))
}

/// Forward scan from `start` to the current tail, in ascending counter
/// order. Starts at the oldest-retained watermark when `start` lies below
/// it.
pub fn scan_from<S: Storage>(
    storage: &S,
    start: UndoRecPtr,
    token: CancelToken,
) -> Result<UndoScan> {
    let trailer = meta::read_trailer(storage)?;
    let effective = if start.counter < trailer.oldest_undo.counter {
        trailer.oldest_undo
    } else {
        start
    };
    let (blkno, offset) = if effective.is_valid() {
        (effective.blkno, effective.offset as usize)
    } else {
        (trailer.undo_head, PAGE_HEADER_SIZE)
    };
    Ok(UndoScan {
        blkno,
        offset,
        token,
    })
}

pub struct UndoScan {
    blkno: PageNo,
    offset: usize,
    token: CancelToken,
}

impl UndoScan {
    pub fn next<S: Storage>(&mut self, storage: &S) -> Result<Option<UndoRecord>> {
        loop {
            if self.blkno == INVALID_PAGE_NO {
                return Ok(None);
            }

            let data = storage.page(self.blkno)?;
            let tag = page::page_tag(data);
            if tag != UNDO_PAGE_TAG {
                bail!(
                    "page {}: undo chain reached a page tagged {:#06x}, expected UNDO",
                    self.blkno,
                    tag
                );
            }
            let trailer = UndoTrailer::from_page(data, self.blkno)?;
            let header = PageHeader::from_bytes(data)?;
            header.validate(self.blkno)?;
            let lower = header.lower() as usize;

            // A page's first record must name the page it sits on; anything
            // else means the chain walked onto a recycled or torn page.
            if lower > PAGE_HEADER_SIZE {
                let first = UndoRecord::from_bytes(&data[PAGE_HEADER_SIZE..])?;
                if first.ptr.blkno != self.blkno {
                    bail!(
                        "page {}: first undo record claims page {}",
                        self.blkno,
                        first.ptr.blkno
                    );
                }
            }

            if self.offset >= lower {
                self.token.check()?;
                self.blkno = trailer.next;
                self.offset = PAGE_HEADER_SIZE;
                continue;
            }

            let record = UndoRecord::from_bytes(&data[self.offset..])?;
            ensure!(
                record.ptr.blkno == self.blkno && record.ptr.offset as usize == self.offset,
                "page {}: undo record at offset {} disagrees with its self-pointer",
                self.blkno,
                self.offset
            );
            self.offset += record.serialized_size();
            return Ok(Some(record));
        }
    }

    pub fn collect_all<S: Storage>(mut self, storage: &S) -> Result<Vec<UndoRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next(storage)? {
            records.push(record);
        }
        Ok(records)
    }
}

/// Moves the oldest-retained watermark forward and unlinks head pages whose
/// entire record range now lies below it. The tail page is always retained.
pub fn advance_oldest<S: Storage>(storage: &mut S, watermark: UndoRecPtr) -> Result<()> {
    let trailer = meta::read_trailer(storage)?;
    ensure!(
        watermark.counter >= trailer.oldest_undo.counter,
        "oldest-retained watermark may not move backwards: {} < {}",
        watermark.counter,
        trailer.oldest_undo.counter
    );

    meta::update_trailer(storage, |m| m.oldest_undo = watermark)?;

    loop {
        let trailer = meta::read_trailer(storage)?;
        let head = trailer.undo_head;
        if head == INVALID_PAGE_NO || head == trailer.undo_tail {
            return Ok(());
        }

        let (next, last_counter) = {
            let data = storage.page(head)?;
            let page_trailer = UndoTrailer::from_page(data, head)?;
            let records = page_records(data, head)?;
            let last = records.last().map(|r| r.ptr.counter).unwrap_or(0);
            (page_trailer.next, last)
        };

        if last_counter >= watermark.counter {
            return Ok(());
        }

        // The whole page is below the watermark: advance the head anchor
        // first, then recycle the page.
        meta::update_trailer(storage, |m| m.undo_head = next)?;
        freelist::free_page(storage, head)?;
        debug!(page = head, "truncated undo page below watermark");
    }
}
