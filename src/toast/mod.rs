//! # Overflow ("Toast") Chains
//!
//! Values too large to store inline are sliced across dedicated TOAST pages
//! forming a doubly linked chain in offset order. Each slice's trailer
//! records the owning row id, the value's total logical size (replicated per
//! slice so any slice can be verified on its own), this slice's byte offset
//! within the value, and its stored/decompressed sizes. Slices are
//! compressed individually when that shrinks them.
//!
//! In the attribute stream, a toasted value is represented by a 21-byte
//! pointer: a marker byte, the total size, the chain head page, and the
//! owning row id. Note the marker is a heuristic at read time: a stored
//! value of exactly 21 bytes starting with 0xFE would be indistinguishable
//! from a pointer, so embedders storing raw binary in toast-eligible columns
//! should keep that byte out of position 0 or disable toasting for the
//! column by raising the threshold.
//!
//! Reading walks the chain in offset order, verifying at every hop that the
//! page really is a TOAST page, that it belongs to the expected row, and
//! that the running offset matches the slice's recorded offset: a mis-linked
//! or recycled page fails loudly instead of yielding spliced garbage.

use eyre::{bail, ensure, Result};
use tracing::debug;

use crate::compress::Compression;
use crate::storage::page::{
    self, PageHeader, ToastTrailer, PAGE_HEADER_SIZE, PAGE_SIZE, TOAST_COMPRESSED,
};
use crate::storage::{freelist, Storage};
use crate::types::{PageNo, RowId, INVALID_PAGE_NO};

/// Bytes of value data per slice page, before compression.
pub const TOAST_SLICE_CAPACITY: usize = PAGE_SIZE - PAGE_HEADER_SIZE - ToastTrailer::SIZE;

pub const TOAST_MARKER: u8 = 0xFE;
pub const TOAST_POINTER_SIZE: usize = 21;

/// In-stream representation of a toasted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToastPointer {
    pub total_size: u64,
    pub first_blkno: PageNo,
    pub tid: RowId,
}

impl ToastPointer {
    pub fn encode(&self) -> [u8; TOAST_POINTER_SIZE] {
        let mut buf = [0u8; TOAST_POINTER_SIZE];
        buf[0] = TOAST_MARKER;
        buf[1..9].copy_from_slice(&self.total_size.to_le_bytes());
        buf[9..13].copy_from_slice(&self.first_blkno.to_le_bytes());
        buf[13..21].copy_from_slice(&self.tid.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() == TOAST_POINTER_SIZE,
            "toast pointer must be {} bytes, got {}",
            TOAST_POINTER_SIZE,
            data.len()
        );
        ensure!(
            data[0] == TOAST_MARKER,
            "invalid toast marker: {:#04x}",
            data[0]
        );
        Ok(Self {
            total_size: u64::from_le_bytes(data[1..9].try_into().unwrap()), // INVARIANT: length checked above
            first_blkno: u32::from_le_bytes(data[9..13].try_into().unwrap()),
            tid: u64::from_le_bytes(data[13..21].try_into().unwrap()),
        })
    }
}

pub fn is_toast_pointer(data: &[u8]) -> bool {
    data.len() == TOAST_POINTER_SIZE && data[0] == TOAST_MARKER
}

/// Stores `value` as a slice chain owned by `tid`. The caller is responsible
/// for the threshold decision; this function stores whatever it is given.
pub fn toast_store<S: Storage>(
    storage: &mut S,
    tid: RowId,
    value: &[u8],
    compression: &dyn Compression,
    compress: bool,
) -> Result<ToastPointer> {
    ensure!(!value.is_empty(), "refusing to toast an empty value");

    let slices: Vec<&[u8]> = value.chunks(TOAST_SLICE_CAPACITY).collect();
    let mut pages = Vec::with_capacity(slices.len());
    for _ in &slices {
        pages.push(freelist::allocate_page(storage)?);
    }

    let mut offset = 0u64;
    for (i, slice) in slices.iter().enumerate() {
        let compressed = if compress {
            compression.compress(slice)
        } else {
            None
        };
        let (stored, flags): (&[u8], u16) = match &compressed {
            Some(bytes) => (bytes.as_slice(), TOAST_COMPRESSED),
            None => (slice, 0),
        };

        let blkno = pages[i];
        let data = storage.page_mut(blkno)?;
        page::init_page(data, ToastTrailer::SIZE)?;
        data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + stored.len()].copy_from_slice(stored);
        {
            let header = PageHeader::from_bytes_mut(data)?;
            header.set_lower((PAGE_HEADER_SIZE + stored.len()) as u16);
        }
        ToastTrailer {
            tid,
            total_size: value.len() as u64,
            slice_offset: offset,
            prev: if i == 0 { INVALID_PAGE_NO } else { pages[i - 1] },
            next: if i + 1 == pages.len() {
                INVALID_PAGE_NO
            } else {
                pages[i + 1]
            },
            decompressed_size: slice.len() as u32,
            stored_size: stored.len() as u32,
            flags,
        }
        .write_to(data);

        offset += slice.len() as u64;
    }

    debug!(tid, size = value.len(), slices = pages.len(), "toasted value");
    Ok(ToastPointer {
        total_size: value.len() as u64,
        first_blkno: pages[0],
        tid,
    })
}

/// Reassembles a toasted value by walking its chain in offset order.
pub fn toast_read<S: Storage>(
    storage: &S,
    first_blkno: PageNo,
    compression: &dyn Compression,
) -> Result<Vec<u8>> {
    let mut value = Vec::new();
    let mut blkno = first_blkno;
    let mut expected_offset = 0u64;
    let mut expected_tid = None;
    let mut total_size = None;

    while blkno != INVALID_PAGE_NO {
        let data = storage.page(blkno)?;
        let trailer = ToastTrailer::from_page(data, blkno)?;

        match expected_tid {
            None => expected_tid = Some(trailer.tid),
            Some(tid) if tid == trailer.tid => {}
            Some(tid) => bail!(
                "page {}: toast chain for row {} reached a slice owned by row {}",
                blkno,
                tid,
                trailer.tid
            ),
        }
        match total_size {
            None => total_size = Some(trailer.total_size),
            Some(total) if total == trailer.total_size => {}
            Some(total) => bail!(
                "page {}: slice declares total size {}, chain started with {}",
                blkno,
                trailer.total_size,
                total
            ),
        }
        if trailer.slice_offset != expected_offset {
            bail!(
                "page {}: toast slice at offset {}, expected {} (mis-linked chain)",
                blkno,
                trailer.slice_offset,
                expected_offset
            );
        }

        let header = PageHeader::from_bytes(data)?;
        header.validate(blkno)?;
        let stored = &data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + trailer.stored_size as usize];
        ensure!(
            header.lower() as usize == PAGE_HEADER_SIZE + trailer.stored_size as usize,
            "page {}: stored slice size {} disagrees with page watermark",
            blkno,
            trailer.stored_size
        );

        if trailer.is_compressed() {
            let slice = compression.decompress(stored, trailer.decompressed_size as usize)?;
            value.extend_from_slice(&slice);
        } else {
            ensure!(
                trailer.stored_size == trailer.decompressed_size,
                "page {}: uncompressed slice with stored size {} != decompressed size {}",
                blkno,
                trailer.stored_size,
                trailer.decompressed_size
            );
            value.extend_from_slice(stored);
        }

        expected_offset += trailer.decompressed_size as u64;
        blkno = trailer.next;
    }

    let total = total_size.unwrap_or(0);
    ensure!(
        value.len() as u64 == total,
        "toast chain from page {} reassembled {} bytes, expected {}",
        first_blkno,
        value.len(),
        total
    );
    Ok(value)
}

/// Frees every page of a chain. The chain is validated before any page is
/// released so a corrupt chain aborts without partial frees.
pub fn toast_delete<S: Storage>(storage: &mut S, first_blkno: PageNo) -> Result<()> {
    let mut pages = Vec::new();
    let mut blkno = first_blkno;
    while blkno != INVALID_PAGE_NO {
        let trailer = ToastTrailer::from_page(storage.page(blkno)?, blkno)?;
        pages.push(blkno);
        blkno = trailer.next;
    }
    for blkno in pages {
        freelist::free_page(storage, blkno)?;
    }
    Ok(())
}
