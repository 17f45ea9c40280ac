//! # Free-Page List
//!
//! Pages released by any component (truncated undo pages, emptied B-tree
//! pages, deleted toast slices) are never handed back to the backend.
//! They are retagged FREE and pushed onto a singly linked chain headed at the
//! metapage's `fpm_head`, then recycled by the next allocation. Deferring
//! reuse through the list is what keeps successor pointers held by concurrent
//! readers from dangling into a page of a different kind mid-scan: a reader
//! that lands on a recycled page sees a tag mismatch and stops, instead of
//! misinterpreting foreign bytes.
//!
//! Allocation pops the list head, or grows the backend by one page when the
//! list is empty. Both `allocate_page` and `free_page` mutate the metapage in
//! a single read-modify-write; callers hold the metapage exclusive lock for
//! exactly that scope.

use eyre::{ensure, Result};
use tracing::debug;

use super::meta::{self, META_BLK};
use super::page::{self, FreeTrailer};
use super::Storage;
use crate::types::{PageNo, INVALID_PAGE_NO};

/// Returns a zeroed page, recycling from the free list when possible.
pub fn allocate_page<S: Storage>(storage: &mut S) -> Result<PageNo> {
    let trailer = meta::read_trailer(storage)?;

    if trailer.fpm_head != INVALID_PAGE_NO {
        let head = trailer.fpm_head;
        let next = FreeTrailer::from_page(storage.page(head)?, head)?.next;
        meta::update_trailer(storage, |m| m.fpm_head = next)?;
        storage.page_mut(head)?.fill(0);
        debug!(page = head, "recycled page from free list");
        return Ok(head);
    }

    let new_page = storage.page_count();
    storage.grow(1)?;
    Ok(new_page)
}

/// Retags a page FREE and pushes it onto the list.
pub fn free_page<S: Storage>(storage: &mut S, page_no: PageNo) -> Result<()> {
    ensure!(page_no != META_BLK, "cannot free the metapage");
    ensure!(
        page_no < storage.page_count(),
        "cannot free page {} beyond the end of storage ({})",
        page_no,
        storage.page_count()
    );

    let head = meta::read_trailer(storage)?.fpm_head;
    let data = storage.page_mut(page_no)?;
    page::init_page(data, FreeTrailer::SIZE)?;
    FreeTrailer { next: head }.write_to(data);
    meta::update_trailer(storage, |m| m.fpm_head = page_no)?;
    Ok(())
}

/// Walks the chain and counts free pages. Diagnostic only.
pub fn free_page_count<S: Storage>(storage: &S) -> Result<u32> {
    let mut count = 0;
    let mut blkno = meta::read_trailer(storage)?.fpm_head;
    while blkno != INVALID_PAGE_NO {
        let trailer = FreeTrailer::from_page(storage.page(blkno)?, blkno)?;
        count += 1;
        blkno = trailer.next;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn storage_with_meta() -> MemStorage {
        let mut storage = MemStorage::new(1);
        meta::init_metapage(storage.page_mut(0).unwrap(), 1).unwrap();
        storage
    }

    #[test]
    fn empty_list_grows_storage() {
        let mut storage = storage_with_meta();
        let page = allocate_page(&mut storage).unwrap();
        assert_eq!(page, 1);
        assert_eq!(storage.page_count(), 2);
    }

    #[test]
    fn freed_page_is_recycled_lifo() {
        let mut storage = storage_with_meta();
        let a = allocate_page(&mut storage).unwrap();
        let b = allocate_page(&mut storage).unwrap();

        free_page(&mut storage, a).unwrap();
        free_page(&mut storage, b).unwrap();
        assert_eq!(free_page_count(&storage).unwrap(), 2);

        assert_eq!(allocate_page(&mut storage).unwrap(), b);
        assert_eq!(allocate_page(&mut storage).unwrap(), a);
        assert_eq!(free_page_count(&storage).unwrap(), 0);
        // No growth while the list had pages to hand out.
        assert_eq!(storage.page_count(), 3);
    }

    #[test]
    fn freed_page_is_tagged_free() {
        let mut storage = storage_with_meta();
        let page = allocate_page(&mut storage).unwrap();
        free_page(&mut storage, page).unwrap();

        assert_eq!(
            page::page_kind(storage.page(page).unwrap()),
            page::PageKind::Free
        );
    }

    #[test]
    fn metapage_cannot_be_freed() {
        let mut storage = storage_with_meta();
        assert!(free_page(&mut storage, 0).is_err());
    }

    #[test]
    fn recycled_page_comes_back_zeroed() {
        let mut storage = storage_with_meta();
        let page = allocate_page(&mut storage).unwrap();
        storage.page_mut(page).unwrap().fill(0xEE);
        free_page(&mut storage, page).unwrap();

        let again = allocate_page(&mut storage).unwrap();
        assert_eq!(again, page);
        assert!(storage.page(again).unwrap().iter().all(|&b| b == 0));
    }
}
