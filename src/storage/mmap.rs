//! # Memory-Mapped File Block Store
//!
//! `MmapStorage` maps a single table file into the process address space and
//! hands out page slices directly into the mapping, so reads copy nothing.
//!
//! The safety model leans on the borrow checker instead of runtime guards:
//! `page()` borrows `&self`, `page_mut()` and `grow()` borrow `&mut self`, so
//! no page reference can survive a remap. Growing flushes, extends the file,
//! and remaps.
//!
//! The file is just concatenated pages, page 0 (the metapage) at offset 0 and
//! page N at offset N * PAGE_SIZE, and its size must always be a multiple of
//! PAGE_SIZE; anything else is rejected at open.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use super::{Storage, PAGE_SIZE};

#[derive(Debug)]
pub struct MmapStorage {
    file: File,
    mmap: MmapMut,
    page_count: u32,
}

impl MmapStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open table file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0,
            "cannot open empty table file '{}'",
            path.display()
        );
        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "table file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        let page_count = (file_size / PAGE_SIZE as u64) as u32;

        // SAFETY: the file is opened read+write by this process and table
        // files are not shared with external writers. The mapping's lifetime
        // is tied to self, and all access is bounds-checked through
        // page()/page_mut().
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P, initial_page_count: u32) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            initial_page_count > 0,
            "initial page count must be at least 1"
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create table file '{}'", path.display()))?;

        let file_size = initial_page_count as u64 * PAGE_SIZE as u64;
        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), file_size))?;

        // SAFETY: freshly created file with exclusive access, size set to a
        // PAGE_SIZE multiple above; same lifetime and bounds reasoning as in
        // open().
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: initial_page_count,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.page_count as u64 * PAGE_SIZE as u64
    }
}

impl Storage for MmapStorage {
    fn page(&self, page_no: u32) -> Result<&[u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );
        let offset = page_no as usize * PAGE_SIZE;
        Ok(&self.mmap[offset..offset + PAGE_SIZE])
    }

    fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );
        let offset = page_no as usize * PAGE_SIZE;
        Ok(&mut self.mmap[offset..offset + PAGE_SIZE])
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn grow(&mut self, additional: u32) -> Result<()> {
        if additional == 0 {
            return Ok(());
        }

        self.mmap
            .flush()
            .wrap_err("failed to flush mmap before grow")?;

        let new_page_count = self.page_count + additional;
        let new_size = new_page_count as u64 * PAGE_SIZE as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend table file to {} bytes", new_size))?;

        // SAFETY: grow() holds &mut self, so the borrow checker guarantees no
        // outstanding page slices; the old mapping was flushed and the file
        // extended before remapping, and the old map drops on reassignment.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")? };
        self.page_count = new_page_count;

        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync mmap to disk")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_open_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.stripe");

        {
            let mut storage = MmapStorage::create(&path, 2).unwrap();
            storage.page_mut(1).unwrap()[100] = 42;
            storage.sync().unwrap();
        }

        let storage = MmapStorage::open(&path).unwrap();
        assert_eq!(storage.page_count(), 2);
        assert_eq!(storage.page(1).unwrap()[100], 42);
    }

    #[test]
    fn create_rejects_zero_pages() {
        let dir = tempdir().unwrap();
        assert!(MmapStorage::create(dir.path().join("t.stripe"), 0).is_err());
    }

    #[test]
    fn open_rejects_unaligned_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.stripe");
        std::fs::write(&path, vec![0u8; PAGE_SIZE + 1]).unwrap();

        assert!(MmapStorage::open(&path).is_err());
    }

    #[test]
    fn grow_preserves_existing_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.stripe");

        let mut storage = MmapStorage::create(&path, 1).unwrap();
        storage.page_mut(0).unwrap()[0] = 9;

        storage.grow(3).unwrap();
        assert_eq!(storage.page_count(), 4);
        assert_eq!(storage.page(0).unwrap()[0], 9);
        assert!(storage.page(3).unwrap().iter().all(|&b| b == 0));
        assert_eq!(storage.file_size(), 4 * PAGE_SIZE as u64);
    }

    #[test]
    fn page_out_of_bounds_is_error() {
        let dir = tempdir().unwrap();
        let storage = MmapStorage::create(dir.path().join("t.stripe"), 1).unwrap();
        assert!(storage.page(1).is_err());
    }
}
