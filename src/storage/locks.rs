//! # Page-Level Locking
//!
//! Shared/exclusive locks per page number, handed out as RAII guards. The
//! engine core acquires a lock for each well-scoped region that reads or
//! mutates a page and relies on guard drop to release it on every exit path,
//! including error unwinds.
//!
//! The manager is sharded to keep lock-table contention off the hot path:
//! a page's lock entry lives in one of 128 shards selected by page number,
//! and entries are reference-counted so the table only holds pages somebody
//! is actively locking.
//!
//! Deadlock avoidance is by ordering: callers that need several exclusive
//! locks at once take them in ascending page-number order
//! (`page_write_multi`). The metapage (page 0) therefore always sorts first,
//! which is what we want: it is the hottest shared resource and must be
//! held for the shortest possible scope.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::types::PageNo;

const SHARD_COUNT: usize = 128;

#[derive(Debug, Default)]
pub struct LockStats {
    pub acquired: AtomicU64,
    pub contended: AtomicU64,
}

impl LockStats {
    fn record(&self, contended: bool) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        if contended {
            self.contended.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct LockEntry {
    lock: RwLock<()>,
    ref_count: AtomicU64,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            lock: RwLock::new(()),
            ref_count: AtomicU64::new(1),
        }
    }
}

struct LockShard {
    entries: Mutex<HashMap<PageNo, Arc<LockEntry>>>,
}

impl LockShard {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, page_no: PageNo) -> Arc<LockEntry> {
        let mut map = self.entries.lock();
        if let Some(entry) = map.get(&page_no) {
            entry.ref_count.fetch_add(1, Ordering::AcqRel);
            return Arc::clone(entry);
        }
        let entry = Arc::new(LockEntry::new());
        map.insert(page_no, Arc::clone(&entry));
        entry
    }

    fn release_ref(&self, page_no: PageNo, entry: &LockEntry) {
        if entry.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut map = self.entries.lock();
            // Re-check under the shard lock: another thread may have taken a
            // reference between our decrement and this cleanup.
            if entry.ref_count.load(Ordering::Acquire) == 0 {
                map.remove(&page_no);
            }
        }
    }
}

/// Shared (read) lock on one page. Released on drop.
pub struct PageReadGuard {
    shard: *const LockShard,
    page_no: PageNo,
    entry: Arc<LockEntry>,
}

// SAFETY: the shard pointer targets a slot inside PageLockManager, which the
// embedder keeps alive (typically in an Arc) for as long as any guard exists;
// the entry Arc keeps the lock itself alive regardless.
unsafe impl Send for PageReadGuard {}
unsafe impl Sync for PageReadGuard {}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        // SAFETY: page_read acquired and forgot a read guard on this lock, so
        // this thread holds exactly one read lock to release.
        unsafe { self.entry.lock.force_unlock_read() };
        // SAFETY: see the Send/Sync rationale above.
        unsafe { (*self.shard).release_ref(self.page_no, &self.entry) };
    }
}

/// Exclusive (write) lock on one page. Released on drop.
pub struct PageWriteGuard {
    shard: *const LockShard,
    page_no: PageNo,
    entry: Arc<LockEntry>,
}

// SAFETY: same reasoning as PageReadGuard.
unsafe impl Send for PageWriteGuard {}
unsafe impl Sync for PageWriteGuard {}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        // SAFETY: page_write acquired and forgot a write guard on this lock.
        unsafe { self.entry.lock.force_unlock_write() };
        // SAFETY: see the Send/Sync rationale above.
        unsafe { (*self.shard).release_ref(self.page_no, &self.entry) };
    }
}

pub struct PageLockManager {
    shards: Vec<LockShard>,
    pub stats: LockStats,
}

impl Default for PageLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PageLockManager {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| LockShard::new()).collect(),
            stats: LockStats::default(),
        }
    }

    fn shard(&self, page_no: PageNo) -> &LockShard {
        &self.shards[page_no as usize % SHARD_COUNT]
    }

    /// Acquires a shared lock on a page (blocking).
    pub fn page_read(&self, page_no: PageNo) -> PageReadGuard {
        let shard = self.shard(page_no);
        let entry = shard.get_or_create(page_no);

        let contended = entry.lock.try_read().is_none();
        let guard = entry.lock.read();
        // Ownership of the lock moves into the RAII guard below; Drop
        // releases it via force_unlock_read.
        std::mem::forget(guard);
        self.stats.record(contended);

        PageReadGuard {
            shard: shard as *const LockShard,
            page_no,
            entry,
        }
    }

    /// Acquires an exclusive lock on a page (blocking).
    pub fn page_write(&self, page_no: PageNo) -> PageWriteGuard {
        let shard = self.shard(page_no);
        let entry = shard.get_or_create(page_no);

        let contended = entry.lock.try_write().is_none();
        let guard = entry.lock.write();
        std::mem::forget(guard);
        self.stats.record(contended);

        PageWriteGuard {
            shard: shard as *const LockShard,
            page_no,
            entry,
        }
    }

    /// Acquires exclusive locks on several pages in ascending page order,
    /// the crate-wide deadlock-avoidance order.
    pub fn page_write_multi(&self, pages: &[PageNo]) -> Vec<PageWriteGuard> {
        let mut sorted = pages.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        sorted.into_iter().map(|p| self.page_write(p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn read_then_drop_releases() {
        let manager = PageLockManager::new();
        drop(manager.page_read(100));
        drop(manager.page_write(100));
        assert_eq!(manager.stats.acquired.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn concurrent_readers_share() {
        let manager = PageLockManager::new();
        let g1 = manager.page_read(7);
        let g2 = manager.page_read(7);
        drop(g1);
        drop(g2);
    }

    #[test]
    fn different_pages_do_not_block() {
        let manager = Arc::new(PageLockManager::new());
        let other = Arc::clone(&manager);

        let _held = manager.page_write(1);
        let handle = thread::spawn(move || other.page_write(2));
        drop(handle.join().unwrap());
    }

    #[test]
    fn entries_are_cleaned_up_after_last_guard() {
        let manager = PageLockManager::new();
        {
            let _g = manager.page_write(3);
        }
        let shard = manager.shard(3);
        assert!(shard.entries.lock().is_empty());
    }

    #[test]
    fn multi_lock_sorts_and_dedups() {
        let manager = PageLockManager::new();
        let guards = manager.page_write_multi(&[30, 10, 20, 10]);
        assert_eq!(guards.len(), 3);
    }
}
