//! # Per-Attribute B-tree Operations
//!
//! One independent tree per column, keyed purely by row id: a
//! column-at-a-time scan touches only the trees it projects. The root page
//! number lives in the metapage directory; trees are created lazily on first
//! insert.
//!
//! ## Descent and right-links
//!
//! Key ranges are low-inclusive, high-exclusive per page, so every row id
//! belongs to exactly one leaf. Descent routes through internal pages by
//! separator; at any level, a reader that arrives at a page whose hikey no
//! longer covers its target (a concurrent split moved the upper range to a
//! new sibling) follows the successor pointer rightward. Splits install the
//! right-link and rewrite the split page before any downlink is added to the
//! parent, so the sibling chain is complete at every instant a reader could
//! observe.
//!
//! ## Writes
//!
//! `insert` batches land in leaf insert buffers (`leaf::apply_to_leaf`).
//! When a leaf overflows even after compaction, `split_leaf` repacks its
//! elements into byte-balanced parts, chains the new pages, and propagates
//! one downlink per new page; parent overflow splits recursively, and a root
//! split grows the tree by one level.

use std::collections::VecDeque;

use eyre::{ensure, Result};
use tracing::debug;

use super::interior::{self, Downlink, InteriorNode, INTERNAL_CAPACITY};
use super::leaf::{self, LeafApply, LeafNode, LEAF_CAPACITY};
use crate::compress::Compression;
use crate::config::EngineOptions;
use crate::storage::freelist;
use crate::storage::meta;
use crate::storage::page::BtreeTrailer;
use crate::storage::Storage;
use crate::stream::encoder::encode_items;
use crate::types::{
    AttrDesc, AttrNo, CancelToken, PageNo, RowId, StreamItem, FIRST_ROW_ID, INVALID_PAGE_NO,
    MAX_ROW_ID,
};

#[derive(Debug, Clone, Copy)]
pub struct AttributeTree {
    attno: AttrNo,
    desc: AttrDesc,
}

impl AttributeTree {
    pub fn new(desc: AttrDesc) -> Self {
        Self {
            attno: desc.attno,
            desc,
        }
    }

    pub fn attno(&self) -> AttrNo {
        self.attno
    }

    pub fn desc(&self) -> &AttrDesc {
        &self.desc
    }

    fn root<S: Storage>(&self, storage: &S) -> Result<PageNo> {
        meta::attribute_root(storage, self.attno)
    }

    /// Creates the root leaf on first use.
    pub fn ensure_root<S: Storage>(&self, storage: &mut S) -> Result<PageNo> {
        let root = self.root(storage)?;
        if root != INVALID_PAGE_NO {
            return Ok(root);
        }
        let page_no = freelist::allocate_page(storage)?;
        leaf::init_leaf_page(
            storage.page_mut(page_no)?,
            BtreeTrailer {
                lokey: FIRST_ROW_ID,
                hikey: MAX_ROW_ID,
                next: INVALID_PAGE_NO,
                attno: self.attno,
                level: 0,
                flags: 0,
            },
        )?;
        meta::set_attribute_root(storage, self.attno, page_no)?;
        Ok(page_no)
    }

    /// Descends to the leaf covering `tid`. `None` when the tree has no
    /// root yet (nothing was ever inserted).
    pub fn find_leaf<S: Storage>(&self, storage: &S, tid: RowId) -> Result<Option<PageNo>> {
        if tid < FIRST_ROW_ID {
            return Ok(None);
        }
        let root = self.root(storage)?;
        if root == INVALID_PAGE_NO {
            return Ok(None);
        }

        let mut current = root;
        loop {
            let data = storage.page(current)?;
            let trailer = BtreeTrailer::from_page(data, current)?;
            ensure!(
                trailer.attno == self.attno,
                "page {}: belongs to attribute {}, expected {}",
                current,
                trailer.attno,
                self.attno
            );

            if tid >= trailer.hikey && trailer.next != INVALID_PAGE_NO {
                current = trailer.next;
                continue;
            }

            if trailer.is_leaf() {
                ensure!(
                    tid >= trailer.lokey,
                    "page {}: row id {} below leaf range [{}, {})",
                    current,
                    tid,
                    trailer.lokey,
                    trailer.hikey
                );
                return Ok(Some(current));
            }

            let node = InteriorNode::from_page(data, current)?;
            current = node.find_child(tid, current)?;
        }
    }

    /// Point lookup: outer `None` = row id not present, inner `None` = null.
    pub fn lookup<S: Storage>(
        &self,
        storage: &S,
        compression: &dyn Compression,
        tid: RowId,
    ) -> Result<Option<Option<Vec<u8>>>> {
        let Some(leaf_no) = self.find_leaf(storage, tid)? else {
            return Ok(None);
        };
        let node = LeafNode::from_page(storage.page(leaf_no)?, leaf_no)?;
        node.find(&self.desc, compression, tid)
    }

    /// Inserts or updates a sorted batch of elements.
    pub fn insert<S: Storage>(
        &self,
        storage: &mut S,
        opts: &EngineOptions,
        compression: &dyn Compression,
        items: &[StreamItem],
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        ensure!(items[0].tid >= FIRST_ROW_ID, "row id 0 is invalid");
        for pair in items.windows(2) {
            ensure!(
                pair[0].tid < pair[1].tid,
                "insert batch must be strictly increasing: {} then {}",
                pair[0].tid,
                pair[1].tid
            );
        }

        self.ensure_root(storage)?;
        let mut rest = items;
        while !rest.is_empty() {
            let leaf_no = self
                .find_leaf(storage, rest[0].tid)?
                .ok_or_else(|| eyre::eyre!("attribute {} lost its root", self.attno))?;
            let trailer = BtreeTrailer::from_page(storage.page(leaf_no)?, leaf_no)?;

            let take = rest.partition_point(|item| item.tid < trailer.hikey);
            let (batch, remaining) = rest.split_at(take);
            rest = remaining;

            let outcome = leaf::apply_to_leaf(
                storage.page_mut(leaf_no)?,
                leaf_no,
                batch,
                &self.desc,
                opts,
                compression,
            )?;
            if let LeafApply::NeedsSplit(all_items) = outcome {
                self.split_leaf(storage, opts, compression, leaf_no, all_items)?;
            }
        }
        Ok(())
    }

    /// Single-element convenience over `insert`.
    pub fn insert_one<S: Storage>(
        &self,
        storage: &mut S,
        opts: &EngineOptions,
        compression: &dyn Compression,
        tid: RowId,
        value: Option<Vec<u8>>,
    ) -> Result<()> {
        self.insert(storage, opts, compression, &[StreamItem::new(tid, value)])
    }

    fn split_leaf<S: Storage>(
        &self,
        storage: &mut S,
        opts: &EngineOptions,
        compression: &dyn Compression,
        page_no: PageNo,
        items: Vec<StreamItem>,
    ) -> Result<()> {
        let old_trailer = BtreeTrailer::from_page(storage.page(page_no)?, page_no)?;
        let parts = leaf::split_parts(items, &self.desc)?;

        let encoded: Vec<Vec<u8>> = parts
            .iter()
            .map(|part| encode_items(part, &self.desc, compression, opts.compress))
            .collect::<Result<_>>()?;
        for bytes in &encoded {
            ensure!(
                bytes.len() <= LEAF_CAPACITY,
                "page {}: split part of {} bytes still exceeds leaf capacity",
                page_no,
                bytes.len()
            );
        }

        // Separator i bounds part i below: parts[i] covers
        // [seps[i-1], seps[i]) with seps[0] implicit at the old lokey.
        let seps: Vec<RowId> = parts[1..].iter().map(|part| part[0].tid).collect();
        let mut new_pages = Vec::with_capacity(seps.len());
        for _ in &seps {
            new_pages.push(freelist::allocate_page(storage)?);
        }

        // Write the new right siblings first, then rewrite the old page to
        // point at them; a reader entering through the old page identity at
        // any point still reaches every element via the successor chain.
        for i in (1..parts.len()).rev() {
            let page = new_pages[i - 1];
            let last = i == parts.len() - 1;
            let trailer = BtreeTrailer {
                lokey: seps[i - 1],
                hikey: if last { old_trailer.hikey } else { seps[i] },
                next: if last { old_trailer.next } else { new_pages[i] },
                attno: self.attno,
                level: 0,
                flags: old_trailer.flags,
            };
            let data = storage.page_mut(page)?;
            leaf::init_leaf_page(data, trailer)?;
            leaf::set_streams(data, &encoded[i], &[])?;
        }
        {
            let data = storage.page_mut(page_no)?;
            leaf::init_leaf_page(
                data,
                BtreeTrailer {
                    lokey: old_trailer.lokey,
                    hikey: seps[0],
                    next: new_pages[0],
                    attno: self.attno,
                    level: 0,
                    flags: old_trailer.flags,
                },
            )?;
            leaf::set_streams(data, &encoded[0], &[])?;
        }
        debug!(
            attno = self.attno,
            page = page_no,
            parts = parts.len(),
            "split leaf"
        );

        for (i, &page) in new_pages.iter().enumerate() {
            self.insert_downlink(storage, seps[i], page, 0)?;
        }
        Ok(())
    }

    /// Installs the downlink `(sep, child)` in the internal page one level
    /// above `child_level`, splitting upward as needed. When the root itself
    /// is at `child_level`, a new root is created and the tree grows.
    fn insert_downlink<S: Storage>(
        &self,
        storage: &mut S,
        sep: RowId,
        child: PageNo,
        child_level: u16,
    ) -> Result<()> {
        let root = self.root(storage)?;
        let root_trailer = BtreeTrailer::from_page(storage.page(root)?, root)?;

        if root_trailer.level == child_level {
            let new_root = freelist::allocate_page(storage)?;
            let entries = [
                Downlink {
                    lokey: root_trailer.lokey,
                    child: root,
                },
                Downlink { lokey: sep, child },
            ];
            interior::init_internal_page(
                storage.page_mut(new_root)?,
                BtreeTrailer {
                    lokey: root_trailer.lokey,
                    hikey: MAX_ROW_ID,
                    next: INVALID_PAGE_NO,
                    attno: self.attno,
                    level: child_level + 1,
                    flags: 0,
                },
                &entries,
            )?;
            meta::set_attribute_root(storage, self.attno, new_root)?;
            debug!(
                attno = self.attno,
                level = child_level + 1,
                "root split, tree height increased"
            );
            return Ok(());
        }

        let mut current = root;
        loop {
            let data = storage.page(current)?;
            let trailer = BtreeTrailer::from_page(data, current)?;
            if sep >= trailer.hikey && trailer.next != INVALID_PAGE_NO {
                current = trailer.next;
                continue;
            }
            ensure!(
                trailer.level > child_level,
                "page {}: descent for separator {} fell past level {}",
                current,
                sep,
                child_level
            );
            if trailer.level == child_level + 1 {
                break;
            }
            let node = InteriorNode::from_page(data, current)?;
            current = node.find_child(sep, current)?;
        }

        let (mut entries, cur_trailer) = {
            let node = InteriorNode::from_page(storage.page(current)?, current)?;
            (node.entries(), *node.trailer())
        };
        let pos = entries.partition_point(|e| e.lokey < sep);
        ensure!(
            pos == entries.len() || entries[pos].lokey != sep,
            "page {}: duplicate separator {}",
            current,
            sep
        );
        entries.insert(pos, Downlink { lokey: sep, child });

        if entries.len() <= INTERNAL_CAPACITY {
            interior::rewrite_entries(storage.page_mut(current)?, current, &entries)?;
            return Ok(());
        }

        let mid = entries.len() / 2;
        let right_entries = entries.split_off(mid);
        let right_first = right_entries[0].lokey;
        let new_page = freelist::allocate_page(storage)?;
        interior::init_internal_page(
            storage.page_mut(new_page)?,
            BtreeTrailer {
                lokey: right_first,
                hikey: cur_trailer.hikey,
                next: cur_trailer.next,
                attno: self.attno,
                level: cur_trailer.level,
                flags: 0,
            },
            &right_entries,
        )?;
        interior::init_internal_page(
            storage.page_mut(current)?,
            BtreeTrailer {
                lokey: cur_trailer.lokey,
                hikey: right_first,
                next: new_page,
                attno: self.attno,
                level: cur_trailer.level,
                flags: 0,
            },
            &entries,
        )?;
        debug!(attno = self.attno, page = current, "split internal page");

        self.insert_downlink(storage, right_first, new_page, cur_trailer.level)
    }

    /// Highest row id present in the tree, 0 when empty. Reads only stream
    /// headers along the rightmost spine.
    pub fn max_tid<S: Storage>(&self, storage: &S) -> Result<RowId> {
        let root = self.root(storage)?;
        if root == INVALID_PAGE_NO {
            return Ok(0);
        }
        let mut current = root;
        loop {
            let data = storage.page(current)?;
            let trailer = BtreeTrailer::from_page(data, current)?;
            if trailer.next != INVALID_PAGE_NO {
                current = trailer.next;
                continue;
            }
            if trailer.is_leaf() {
                return LeafNode::from_page(data, current)?.last_tid();
            }
            let node = InteriorNode::from_page(data, current)?;
            current = node.entry(node.entry_count() - 1).child;
        }
    }

    /// Starts a lazy scan over `[start, end)`.
    pub fn scan(&self, start: RowId, end: RowId, token: CancelToken) -> TreeScan {
        TreeScan {
            tree: *self,
            next_tid: start.max(FIRST_ROW_ID),
            end_tid: end,
            queue: VecDeque::new(),
            done: start >= end,
            token,
        }
    }
}

/// Lazy, restartable range scan. Decodes one leaf at a time; a scan can be
/// abandoned and a new one started at the last seen row id + 1 to resume.
pub struct TreeScan {
    tree: AttributeTree,
    next_tid: RowId,
    end_tid: RowId,
    queue: VecDeque<StreamItem>,
    done: bool,
    token: CancelToken,
}

impl TreeScan {
    pub fn next<S: Storage>(
        &mut self,
        storage: &S,
        compression: &dyn Compression,
    ) -> Result<Option<StreamItem>> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Ok(Some(item));
            }
            if self.done {
                return Ok(None);
            }
            self.token.check()?;

            let Some(leaf_no) = self.tree.find_leaf(storage, self.next_tid)? else {
                self.done = true;
                return Ok(None);
            };
            let data = storage.page(leaf_no)?;
            let trailer = BtreeTrailer::from_page(data, leaf_no)?;
            let node = LeafNode::from_page(data, leaf_no)?;
            for item in node.items(self.tree.desc(), compression)? {
                if item.tid >= self.next_tid && item.tid < self.end_tid {
                    self.queue.push_back(item);
                }
            }

            if trailer.hikey >= self.end_tid || trailer.next == INVALID_PAGE_NO {
                self.done = true;
            } else {
                self.next_tid = trailer.hikey;
            }
        }
    }

    /// Drains the scan into a vector.
    pub fn collect_all<S: Storage>(
        mut self,
        storage: &S,
        compression: &dyn Compression,
    ) -> Result<Vec<StreamItem>> {
        let mut items = Vec::new();
        while let Some(item) = self.next(storage, compression)? {
            items.push(item);
        }
        Ok(items)
    }
}
