//! # Row-Level Table Operations
//!
//! `Table` coordinates the per-column trees, the meta tree, the undo log,
//! and the toast chains into whole-row inserts, updates, deletes, and
//! MVCC-visible fetches.
//!
//! ## Write path
//!
//! Every mutation appends its undo record *before* touching the trees: the
//! pre-image is durable in the log by the time the new version becomes
//! reachable. The meta-tree entry for the row then points at that record,
//! and each column tree absorbs the new value (oversized values are diverted
//! to a toast chain and the stream stores a pointer).
//!
//! ## Read path
//!
//! A fetch reads the row's meta entry and asks the host's `Visibility`
//! oracle about its transaction. A visible current version is served from
//! the column tree directly. An invisible one starts a walk down the undo
//! chain: each record's payload is the row image the operation replaced, so
//! the newest record whose *predecessor* is visible hands back its
//! pre-image. A walk that reaches an insert from an invisible transaction
//! means the row did not exist for this snapshot; a pointer below the
//! oldest-retained watermark means the version in hand predates all live
//! snapshots and is served as-is.
//!
//! ## Toast reclamation
//!
//! Historic row images may reference toast chains, so overwriting a toasted
//! value never frees its chain inline. `vacuum` sweeps the undo records
//! about to fall below the new watermark, frees the chains their images
//! reference (unless the live row still uses the same chain), then advances
//! the watermark and truncates the log.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::btree::{AttributeTree, TreeScan};
use crate::compress::{Compression, Lz4Compression};
use crate::config::EngineOptions;
use crate::snapshot::{Snapshot, VersionMeta, Visibility, VERSION_META_LEN};
use crate::storage::{meta, Storage};
use crate::stream::varint::{get_varint, put_varint};
use crate::toast::{is_toast_pointer, toast_read, toast_store, ToastPointer};
use crate::types::{AttrDesc, AttrNo, CancelToken, RowId, TxnId, META_ATTNO};
use crate::undo::{self, log::UNDO_PAGE_CAPACITY, UndoOp, UndoRecPtr, UNDO_RECORD_HEADER_SIZE};

/// Result of a visibility-checked fetch. Absence is a normal outcome, not an
/// error: the row may never have existed, be deleted, or be invisible to the
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    Value(Option<Vec<u8>>),
    NotFound,
}

pub struct Table {
    descs: Vec<AttrDesc>,
    meta_tree: AttributeTree,
    trees: Vec<AttributeTree>,
    opts: EngineOptions,
    compression: Box<dyn Compression>,
}

impl Table {
    fn build(descs: Vec<AttrDesc>, opts: EngineOptions) -> Result<Table> {
        ensure!(!descs.is_empty(), "a table needs at least one attribute");
        for (i, desc) in descs.iter().enumerate() {
            ensure!(
                desc.attno as usize == i + 1,
                "attribute descriptors must be numbered 1..=n, got {} at position {}",
                desc.attno,
                i
            );
        }
        let meta_tree = AttributeTree::new(AttrDesc::fixed(META_ATTNO, VERSION_META_LEN, false));
        let trees = descs.iter().map(|d| AttributeTree::new(*d)).collect();
        Ok(Table {
            descs,
            meta_tree,
            trees,
            opts,
            compression: Box::new(Lz4Compression),
        })
    }

    /// Initializes page 0 and returns a handle for a brand-new table.
    pub fn create<S: Storage>(
        storage: &mut S,
        descs: Vec<AttrDesc>,
        opts: EngineOptions,
    ) -> Result<Table> {
        let table = Self::build(descs, opts)?;
        meta::init_metapage(storage.page_mut(0)?, table.descs.len() as AttrNo)?;
        Ok(table)
    }

    /// Opens an existing table, checking the stored directory shape.
    pub fn open<S: Storage>(storage: &S, descs: Vec<AttrDesc>, opts: EngineOptions) -> Result<Table> {
        let table = Self::build(descs, opts)?;
        let slots = meta::directory_slots(storage)?;
        ensure!(
            slots as usize == table.descs.len() + 1,
            "table has {} attribute slots on disk, caller described {}",
            slots,
            table.descs.len() + 1
        );
        Ok(table)
    }

    /// Replaces the compression implementation (default: LZ4).
    pub fn with_compression(mut self, compression: Box<dyn Compression>) -> Table {
        self.compression = compression;
        self
    }

    pub fn attr_count(&self) -> usize {
        self.descs.len()
    }

    pub fn descs(&self) -> &[AttrDesc] {
        &self.descs
    }

    pub fn compression(&self) -> &dyn Compression {
        self.compression.as_ref()
    }

    fn tree(&self, attno: AttrNo) -> Result<&AttributeTree> {
        ensure!(
            attno >= 1 && attno as usize <= self.trees.len(),
            "attribute {} out of range (table has {} columns)",
            attno,
            self.trees.len()
        );
        Ok(&self.trees[attno as usize - 1])
    }

    /// Converts a caller value to its in-stream representation, diverting
    /// oversized variable-length values to a toast chain.
    fn store_value<S: Storage>(
        &self,
        storage: &mut S,
        tid: RowId,
        desc: &AttrDesc,
        value: Option<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>> {
        match value {
            Some(v) if desc.is_variable() && v.len() > self.opts.toast_threshold => {
                let pointer =
                    toast_store(storage, tid, &v, self.compression(), self.opts.compress)?;
                Ok(Some(pointer.encode().to_vec()))
            }
            other => Ok(other),
        }
    }

    fn detoast<S: Storage>(&self, storage: &S, value: Option<Vec<u8>>) -> Result<Option<Vec<u8>>> {
        match value {
            Some(v) if is_toast_pointer(&v) => {
                let pointer = ToastPointer::decode(&v)?;
                Ok(Some(toast_read(storage, pointer.first_blkno, self.compression())?))
            }
            other => Ok(other),
        }
    }

    /// Encodes a pre-image for the undo log. A row of several wide inline
    /// values can exceed what one undo page holds; in that case the largest
    /// values are redirected into toast chains and the image stores pointers
    /// instead, shrinking until the record fits.
    fn pre_image_payload<S: Storage>(
        &self,
        storage: &mut S,
        tid: RowId,
        old_values: Vec<Option<Vec<u8>>>,
    ) -> Result<Vec<u8>> {
        let payload = encode_row_image(&old_values);
        if UNDO_RECORD_HEADER_SIZE + payload.len() <= UNDO_PAGE_CAPACITY {
            return Ok(payload);
        }

        let mut values = old_values;
        loop {
            let candidate = values
                .iter()
                .enumerate()
                .filter_map(|(i, v)| v.as_ref().map(|b| (i, b.len(), is_toast_pointer(b))))
                .filter(|(_, len, pointer)| !pointer && *len > crate::toast::TOAST_POINTER_SIZE)
                .max_by_key(|(_, len, _)| *len);
            let Some((idx, _, _)) = candidate else {
                bail!("row {}: pre-image cannot fit an undo record", tid);
            };

            let bytes = values[idx].take().unwrap(); // INVARIANT: candidate had Some
            let pointer = toast_store(storage, tid, &bytes, self.compression(), self.opts.compress)?;
            values[idx] = Some(pointer.encode().to_vec());

            let payload = encode_row_image(&values);
            if UNDO_RECORD_HEADER_SIZE + payload.len() <= UNDO_PAGE_CAPACITY {
                return Ok(payload);
            }
        }
    }

    /// The row's current inline column values (toast pointers unresolved).
    fn read_inline_row<S: Storage>(&self, storage: &S, tid: RowId) -> Result<Vec<Option<Vec<u8>>>> {
        let mut values = Vec::with_capacity(self.descs.len());
        for tree in &self.trees {
            let value = tree
                .lookup(storage, self.compression(), tid)?
                .unwrap_or(None);
            values.push(value);
        }
        Ok(values)
    }

    /// Inserts a row and returns its assigned id.
    pub fn insert_row<S: Storage>(
        &self,
        storage: &mut S,
        txn_id: TxnId,
        values: &[Option<Vec<u8>>],
    ) -> Result<RowId> {
        ensure!(
            values.len() == self.descs.len(),
            "row has {} values, table has {} columns",
            values.len(),
            self.descs.len()
        );

        let tid = self.meta_tree.max_tid(storage)? + 1;
        let undo_ptr =
            undo::append_record(storage, UndoOp::Insert, txn_id, tid, UndoRecPtr::INVALID, &[])?;

        let entry = VersionMeta::new(txn_id, undo_ptr);
        self.meta_tree.insert_one(
            storage,
            &self.opts,
            self.compression(),
            tid,
            Some(entry.to_bytes()),
        )?;

        for (desc, value) in self.descs.iter().zip(values.iter().cloned()) {
            let stored = self.store_value(storage, tid, desc, value)?;
            self.tree(desc.attno)?
                .insert_one(storage, &self.opts, self.compression(), tid, stored)?;
        }
        Ok(tid)
    }

    fn current_entry<S: Storage>(&self, storage: &S, tid: RowId) -> Result<Option<VersionMeta>> {
        match self
            .meta_tree
            .lookup(storage, self.compression(), tid)?
        {
            None => Ok(None),
            Some(None) => bail!("row {}: null version metadata entry", tid),
            Some(Some(bytes)) => Ok(Some(VersionMeta::from_bytes(&bytes)?)),
        }
    }

    /// Overwrites a row, logging the pre-image.
    pub fn update_row<S: Storage>(
        &self,
        storage: &mut S,
        txn_id: TxnId,
        tid: RowId,
        values: &[Option<Vec<u8>>],
    ) -> Result<()> {
        ensure!(
            values.len() == self.descs.len(),
            "row has {} values, table has {} columns",
            values.len(),
            self.descs.len()
        );
        let old_entry = self
            .current_entry(storage, tid)?
            .ok_or_else(|| eyre::eyre!("row {} does not exist", tid))?;
        ensure!(!old_entry.is_deleted(), "row {} is deleted", tid);

        let old_values = self.read_inline_row(storage, tid)?;
        let payload = self.pre_image_payload(storage, tid, old_values)?;
        let undo_ptr = undo::append_record(
            storage,
            UndoOp::Update,
            txn_id,
            tid,
            old_entry.undo,
            &payload,
        )?;

        let entry = VersionMeta::new(txn_id, undo_ptr);
        self.meta_tree.insert_one(
            storage,
            &self.opts,
            self.compression(),
            tid,
            Some(entry.to_bytes()),
        )?;
        for (desc, value) in self.descs.iter().zip(values.iter().cloned()) {
            let stored = self.store_value(storage, tid, desc, value)?;
            self.tree(desc.attno)?
                .insert_one(storage, &self.opts, self.compression(), tid, stored)?;
        }
        Ok(())
    }

    /// Marks a row deleted, logging the pre-image.
    pub fn delete_row<S: Storage>(&self, storage: &mut S, txn_id: TxnId, tid: RowId) -> Result<()> {
        let old_entry = self
            .current_entry(storage, tid)?
            .ok_or_else(|| eyre::eyre!("row {} does not exist", tid))?;
        ensure!(!old_entry.is_deleted(), "row {} is already deleted", tid);

        let old_values = self.read_inline_row(storage, tid)?;
        let payload = self.pre_image_payload(storage, tid, old_values)?;
        let undo_ptr = undo::append_record(
            storage,
            UndoOp::Delete,
            txn_id,
            tid,
            old_entry.undo,
            &payload,
        )?;

        let mut entry = VersionMeta::new(txn_id, undo_ptr);
        entry.set_deleted(true);
        self.meta_tree.insert_one(
            storage,
            &self.opts,
            self.compression(),
            tid,
            Some(entry.to_bytes()),
        )
    }

    /// Fetches one column of one row as seen by `snapshot`.
    pub fn fetch<S: Storage>(
        &self,
        storage: &S,
        visibility: &dyn Visibility,
        snapshot: Snapshot,
        tid: RowId,
        attno: AttrNo,
    ) -> Result<FetchResult> {
        self.tree(attno)?;
        let Some(entry) = self.current_entry(storage, tid)? else {
            return Ok(FetchResult::NotFound);
        };

        let oldest = meta::read_trailer(storage)?.oldest_undo;

        // Fast path: the current version predates retained history or is
        // visible outright.
        if entry.undo.counter < oldest.counter || visibility.is_visible(snapshot, entry.txn_id) {
            if entry.is_deleted() {
                return Ok(FetchResult::NotFound);
            }
            let value = self
                .tree(attno)?
                .lookup(storage, self.compression(), tid)?
                .unwrap_or(None);
            return Ok(FetchResult::Value(self.detoast(storage, value)?));
        }

        // The current version is invisible: walk backwards for the newest
        // pre-image whose creating transaction is visible.
        let Some(mut record) = undo::read_record(storage, entry.undo)? else {
            // The record was truncated between our checks; the version it
            // created is by definition visible to everyone now.
            if entry.is_deleted() {
                return Ok(FetchResult::NotFound);
            }
            let value = self
                .tree(attno)?
                .lookup(storage, self.compression(), tid)?
                .unwrap_or(None);
            return Ok(FetchResult::Value(self.detoast(storage, value)?));
        };

        loop {
            match record.op {
                UndoOp::Insert => return Ok(FetchResult::NotFound),
                UndoOp::Update | UndoOp::Delete => {
                    let serve_image = if !record.prev.is_valid() {
                        // No older version is recorded; the pre-image is the
                        // base version every snapshot may see.
                        true
                    } else if record.prev.counter < oldest.counter {
                        true
                    } else {
                        match undo::read_record(storage, record.prev)? {
                            None => true,
                            Some(prev) => {
                                if visibility.is_visible(snapshot, prev.txn_id) {
                                    true
                                } else {
                                    record = prev;
                                    false
                                }
                            }
                        }
                    };
                    if serve_image {
                        let image = decode_row_image(&record.payload, self.descs.len())?;
                        let value = image[attno as usize - 1].clone();
                        return Ok(FetchResult::Value(self.detoast(storage, value)?));
                    }
                }
            }
        }
    }

    /// Fetches a whole row as seen by `snapshot`.
    pub fn fetch_row<S: Storage>(
        &self,
        storage: &S,
        visibility: &dyn Visibility,
        snapshot: Snapshot,
        tid: RowId,
    ) -> Result<Option<Vec<Option<Vec<u8>>>>> {
        let mut row = Vec::with_capacity(self.descs.len());
        for attno in 1..=self.descs.len() as AttrNo {
            match self.fetch(storage, visibility, snapshot, tid, attno)? {
                FetchResult::NotFound => return Ok(None),
                FetchResult::Value(value) => row.push(value),
            }
        }
        Ok(Some(row))
    }

    /// Starts a raw scan of one column (no visibility filtering; callers
    /// combine it with meta-entry checks as needed).
    pub fn scan_column(
        &self,
        attno: AttrNo,
        start: RowId,
        end: RowId,
        token: CancelToken,
    ) -> Result<TreeScan> {
        Ok(self.tree(attno)?.scan(start, end, token))
    }

    /// Reclaims history below `watermark`: frees toast chains referenced
    /// only by expiring undo records, then advances the oldest-retained
    /// pointer and truncates the log.
    pub fn vacuum<S: Storage>(
        &self,
        storage: &mut S,
        watermark: UndoRecPtr,
        token: CancelToken,
    ) -> Result<()> {
        let mut expiring_chains: SmallVec<[ToastPointer; 8]> = SmallVec::new();

        let mut scan = undo::scan_from(storage, UndoRecPtr::INVALID, token)?;
        while let Some(record) = scan.next(storage)? {
            if record.ptr.counter >= watermark.counter {
                break;
            }
            if record.payload.is_empty() {
                continue;
            }
            let image = decode_row_image(&record.payload, self.descs.len())?;
            for value in image.into_iter().flatten() {
                if is_toast_pointer(&value) {
                    expiring_chains.push(ToastPointer::decode(&value)?);
                }
            }
        }

        for pointer in expiring_chains {
            // Keep the chain when the live row still stores this pointer,
            // unless the row's deletion itself expired with this sweep, in
            // which case nothing can reach the chain anymore.
            let live = match self.current_entry(storage, pointer.tid)? {
                None => false,
                Some(entry) if entry.is_deleted() && entry.undo.counter < watermark.counter => {
                    false
                }
                Some(_) => self
                    .read_inline_row(storage, pointer.tid)?
                    .into_iter()
                    .flatten()
                    .any(|v| {
                        is_toast_pointer(&v)
                            && ToastPointer::decode(&v)
                                .map(|p| p.first_blkno == pointer.first_blkno)
                                .unwrap_or(false)
                    }),
            };
            if live {
                continue;
            }
            reclaim_chain_if_present(storage, &pointer)?;
        }

        undo::advance_oldest(storage, watermark)
    }
}

/// Frees a chain unless it was already reclaimed (e.g. referenced by two
/// expiring pre-images).
fn reclaim_chain_if_present<S: Storage>(storage: &mut S, pointer: &ToastPointer) -> Result<()> {
    use crate::storage::page::{page_tag, TOAST_PAGE_TAG};

    if pointer.first_blkno >= storage.page_count() {
        return Ok(());
    }
    let data = storage.page(pointer.first_blkno)?;
    if page_tag(data) != TOAST_PAGE_TAG {
        return Ok(());
    }
    let trailer =
        crate::storage::page::ToastTrailer::from_page(data, pointer.first_blkno)?;
    if trailer.tid != pointer.tid || trailer.slice_offset != 0 {
        return Ok(());
    }
    crate::toast::toast_delete(storage, pointer.first_blkno)
}

/// Packs a row's inline values for an undo payload: per attribute, a null
/// marker or a length-prefixed value.
pub fn encode_row_image(values: &[Option<Vec<u8>>]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        match value {
            None => out.push(0),
            Some(v) => {
                out.push(1);
                put_varint(&mut out, v.len() as u64);
                out.extend_from_slice(v);
            }
        }
    }
    out
}

pub fn decode_row_image(payload: &[u8], natts: usize) -> Result<Vec<Option<Vec<u8>>>> {
    let mut values = Vec::with_capacity(natts);
    let mut pos = 0;
    for attno in 1..=natts {
        ensure!(
            pos < payload.len(),
            "row image truncated at attribute {}",
            attno
        );
        match payload[pos] {
            0 => {
                values.push(None);
                pos += 1;
            }
            1 => {
                pos += 1;
                let (len, n) = get_varint(&payload[pos..])?;
                pos += n;
                let len = len as usize;
                ensure!(
                    pos + len <= payload.len(),
                    "row image value extends past payload at attribute {}",
                    attno
                );
                values.push(Some(payload[pos..pos + len].to_vec()));
                pos += len;
            }
            other => bail!("corrupt row image: marker {} at attribute {}", other, attno),
        }
    }
    ensure!(
        pos == payload.len(),
        "row image has {} trailing bytes",
        payload.len() - pos
    );
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ReadTsVisibility;
    use crate::storage::MemStorage;

    fn two_column_table() -> (MemStorage, Table) {
        let mut storage = MemStorage::new(1);
        let descs = vec![AttrDesc::fixed(1, 8, true), AttrDesc::variable(2)];
        let table = Table::create(&mut storage, descs, EngineOptions::default()).unwrap();
        (storage, table)
    }

    fn row(id: u64, text: &str) -> Vec<Option<Vec<u8>>> {
        vec![
            Some(id.to_le_bytes().to_vec()),
            Some(text.as_bytes().to_vec()),
        ]
    }

    fn fetch(
        storage: &MemStorage,
        table: &Table,
        read_ts: u64,
        tid: RowId,
        attno: AttrNo,
    ) -> FetchResult {
        table
            .fetch(
                storage,
                &ReadTsVisibility,
                Snapshot::with_read_ts(read_ts),
                tid,
                attno,
            )
            .unwrap()
    }

    #[test]
    fn row_image_roundtrip() {
        let values = vec![Some(b"abc".to_vec()), None, Some(Vec::new())];
        let payload = encode_row_image(&values);
        assert_eq!(decode_row_image(&payload, 3).unwrap(), values);
        assert!(decode_row_image(&payload, 4).is_err());
        assert!(decode_row_image(&payload[..payload.len() - 1], 3).is_err());
    }

    #[test]
    fn insert_assigns_sequential_tids() {
        let (mut storage, table) = two_column_table();
        assert_eq!(table.insert_row(&mut storage, 10, &row(1, "a")).unwrap(), 1);
        assert_eq!(table.insert_row(&mut storage, 10, &row(2, "b")).unwrap(), 2);
        assert_eq!(table.insert_row(&mut storage, 11, &row(3, "c")).unwrap(), 3);
    }

    #[test]
    fn fetch_visible_row() {
        let (mut storage, table) = two_column_table();
        let tid = table.insert_row(&mut storage, 10, &row(7, "hello")).unwrap();

        assert_eq!(
            fetch(&storage, &table, 10, tid, 2),
            FetchResult::Value(Some(b"hello".to_vec()))
        );
        assert_eq!(
            fetch(&storage, &table, 10, tid, 1),
            FetchResult::Value(Some(7u64.to_le_bytes().to_vec()))
        );
    }

    #[test]
    fn insert_invisible_to_older_snapshot() {
        let (mut storage, table) = two_column_table();
        let tid = table.insert_row(&mut storage, 10, &row(7, "hello")).unwrap();

        assert_eq!(fetch(&storage, &table, 9, tid, 2), FetchResult::NotFound);
        assert_eq!(
            fetch(&storage, &table, 10, tid, 2),
            FetchResult::Value(Some(b"hello".to_vec()))
        );
    }

    #[test]
    fn nonexistent_row_is_not_found() {
        let (storage, table) = two_column_table();
        assert_eq!(fetch(&storage, &table, 100, 1, 1), FetchResult::NotFound);
    }

    #[test]
    fn null_columns_roundtrip() {
        let (mut storage, table) = two_column_table();
        let tid = table
            .insert_row(&mut storage, 5, &vec![None, Some(b"x".to_vec())])
            .unwrap();
        assert_eq!(fetch(&storage, &table, 5, tid, 1), FetchResult::Value(None));
    }

    #[test]
    fn update_is_versioned() {
        let (mut storage, table) = two_column_table();
        let tid = table.insert_row(&mut storage, 10, &row(1, "v1")).unwrap();
        table.update_row(&mut storage, 20, tid, &row(1, "v2")).unwrap();
        table.update_row(&mut storage, 30, tid, &row(1, "v3")).unwrap();

        assert_eq!(
            fetch(&storage, &table, 10, tid, 2),
            FetchResult::Value(Some(b"v1".to_vec()))
        );
        assert_eq!(
            fetch(&storage, &table, 25, tid, 2),
            FetchResult::Value(Some(b"v2".to_vec()))
        );
        assert_eq!(
            fetch(&storage, &table, 30, tid, 2),
            FetchResult::Value(Some(b"v3".to_vec()))
        );
        assert_eq!(fetch(&storage, &table, 9, tid, 2), FetchResult::NotFound);
    }

    #[test]
    fn delete_respects_snapshots() {
        let (mut storage, table) = two_column_table();
        let tid = table.insert_row(&mut storage, 10, &row(1, "here")).unwrap();
        table.delete_row(&mut storage, 20, tid).unwrap();

        assert_eq!(
            fetch(&storage, &table, 15, tid, 2),
            FetchResult::Value(Some(b"here".to_vec()))
        );
        assert_eq!(fetch(&storage, &table, 20, tid, 2), FetchResult::NotFound);
        assert!(table.delete_row(&mut storage, 21, tid).is_err());
        assert!(table.update_row(&mut storage, 21, tid, &row(1, "no")).is_err());
    }

    #[test]
    fn fetch_row_assembles_all_columns() {
        let (mut storage, table) = two_column_table();
        let tid = table.insert_row(&mut storage, 10, &row(9, "whole")).unwrap();

        let got = table
            .fetch_row(&storage, &ReadTsVisibility, Snapshot::with_read_ts(10), tid)
            .unwrap();
        assert_eq!(got, Some(row(9, "whole")));

        let gone = table
            .fetch_row(&storage, &ReadTsVisibility, Snapshot::with_read_ts(9), tid)
            .unwrap();
        assert_eq!(gone, None);
    }

    #[test]
    fn toasted_value_roundtrips_through_fetch() {
        let (mut storage, table) = two_column_table();
        let big = vec![0xCDu8; 100_000];
        let tid = table
            .insert_row(&mut storage, 10, &vec![None, Some(big.clone())])
            .unwrap();

        assert_eq!(
            fetch(&storage, &table, 10, tid, 2),
            FetchResult::Value(Some(big))
        );
    }

    #[test]
    fn old_snapshot_reads_replaced_toast_value() {
        let (mut storage, table) = two_column_table();
        let big_v1 = vec![1u8; 50_000];
        let big_v2 = vec![2u8; 50_000];
        let tid = table
            .insert_row(&mut storage, 10, &vec![None, Some(big_v1.clone())])
            .unwrap();
        table
            .update_row(&mut storage, 20, tid, &vec![None, Some(big_v2.clone())])
            .unwrap();

        assert_eq!(
            fetch(&storage, &table, 15, tid, 2),
            FetchResult::Value(Some(big_v1))
        );
        assert_eq!(
            fetch(&storage, &table, 20, tid, 2),
            FetchResult::Value(Some(big_v2))
        );
    }

    #[test]
    fn vacuum_frees_replaced_toast_chains() {
        use crate::storage::freelist;

        let (mut storage, table) = two_column_table();
        let big_v1 = vec![1u8; 50_000];
        let big_v2 = vec![2u8; 50_000];
        let tid = table
            .insert_row(&mut storage, 10, &vec![None, Some(big_v1)])
            .unwrap();
        table
            .update_row(&mut storage, 20, tid, &vec![None, Some(big_v2.clone())])
            .unwrap();

        assert_eq!(freelist::free_page_count(&storage).unwrap(), 0);

        // Move the watermark past everything: v1's chain is only referenced
        // by the expiring update record.
        let tail = meta::read_trailer(&storage).unwrap();
        let watermark = UndoRecPtr {
            counter: tail.undo_tail_first_counter + 1000,
            blkno: tail.undo_tail,
            offset: crate::storage::PAGE_SIZE as u16,
        };
        table
            .vacuum(&mut storage, watermark, CancelToken::new())
            .unwrap();

        assert!(freelist::free_page_count(&storage).unwrap() > 0);
        // The live value is untouched.
        assert_eq!(
            fetch(&storage, &table, 100, tid, 2),
            FetchResult::Value(Some(big_v2))
        );
    }

    #[test]
    fn fetch_below_watermark_serves_current_version() {
        let (mut storage, table) = two_column_table();
        let tid = table.insert_row(&mut storage, 10, &row(1, "old")).unwrap();

        let tail = meta::read_trailer(&storage).unwrap();
        let watermark = UndoRecPtr {
            counter: tail.undo_tail_first_counter + 1000,
            blkno: tail.undo_tail,
            offset: crate::storage::PAGE_SIZE as u16,
        };
        table
            .vacuum(&mut storage, watermark, CancelToken::new())
            .unwrap();

        // Even a snapshot older than the insert sees the row now: its undo
        // record fell below the watermark, making it visible to all.
        assert_eq!(
            fetch(&storage, &table, 1, tid, 2),
            FetchResult::Value(Some(b"old".to_vec()))
        );
    }

    #[test]
    fn oversized_pre_image_redirects_to_toast() {
        // Five wide inline columns: the pre-image of a full row exceeds one
        // undo page, forcing the redirection path.
        let mut storage = MemStorage::new(1);
        let descs: Vec<AttrDesc> = (1..=5).map(AttrDesc::variable).collect();
        let table = Table::create(&mut storage, descs, EngineOptions::default()).unwrap();

        let wide = |seed: u8| {
            // Incompressible-ish payload just under the toast threshold.
            Some(
                (0..2000u32)
                    .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
                    .collect::<Vec<u8>>(),
            )
        };
        let v1: Vec<Option<Vec<u8>>> = (0..5).map(|i| wide(i)).collect();
        let v2: Vec<Option<Vec<u8>>> = (0..5).map(|i| wide(i + 100)).collect();

        let tid = table.insert_row(&mut storage, 10, &v1).unwrap();
        table.update_row(&mut storage, 20, tid, &v2).unwrap();

        // The old snapshot reads every original column back through the
        // redirected pre-image.
        for attno in 1..=5u16 {
            assert_eq!(
                fetch(&storage, &table, 15, tid, attno),
                FetchResult::Value(v1[attno as usize - 1].clone()),
                "attno {}",
                attno
            );
        }
        // The new snapshot sees the replacement values.
        for attno in 1..=5u16 {
            assert_eq!(
                fetch(&storage, &table, 20, tid, attno),
                FetchResult::Value(v2[attno as usize - 1].clone())
            );
        }
    }

    #[test]
    fn open_checks_directory_shape() {
        let (storage, _table) = two_column_table();
        assert!(Table::open(
            &storage,
            vec![AttrDesc::variable(1)],
            EngineOptions::default()
        )
        .is_err());
        assert!(Table::open(
            &storage,
            vec![AttrDesc::fixed(1, 8, true), AttrDesc::variable(2)],
            EngineOptions::default()
        )
        .is_ok());
    }
}
