//! # StripeDB - Columnar MVCC Table Storage
//!
//! StripeDB is a column-oriented table-storage engine: each column lives in
//! its own B-tree keyed by a logical row id, leaf pages carry compact encoded
//! value streams, old row versions thread through an append-only undo log,
//! and oversized values spill into linked overflow chains.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Row-Level Table API (table)          │
//! ├──────────────┬───────────────┬──────────────┤
//! │ Per-Attribute│  Undo/Version │   Overflow   │
//! │ B-trees      │  Log (undo)   │ Chains (toast)│
//! │ (btree)      │               │              │
//! ├──────────────┴───────┬───────┴──────────────┤
//! │ Attribute Stream Codec (stream)             │
//! ├──────────────────────┴──────────────────────┤
//! │ Pages, Metapage, Free List, Locks (storage) │
//! ├─────────────────────────────────────────────┤
//! │ Block Store: mmap file or in-memory         │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Page kinds
//!
//! Every 8KB page ends in a trailer whose last two bytes tag its kind:
//!
//! - **META** (page 0): undo log anchors, oldest-retained pointer, free-page
//!   list head, attribute-root directory
//! - **BTREE**: internal routing pages and two-stream leaf pages
//! - **UNDO**: append-only version log pages
//! - **TOAST**: slices of oversized values
//! - **FREE**: reclaimed pages awaiting reuse
//!
//! ## What the engine does not do
//!
//! Transactions, snapshots, and commit state belong to the host: the engine
//! consumes a `Snapshot` token and a `Visibility` oracle (`snapshot`), and
//! ships a read-timestamp implementation for simple embedders. There is no
//! WAL, no page cache, and no SQL surface; the `Storage` trait is the seam
//! to the host's buffer and durability management.
//!
//! ## Quick start
//!
//! ```ignore
//! use stripedb::{AttrDesc, EngineOptions, MemStorage, ReadTsVisibility, Snapshot, Table};
//!
//! let mut storage = MemStorage::new(1);
//! let table = Table::create(
//!     &mut storage,
//!     vec![AttrDesc::fixed(1, 8, true), AttrDesc::variable(2)],
//!     EngineOptions::default(),
//! )?;
//!
//! let tid = table.insert_row(&mut storage, txn_id, &row_values)?;
//! let value = table.fetch(&storage, &ReadTsVisibility, Snapshot::with_read_ts(ts), tid, 2)?;
//! ```
//!
//! ## Module overview
//!
//! - [`storage`]: block-store trait and backends, page layout, metapage,
//!   free-page list, page lock manager
//! - [`stream`]: the attribute-stream codec (chunks, varints, compression)
//! - [`btree`]: per-attribute B-trees over stream leaves
//! - [`undo`]: the undo/version log
//! - [`toast`]: overflow chains for oversized values
//! - [`table`]: row-level MVCC operations
//! - [`snapshot`]: visibility seam and version metadata
//! - [`inspect`]: read-only page statistics and stream dumping

pub mod btree;
pub mod compress;
pub mod config;
pub mod inspect;
pub mod snapshot;
pub mod storage;
pub mod stream;
pub mod table;
pub mod toast;
pub mod types;
pub mod undo;

pub use compress::{Compression, Lz4Compression, NoCompression};
pub use config::EngineOptions;
pub use snapshot::{ReadTsVisibility, Snapshot, SnapshotSource, Visibility};
pub use storage::{MemStorage, MmapStorage, PageKind, PageLockManager, Storage};
pub use table::{FetchResult, Table};
pub use types::{AttrDesc, CancelToken, PageNo, RowId, StreamItem, TxnId};
pub use undo::UndoRecPtr;
