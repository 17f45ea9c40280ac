//! # Snapshots, Visibility, and Version Metadata
//!
//! The engine does not manage transactions. It consumes a narrow seam: an
//! opaque `Snapshot` token from the host's transaction manager and a
//! `Visibility` oracle answering "is a version created by this transaction
//! visible to this snapshot?". Everything MVCC-shaped in the engine (the
//! meta-tree entries, the undo chain walk in `table`) is expressed against
//! that seam.
//!
//! `ReadTsVisibility` is the bundled oracle: a snapshot is a read timestamp
//! and a version is visible when its transaction id is at or below it. It is
//! enough for embedders with monotonic commit timestamps and for the crate's
//! own tests; hosts with real commit-state tracking implement `Visibility`
//! themselves.
//!
//! ## Version metadata entries
//!
//! The meta tree (attribute 0) stores one fixed-width 24-byte entry per row,
//! parsed with `VersionMeta`:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ----------------------
//! 0       1     flags (bit 0: deleted)
//! 1       1     reserved
//! 2       2     undo pointer offset
//! 4       4     undo pointer blkno
//! 8       8     txn id
//! 16      8     undo pointer counter
//! ```
//!
//! The undo pointer names the record logged by the operation that produced
//! the row's current version; walking `prev` pointers from there reaches
//! every retained older version.

use eyre::{ensure, Result};

use crate::storage::page::{read_u16, read_u32, read_u64};
use crate::types::TxnId;
use crate::undo::UndoRecPtr;

/// Opaque snapshot token. Its interpretation belongs to the `Visibility`
/// implementation; `ReadTsVisibility` reads it as a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot(pub u64);

impl Snapshot {
    pub fn with_read_ts(read_ts: TxnId) -> Self {
        Snapshot(read_ts)
    }
}

/// Source of snapshot tokens; implemented by the host's transaction layer.
pub trait SnapshotSource {
    fn current_snapshot(&self) -> Snapshot;
}

/// Visibility oracle: decides whether a version created by `txn_id` is
/// visible to `snapshot`.
pub trait Visibility {
    fn is_visible(&self, snapshot: Snapshot, txn_id: TxnId) -> bool;
}

/// Read-timestamp visibility: visible iff `txn_id <= snapshot`. Transaction
/// id 0 marks bootstrapped data that every snapshot sees.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadTsVisibility;

impl Visibility for ReadTsVisibility {
    fn is_visible(&self, snapshot: Snapshot, txn_id: TxnId) -> bool {
        txn_id <= snapshot.0
    }
}

pub const VERSION_META_LEN: u16 = 24;

pub mod version_flags {
    pub const DELETED: u8 = 0x01;
}

/// Decoded meta-tree entry: the row's current version identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionMeta {
    pub flags: u8,
    pub txn_id: TxnId,
    pub undo: UndoRecPtr,
}

impl VersionMeta {
    pub fn new(txn_id: TxnId, undo: UndoRecPtr) -> Self {
        Self {
            flags: 0,
            txn_id,
            undo,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & version_flags::DELETED != 0
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        if deleted {
            self.flags |= version_flags::DELETED;
        } else {
            self.flags &= !version_flags::DELETED;
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() == VERSION_META_LEN as usize,
            "version metadata must be {} bytes, got {}",
            VERSION_META_LEN,
            data.len()
        );
        Ok(Self {
            flags: data[0],
            undo: UndoRecPtr {
                offset: read_u16(data, 2),
                blkno: read_u32(data, 4),
                counter: read_u64(data, 16),
            },
            txn_id: read_u64(data, 8),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; VERSION_META_LEN as usize];
        buf[0] = self.flags;
        buf[2..4].copy_from_slice(&self.undo.offset.to_le_bytes());
        buf[4..8].copy_from_slice(&self.undo.blkno.to_le_bytes());
        buf[8..16].copy_from_slice(&self.txn_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.undo.counter.to_le_bytes());
        buf
    }
}
