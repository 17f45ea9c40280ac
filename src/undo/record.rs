//! Undo record codec.
//!
//! Records are variable-size: a 50-byte fixed header followed by the payload
//! (the pre-image row for updates and deletes, empty for inserts). Each
//! record carries its own pointer so forward page scans are self-describing
//! and a reader can verify that a record really is the one its pointer
//! claims.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ---------------------------------
//! 0       2     size (header + payload)
//! 2       1     op (1 = insert, 2 = update, 3 = delete)
//! 3       1     reserved
//! 4       14    self pointer (counter, blkno, offset)
//! 18      8     txn id
//! 26      8     row id
//! 34      14    previous-version pointer
//! 48      2     payload length
//! 50      ...   payload
//! ```

use eyre::{bail, ensure, Result};

use super::{UndoRecPtr, UNDO_PTR_SIZE};
use crate::storage::page::{read_u16, read_u64};
use crate::types::{RowId, TxnId};

pub const UNDO_RECORD_HEADER_SIZE: usize = 2 + 1 + 1 + UNDO_PTR_SIZE + 8 + 8 + UNDO_PTR_SIZE + 2;

/// What the logged operation did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOp {
    /// Row creation; there is no prior version.
    Insert = 1,
    /// Overwrite; payload is the replaced row image.
    Update = 2,
    /// Deletion; payload is the deleted row image.
    Delete = 3,
}

impl UndoOp {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(UndoOp::Insert),
            2 => Ok(UndoOp::Update),
            3 => Ok(UndoOp::Delete),
            other => bail!("corrupt undo record: unknown op {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    /// This record's own location; written at append time.
    pub ptr: UndoRecPtr,
    pub op: UndoOp,
    pub txn_id: TxnId,
    pub tid: RowId,
    /// Prior version of the same row, or invalid for the first version.
    pub prev: UndoRecPtr,
    pub payload: Vec<u8>,
}

impl UndoRecord {
    pub fn serialized_size(&self) -> usize {
        UNDO_RECORD_HEADER_SIZE + self.payload.len()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() >= UNDO_RECORD_HEADER_SIZE,
            "undo record truncated: {} < {}",
            data.len(),
            UNDO_RECORD_HEADER_SIZE
        );

        let size = read_u16(data, 0) as usize;
        ensure!(
            size >= UNDO_RECORD_HEADER_SIZE && size <= data.len(),
            "corrupt undo record: size {} outside [{}, {}]",
            size,
            UNDO_RECORD_HEADER_SIZE,
            data.len()
        );

        let op = UndoOp::from_u8(data[2])?;
        let ptr = UndoRecPtr::read_from(data, 4);
        let txn_id = read_u64(data, 18);
        let tid = read_u64(data, 26);
        let prev = UndoRecPtr::read_from(data, 34);
        let payload_len = read_u16(data, 48) as usize;
        ensure!(
            UNDO_RECORD_HEADER_SIZE + payload_len == size,
            "corrupt undo record: payload length {} disagrees with size {}",
            payload_len,
            size
        );

        Ok(Self {
            ptr,
            op,
            txn_id,
            tid,
            prev,
            payload: data[UNDO_RECORD_HEADER_SIZE..size].to_vec(),
        })
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        let size = self.serialized_size();
        ensure!(
            data.len() >= size,
            "buffer too small for undo record: {} < {}",
            data.len(),
            size
        );
        ensure!(size <= u16::MAX as usize, "undo record of {} bytes", size);

        data[0..2].copy_from_slice(&(size as u16).to_le_bytes());
        data[2] = self.op as u8;
        data[3] = 0;
        self.ptr.write_to(data, 4);
        data[18..26].copy_from_slice(&self.txn_id.to_le_bytes());
        data[26..34].copy_from_slice(&self.tid.to_le_bytes());
        self.prev.write_to(data, 34);
        data[48..50].copy_from_slice(&(self.payload.len() as u16).to_le_bytes());
        data[UNDO_RECORD_HEADER_SIZE..size].copy_from_slice(&self.payload);
        Ok(())
    }
}
