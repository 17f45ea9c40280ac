//! Core identifier and descriptor types shared across the engine.
//!
//! A `RowId` is a logical, monotonically assigned 64-bit row identifier. It is
//! stable across physical reorganization: splitting a leaf or compacting a
//! stream never changes the ids of the rows it carries. Id 0 is reserved as
//! the invalid sentinel; the first row of a table gets id 1.
//!
//! An `AttrDesc` describes how one column's values are packed inside an
//! attribute stream: fixed-width values are stored raw (`fixed_len` bytes per
//! element), variable-length values carry a varint length prefix. `byval` is
//! only meaningful for fixed-width attributes small enough to pass in a
//! register; the codec treats by-value and by-reference fixed-width columns
//! identically on disk and the flag exists so callers can round-trip it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};

/// Logical row identifier. 0 is invalid; ids start at 1.
pub type RowId = u64;

/// Attribute (column) number. Attribute 0 is the meta tree, which stores
/// row-existence entries instead of column values.
pub type AttrNo = u16;

/// 0-based page number within the block store. Page 0 is the metapage.
pub type PageNo = u32;

/// Transaction identifier, assigned by the host's transaction manager.
pub type TxnId = u64;

pub const INVALID_ROW_ID: RowId = 0;
pub const FIRST_ROW_ID: RowId = 1;
pub const MAX_ROW_ID: RowId = u64::MAX;

pub const INVALID_PAGE_NO: PageNo = 0;

/// The shared row-existence tree, not a real column.
pub const META_ATTNO: AttrNo = 0;

/// Describes the physical shape of one attribute's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrDesc {
    /// Attribute number this descriptor belongs to.
    pub attno: AttrNo,
    /// Fixed width in bytes, or `None` for variable-length values.
    pub fixed_len: Option<u16>,
    /// Whether the host passes this type by value (fixed-width only).
    pub byval: bool,
}

impl AttrDesc {
    pub fn fixed(attno: AttrNo, len: u16, byval: bool) -> Self {
        Self {
            attno,
            fixed_len: Some(len),
            byval,
        }
    }

    pub fn variable(attno: AttrNo) -> Self {
        Self {
            attno,
            fixed_len: None,
            byval: false,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.fixed_len.is_none()
    }

    /// Validates that a non-null value matches the descriptor.
    pub fn check_value(&self, value: &[u8]) -> Result<()> {
        if let Some(len) = self.fixed_len {
            ensure!(
                value.len() == len as usize,
                "attribute {} expects {} bytes, got {}",
                self.attno,
                len,
                value.len()
            );
        }
        Ok(())
    }
}

/// One decoded stream element: a row id and its value, or null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamItem {
    pub tid: RowId,
    pub value: Option<Vec<u8>>,
}

impl StreamItem {
    pub fn new(tid: RowId, value: Option<Vec<u8>>) -> Self {
        Self { tid, value }
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }
}

/// Cooperative cancellation flag polled by long scans between pages.
///
/// Cloning shares the flag. Scans call `check()` at page boundaries and
/// unwind with an error when the flag is set; held page locks are released
/// by guard drop on the way out.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<()> {
        ensure!(!self.is_cancelled(), "operation cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_desc_fixed_checks_length() {
        let desc = AttrDesc::fixed(1, 8, true);
        assert!(desc.check_value(&[0u8; 8]).is_ok());
        assert!(desc.check_value(&[0u8; 7]).is_err());
    }

    #[test]
    fn attr_desc_variable_accepts_any_length() {
        let desc = AttrDesc::variable(2);
        assert!(desc.is_variable());
        assert!(desc.check_value(b"").is_ok());
        assert!(desc.check_value(&[0u8; 5000]).is_ok());
    }

    #[test]
    fn cancel_token_trips_check() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());

        let shared = token.clone();
        shared.cancel();

        assert!(token.is_cancelled());
        assert!(token.check().is_err());
    }
}
