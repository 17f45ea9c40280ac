//! # Per-Attribute B-trees
//!
//! Each column gets its own B-tree, keyed by row id; the shared meta tree
//! (attribute 0) stores row-existence entries in the same structure. The
//! three submodules mirror the page roles:
//!
//! - `interior`: internal pages with packed (separator, child) entries
//! - `leaf`: two-stream leaves and the write-absorption policy
//! - `tree`: descent, lookups, scans, inserts, and split propagation
//!
//! Key ranges are low-inclusive / high-exclusive and leaves carry successor
//! pointers, so concurrent readers keep exactly-once coverage across splits
//! by following right-links.

pub mod interior;
pub mod leaf;
pub mod tree;

pub use interior::{Downlink, InteriorNode, INTERNAL_CAPACITY, INTERNAL_ENTRY_SIZE};
pub use leaf::{LeafNode, LEAF_CAPACITY};
pub use tree::{AttributeTree, TreeScan};
