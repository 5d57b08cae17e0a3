//! Concurrent B+ tree index for QuarryDB.
//!
//! This crate provides:
//! - Typed B+ tree pages (header, internal, leaf) stored in buffer pool frames
//! - A concurrent B+ tree with latch-crabbing descent for lookups, inserts,
//!   and removals, including splits, merges, and redistribution
//! - An iterator over the sorted leaf chain

mod context;
mod iterator;
mod page;
mod tree;

pub use iterator::IndexIterator;
pub use page::{BTreePage, HeaderPage, InternalPage, LeafPage};
pub use tree::BPlusTree;
