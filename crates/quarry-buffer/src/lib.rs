//! Buffer management for QuarryDB.
//!
//! This crate provides:
//! - LRU-K replacement policy for victim frame selection
//! - Extendible hash table used as the pool's page table
//! - Buffer frames with page latches and pin accounting
//! - Buffer pool manager over typed page payloads

pub mod frame;
pub mod page_table;
pub mod pool;
pub mod replacer;

pub use frame::Frame;
pub use page_table::ExtendibleHashTable;
pub use pool::{BufferPool, BufferPoolStats};
pub use replacer::{LruKReplacer, Replacer};
