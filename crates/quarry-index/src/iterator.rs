//! Iteration over the sorted leaf chain.

use crate::page::BTreePage;
use quarry_buffer::{BufferPool, Frame};
use quarry_common::PageId;
use std::sync::Arc;

/// Iterator over a B+ tree's entries in ascending key order.
///
/// The iterator keeps its current leaf pinned but holds no latch between
/// steps; each step re-acquires the leaf's read latch transiently.
/// Concurrent structural changes can therefore move entries relative to
/// the cursor — iteration is intended for read-mostly phases and makes no
/// snapshot guarantee.
pub struct IndexIterator<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    pool: Arc<BufferPool<BTreePage<K, V>>>,
    /// Pinned frame of the current leaf; None once exhausted.
    frame: Option<Arc<Frame<BTreePage<K, V>>>>,
    page_id: PageId,
    index: usize,
}

impl<K, V> IndexIterator<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    /// An iterator positioned at `index` within a pinned leaf.
    pub(crate) fn new(
        pool: Arc<BufferPool<BTreePage<K, V>>>,
        page_id: PageId,
        frame: Arc<Frame<BTreePage<K, V>>>,
        index: usize,
    ) -> Self {
        Self {
            pool,
            frame: Some(frame),
            page_id,
            index,
        }
    }

    /// An already-exhausted iterator (empty tree).
    pub(crate) fn exhausted(pool: Arc<BufferPool<BTreePage<K, V>>>) -> Self {
        Self {
            pool,
            frame: None,
            page_id: PageId::INVALID,
            index: 0,
        }
    }
}

impl<K, V> Iterator for IndexIterator<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            let frame = self.frame.as_ref()?;

            let (item, next_id) = {
                let latch = frame.latch_read();
                let leaf = latch.as_leaf();
                if self.index < leaf.size() {
                    (Some(leaf.entry_at(self.index).clone()), PageId::INVALID)
                } else {
                    (None, leaf.next_id())
                }
            };

            if let Some(item) = item {
                self.index += 1;
                return Some(item);
            }

            // Past the last entry: unpin this leaf and follow the chain.
            self.frame = None;
            self.pool.unpin_page(self.page_id, false);
            if !next_id.is_valid() {
                return None;
            }
            // Fetch failure here means the pool has no evictable frame
            // left, which is fatal by the tree's failure semantics.
            let next_frame = self
                .pool
                .fetch_page(next_id)
                .expect("buffer pool exhausted while advancing leaf chain");
            self.page_id = next_id;
            self.index = 0;
            self.frame = Some(next_frame);
        }
    }
}

impl<K, V> Drop for IndexIterator<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    fn drop(&mut self) {
        if self.frame.take().is_some() {
            self.pool.unpin_page(self.page_id, false);
        }
    }
}
