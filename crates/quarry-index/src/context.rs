//! Per-operation latch tracking for tree writes.
//!
//! A write descent holds the root-id guard plus a FIFO of write-latched
//! pages. The guard acts as an escape sentinel at the front of the queue:
//! draining releases the guard first, then unlatches and unpins every page
//! in acquisition order. Keeping the release ordering explicit here avoids
//! deep recursion in the tree code.

use crate::page::BTreePage;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::RawRwLock;
use quarry_buffer::BufferPool;
use quarry_common::PageId;
use std::sync::Arc;

/// Owned write guard over the tree's root page id.
pub(crate) type RootGuard = ArcRwLockWriteGuard<RawRwLock, PageId>;

/// Owned write latch over a page payload.
pub(crate) type PageLatch<K, V> = ArcRwLockWriteGuard<RawRwLock, BTreePage<K, V>>;

/// A write-latched page on the descent path.
pub(crate) struct HeldPage<K, V> {
    pub page_id: PageId,
    pub guard: PageLatch<K, V>,
}

/// Scratch state for one insert or remove operation.
pub(crate) struct OpContext<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    pool: Arc<BufferPool<BTreePage<K, V>>>,
    /// The root-id guard, present until the first early release.
    pub root_guard: Option<RootGuard>,
    /// Write-latched pages, in acquisition (root-to-leaf) order.
    pub pages: Vec<HeldPage<K, V>>,
    /// Page ids to delete once every latch is released.
    pending_delete: Vec<PageId>,
}

impl<K, V> OpContext<K, V>
where
    K: Clone + Ord + Send + Sync,
    V: Send + Sync,
{
    pub fn new(pool: Arc<BufferPool<BTreePage<K, V>>>) -> Self {
        Self {
            pool,
            root_guard: None,
            pages: Vec::new(),
            pending_delete: Vec::new(),
        }
    }

    /// Records the root-id guard as the first held latch.
    pub fn set_root_guard(&mut self, guard: RootGuard) {
        debug_assert!(self.root_guard.is_none() && self.pages.is_empty());
        self.root_guard = Some(guard);
    }

    /// Pushes a freshly latched page onto the descent path.
    pub fn push_page(&mut self, page_id: PageId, guard: PageLatch<K, V>) {
        self.pages.push(HeldPage { page_id, guard });
    }

    /// Current root page id; only valid while the root guard is held.
    pub fn root_id(&self) -> PageId {
        **self
            .root_guard
            .as_ref()
            .expect("root id read without holding the root guard")
    }

    /// Rewrites the root page id; only valid while the root guard is held.
    pub fn set_root_id(&mut self, page_id: PageId) {
        **self
            .root_guard
            .as_mut()
            .expect("root id written without holding the root guard") = page_id;
    }

    /// True if `page_id`'s write latch is held on the path.
    pub fn holds(&self, page_id: PageId) -> bool {
        self.pages.iter().any(|held| held.page_id == page_id)
    }

    /// Mutable access to a held page's payload.
    pub fn page_mut(&mut self, page_id: PageId) -> &mut BTreePage<K, V> {
        self.pages
            .iter_mut()
            .find(|held| held.page_id == page_id)
            .map(|held| &mut *held.guard)
            .expect("page latch not held")
    }

    /// Mutable access to two held pages at distinct stack positions.
    pub fn two_pages_mut(
        &mut self,
        upper: usize,
        lower: usize,
    ) -> (&mut HeldPage<K, V>, &mut HeldPage<K, V>) {
        assert!(upper < lower && lower < self.pages.len());
        let (head, tail) = self.pages.split_at_mut(lower);
        (&mut head[upper], &mut tail[0])
    }

    /// Queues a page for deletion after the operation drains.
    pub fn mark_deleted(&mut self, page_id: PageId) {
        self.pending_delete.push(page_id);
    }

    /// Releases every held latch except the most recently acquired page.
    /// Called when the newly latched child is safe for the operation.
    pub fn release_ancestors(&mut self) {
        self.root_guard = None;
        if self.pages.len() > 1 {
            let keep = self.pages.pop().expect("page stack cannot be empty");
            for held in self.pages.drain(..) {
                let HeldPage { page_id, guard } = held;
                drop(guard);
                self.pool.unpin_page(page_id, true);
            }
            self.pages.push(keep);
        }
    }

    /// Releases everything in acquisition order.
    pub fn release_all(&mut self) {
        self.root_guard = None;
        for held in self.pages.drain(..) {
            let HeldPage { page_id, guard } = held;
            drop(guard);
            self.pool.unpin_page(page_id, true);
        }
    }

    /// Releases all latches, then deletes every page queued for deletion.
    pub fn finish(&mut self) {
        self.release_all();
        for page_id in std::mem::take(&mut self.pending_delete) {
            self.pool.delete_page(page_id);
        }
    }
}

impl<K, V> Drop for OpContext<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    fn drop(&mut self) {
        // Normal paths drain explicitly; this backstop keeps latches and
        // pins from leaking when an operation errors out mid-descent.
        self.root_guard = None;
        for held in self.pages.drain(..) {
            let HeldPage { page_id, guard } = held;
            drop(guard);
            self.pool.unpin_page(page_id, true);
        }
    }
}
