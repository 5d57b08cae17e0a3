//! Concurrent B+ tree over buffer pool pages.
//!
//! Lookups crab down with read latches, releasing each parent as soon as
//! the child latch is held. Writers take the root-id guard, then descend
//! pessimistically with write latches, releasing every ancestor the moment
//! a child proves safe for the operation. Structural changes (splits,
//! merges, redistribution) therefore only ever touch pages whose write
//! latches the operation already holds, plus transiently latched siblings
//! and reparented children.

use crate::context::OpContext;
use crate::iterator::IndexIterator;
use crate::page::{BTreePage, HeaderPage, InternalPage, LeafPage};
use parking_lot::RwLock;
use quarry_buffer::{BufferPool, Frame};
use quarry_common::{IndexConfig, PageId, QuarryError, Result, HEADER_PAGE_ID};
use std::sync::Arc;

/// Which write operation a descent serves; decides the early-release
/// safety predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOp {
    Insert,
    Remove,
}

/// A concurrent B+ tree index mapping unique keys to values.
pub struct BPlusTree<K, V> {
    name: String,
    pool: Arc<BufferPool<BTreePage<K, V>>>,
    /// Root-id guard: protects `root_page_id` and the act of descending
    /// from the root.
    root: Arc<RwLock<PageId>>,
    leaf_max_size: usize,
    internal_max_size: usize,
}

impl<K, V> BPlusTree<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Creates (or reopens) the index named `name` on the given pool.
    ///
    /// The first index built on a fresh pool allocates the header page;
    /// later ones find their recorded root there.
    pub fn new(
        name: impl Into<String>,
        pool: Arc<BufferPool<BTreePage<K, V>>>,
        config: IndexConfig,
    ) -> Result<Self> {
        config.validate()?;
        let name = name.into();

        let root_page_id = match pool.fetch_page(HEADER_PAGE_ID) {
            Ok(frame) => {
                let recorded = frame.latch_read().as_header().get_record(&name);
                pool.unpin_page(HEADER_PAGE_ID, false);
                recorded.unwrap_or(PageId::INVALID)
            }
            Err(QuarryError::PageNotFound { .. }) => {
                let (page_id, frame) = pool.new_page()?;
                assert_eq!(
                    page_id, HEADER_PAGE_ID,
                    "header page must be the first page allocated on the pool"
                );
                *frame.latch_write() = BTreePage::Header(HeaderPage::default());
                pool.unpin_page(page_id, true);
                PageId::INVALID
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            name,
            pool,
            root: Arc::new(RwLock::new(root_page_id)),
            leaf_max_size: config.leaf_max_size,
            internal_max_size: config.internal_max_size,
        })
    }

    /// Returns the index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current root page id (`INVALID` for an empty tree).
    pub fn root_page_id(&self) -> PageId {
        *self.root.read()
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        !self.root_page_id().is_valid()
    }

    /// Upserts this index's root record on the header page. Callers hold
    /// the root-id guard, so the record can never go backwards.
    fn write_header_record(&self, root_page_id: PageId) -> Result<()> {
        let frame = self.pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut guard = frame.latch_write();
            let header = guard.as_header_mut();
            if !header.update_record(&self.name, root_page_id) {
                header.insert_record(&self.name, root_page_id);
            }
        }
        self.pool.unpin_page(HEADER_PAGE_ID, true);
        Ok(())
    }

    // =========================================================================
    // Point lookup
    // =========================================================================

    /// Looks up the value stored for `key`.
    pub fn get_value(&self, key: &K) -> Result<Option<V>> {
        let root_guard = self.root.read();
        let root_id = *root_guard;
        if !root_id.is_valid() {
            return Ok(None);
        }

        let frame = self.pool.fetch_page(root_id)?;
        let mut current_id = root_id;
        let mut latch = frame.latch_read();
        drop(root_guard);

        loop {
            let child_id = match &*latch {
                BTreePage::Leaf(leaf) => {
                    let value = leaf.lookup(key).cloned();
                    drop(latch);
                    self.pool.unpin_page(current_id, false);
                    return Ok(value);
                }
                BTreePage::Internal(internal) => internal.lookup(key),
                other => unreachable!("descended into {:?} page", other.page_type()),
            };

            let child_frame = match self.pool.fetch_page(child_id) {
                Ok(frame) => frame,
                Err(e) => {
                    drop(latch);
                    self.pool.unpin_page(current_id, false);
                    return Err(e);
                }
            };
            let child_latch = child_frame.latch_read();
            drop(latch);
            self.pool.unpin_page(current_id, false);
            current_id = child_id;
            latch = child_latch;
        }
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Inserts a key/value pair. Keys are unique; inserting an existing
    /// key fails with `DuplicateKey`.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        let mut ctx = OpContext::new(Arc::clone(&self.pool));
        ctx.set_root_guard(RwLock::write_arc(&self.root));

        if !ctx.root_id().is_valid() {
            return self.start_new_tree(&mut ctx, key, value);
        }

        self.descend_write(&mut ctx, &key, WriteOp::Insert)?;

        let leaf_idx = ctx.pages.len() - 1;
        let leaf_page_id = ctx.pages[leaf_idx].page_id;

        if ctx.pages[leaf_idx].guard.as_leaf().lookup(&key).is_some() {
            ctx.release_all();
            return Err(QuarryError::DuplicateKey);
        }

        let fits = {
            let leaf = ctx.pages[leaf_idx].guard.as_leaf_mut();
            leaf.insert(key, value);
            leaf.size() < leaf.max_size()
        };
        if !fits {
            self.split_leaf(&mut ctx, leaf_page_id)?;
        }
        ctx.release_all();
        Ok(())
    }

    /// Builds the first leaf of an empty tree and records it as root.
    fn start_new_tree(&self, ctx: &mut OpContext<K, V>, key: K, value: V) -> Result<()> {
        let (page_id, frame) = self.pool.new_page()?;
        {
            let mut guard = frame.latch_write();
            let mut leaf = LeafPage::new(self.leaf_max_size);
            leaf.insert(key, value);
            *guard = BTreePage::Leaf(leaf);
        }
        self.pool.unpin_page(page_id, true);
        ctx.set_root_id(page_id);
        self.write_header_record(page_id)?;
        ctx.release_all();
        Ok(())
    }

    /// Splits an overflowing leaf and propagates the separator upward.
    fn split_leaf(&self, ctx: &mut OpContext<K, V>, leaf_page_id: PageId) -> Result<()> {
        let (new_page_id, new_frame) = self.pool.new_page()?;
        let separator = {
            let leaf = ctx.page_mut(leaf_page_id).as_leaf_mut();
            let sibling = leaf.split_off_upper();
            leaf.set_next_id(new_page_id);
            let separator = sibling.key_at(0).clone();
            *new_frame.latch_write() = BTreePage::Leaf(sibling);
            separator
        };
        self.insert_into_parent(ctx, leaf_page_id, separator, new_page_id, new_frame)
    }

    /// Installs `(separator, new_id)` into the parent of `old_id`,
    /// splitting ancestors as needed and growing a new root when the split
    /// reaches the top. Takes over the new sibling's pin.
    fn insert_into_parent(
        &self,
        ctx: &mut OpContext<K, V>,
        mut old_id: PageId,
        mut separator: K,
        mut new_id: PageId,
        mut new_frame: Arc<Frame<BTreePage<K, V>>>,
    ) -> Result<()> {
        loop {
            if ctx.root_guard.is_some() && ctx.root_id() == old_id {
                // The split reached the root: grow the tree by one level.
                let (root_id, root_frame) = self.pool.new_page()?;
                *root_frame.latch_write() = BTreePage::Internal(InternalPage::new_root(
                    self.internal_max_size,
                    old_id,
                    separator,
                    new_id,
                ));
                ctx.page_mut(old_id).set_parent_id(root_id);
                new_frame.latch_write().set_parent_id(root_id);
                self.pool.unpin_page(new_id, true);
                self.pool.unpin_page(root_id, true);
                ctx.set_root_id(root_id);
                self.write_header_record(root_id)?;
                return Ok(());
            }

            // The parent's write latch sits just above old's on the path.
            let old_pos = ctx
                .pages
                .iter()
                .position(|held| held.page_id == old_id)
                .expect("split node latch not held");
            assert!(old_pos > 0, "non-root split node has no latched parent");
            let parent_id = ctx.pages[old_pos - 1].page_id;

            let fits = {
                let parent = ctx.pages[old_pos - 1].guard.as_internal_mut();
                parent.insert_after(old_id, separator, new_id);
                parent.size() <= parent.max_size()
            };
            new_frame.latch_write().set_parent_id(parent_id);
            self.pool.unpin_page(new_id, true);
            if fits {
                return Ok(());
            }

            // The parent now holds an oversize image; split it and keep
            // propagating. Children handed to the sibling are reparented
            // (the path node among them through its held latch).
            let (sibling_id, sibling_frame) = self.pool.new_page()?;
            let (promoted, sibling) = ctx.page_mut(parent_id).as_internal_mut().split_off_upper();
            for &child in sibling.children() {
                self.reparent(ctx, child, sibling_id)?;
            }
            *sibling_frame.latch_write() = BTreePage::Internal(sibling);

            old_id = parent_id;
            separator = promoted;
            new_id = sibling_id;
            new_frame = sibling_frame;
        }
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Removes the entry for `key`. Returns false if the key was absent.
    pub fn remove(&self, key: &K) -> Result<bool> {
        let mut ctx = OpContext::new(Arc::clone(&self.pool));
        ctx.set_root_guard(RwLock::write_arc(&self.root));

        if !ctx.root_id().is_valid() {
            ctx.release_all();
            return Ok(false);
        }

        self.descend_write(&mut ctx, key, WriteOp::Remove)?;

        let leaf_idx = ctx.pages.len() - 1;
        let (removed, underfull) = {
            let leaf = ctx.pages[leaf_idx].guard.as_leaf_mut();
            // The root is exempt from the minimum-size bound; it only needs
            // adjustment once it empties out completely.
            let is_root_leaf = !leaf.parent_id().is_valid();
            if !leaf.remove(key) {
                (false, false)
            } else if is_root_leaf {
                (true, leaf.size() == 0)
            } else {
                (true, leaf.size() < leaf.min_size())
            }
        };

        if !removed {
            ctx.release_all();
            return Ok(false);
        }
        if underfull {
            self.coalesce_or_redistribute(&mut ctx, leaf_idx)?;
        }
        ctx.finish();
        Ok(true)
    }

    /// Rebalances the underfull node at stack position `idx`, preferring
    /// redistribution from a sibling and falling back to coalescing. May
    /// recurse up the retained path when a merge empties the parent below
    /// its minimum.
    fn coalesce_or_redistribute(&self, ctx: &mut OpContext<K, V>, idx: usize) -> Result<()> {
        if idx == 0 && ctx.root_guard.is_some() {
            return self.adjust_root(ctx);
        }

        let underfull = match &*ctx.pages[idx].guard {
            BTreePage::Leaf(leaf) => leaf.size() < leaf.min_size(),
            BTreePage::Internal(internal) => internal.size() < internal.min_size(),
            other => unreachable!("rebalancing a {:?} page", other.page_type()),
        };
        if !underfull {
            return Ok(());
        }
        assert!(idx > 0, "underfull node with no latched parent");

        let node_id = ctx.pages[idx].page_id;
        let parent_idx = idx - 1;

        // Locate the node in its parent and pick a sibling, preferring the
        // left one; only the leftmost child falls back to its right sibling.
        let (node_index, sibling_id, use_left) = {
            let parent = ctx.pages[parent_idx].guard.as_internal();
            let node_index = parent
                .value_index(node_id)
                .expect("node missing from its latched parent");
            if node_index > 0 {
                (node_index, parent.child_at(node_index - 1), true)
            } else {
                (node_index, parent.child_at(1), false)
            }
        };

        let sibling_frame = self.pool.fetch_page(sibling_id)?;
        let mut sibling_latch = sibling_frame.latch_write();

        let sibling_has_spare = match &*sibling_latch {
            BTreePage::Leaf(leaf) => leaf.size() > leaf.min_size(),
            BTreePage::Internal(internal) => internal.size() > internal.min_size(),
            other => unreachable!("sibling is a {:?} page", other.page_type()),
        };

        if sibling_has_spare {
            self.redistribute(ctx, idx, &mut sibling_latch, node_index, use_left)?;
            drop(sibling_latch);
            self.pool.unpin_page(sibling_id, true);
            return Ok(());
        }

        // Coalesce into the left page of the pair; the emptied right page
        // is queued for deletion once every latch is released.
        let mut moved_children: Vec<PageId> = Vec::new();
        let (deleted_id, recipient_id) = {
            let (parent_held, node_held) = ctx.two_pages_mut(parent_idx, idx);
            let parent = parent_held.guard.as_internal_mut();
            if use_left {
                match (&mut *sibling_latch, &mut *node_held.guard) {
                    (BTreePage::Leaf(sibling), BTreePage::Leaf(node)) => {
                        node.merge_into(sibling);
                    }
                    (BTreePage::Internal(sibling), BTreePage::Internal(node)) => {
                        moved_children.extend_from_slice(node.children());
                        let separator = parent.key_at(node_index).clone();
                        node.merge_into(sibling, separator);
                    }
                    _ => unreachable!("sibling and node page types diverge"),
                }
                parent.remove_at(node_index);
                (node_id, sibling_id)
            } else {
                // The node has no left sibling: merge the right sibling
                // into it, using the separator at the sibling's index.
                let sibling_index = node_index + 1;
                match (&mut *sibling_latch, &mut *node_held.guard) {
                    (BTreePage::Leaf(sibling), BTreePage::Leaf(node)) => {
                        sibling.merge_into(node);
                    }
                    (BTreePage::Internal(sibling), BTreePage::Internal(node)) => {
                        moved_children.extend_from_slice(sibling.children());
                        let separator = parent.key_at(sibling_index).clone();
                        sibling.merge_into(node, separator);
                    }
                    _ => unreachable!("sibling and node page types diverge"),
                }
                parent.remove_at(sibling_index);
                (sibling_id, node_id)
            }
        };
        for child in moved_children {
            self.reparent(ctx, child, recipient_id)?;
        }
        ctx.mark_deleted(deleted_id);
        drop(sibling_latch);
        self.pool.unpin_page(sibling_id, true);

        self.coalesce_or_redistribute(ctx, parent_idx)
    }

    /// Moves one entry from the chosen sibling into the underfull node and
    /// fixes the separator key in the parent. Never propagates further.
    fn redistribute(
        &self,
        ctx: &mut OpContext<K, V>,
        idx: usize,
        sibling: &mut BTreePage<K, V>,
        node_index: usize,
        use_left: bool,
    ) -> Result<()> {
        let parent_idx = idx - 1;
        let mut reparent_child: Option<(PageId, PageId)> = None;
        {
            let (parent_held, node_held) = ctx.two_pages_mut(parent_idx, idx);
            let parent = parent_held.guard.as_internal_mut();
            match (&mut *sibling, &mut *node_held.guard) {
                (BTreePage::Leaf(sibling), BTreePage::Leaf(node)) => {
                    if use_left {
                        sibling.move_last_to_front_of(node);
                        parent.set_key_at(node_index, node.key_at(0).clone());
                    } else {
                        sibling.move_first_to_end_of(node);
                        parent.set_key_at(node_index + 1, sibling.key_at(0).clone());
                    }
                }
                (BTreePage::Internal(sibling), BTreePage::Internal(node)) => {
                    // The separator rotates down into the recipient and the
                    // sibling's boundary key rotates up to replace it.
                    if use_left {
                        let separator = parent.key_at(node_index).clone();
                        let (moved, new_separator) =
                            sibling.move_last_to_front_of(node, separator);
                        parent.set_key_at(node_index, new_separator);
                        reparent_child = Some((moved, node_held.page_id));
                    } else {
                        let separator = parent.key_at(node_index + 1).clone();
                        let (moved, new_separator) =
                            sibling.move_first_to_end_of(node, separator);
                        parent.set_key_at(node_index + 1, new_separator);
                        reparent_child = Some((moved, node_held.page_id));
                    }
                }
                _ => unreachable!("sibling and node page types diverge"),
            }
        }
        if let Some((child, new_parent)) = reparent_child {
            self.reparent(ctx, child, new_parent)?;
        }
        Ok(())
    }

    /// Handles underflow at the root: an internal root with a single child
    /// hands the tree to that child; an empty leaf root empties the tree.
    fn adjust_root(&self, ctx: &mut OpContext<K, V>) -> Result<()> {
        let root_id = ctx.pages[0].page_id;
        enum RootChange {
            Promote(PageId),
            Clear,
            Keep,
        }
        let change = match &*ctx.pages[0].guard {
            BTreePage::Internal(internal) if internal.size() == 1 => {
                RootChange::Promote(internal.child_at(0))
            }
            BTreePage::Leaf(leaf) if leaf.size() == 0 => RootChange::Clear,
            _ => RootChange::Keep,
        };

        match change {
            RootChange::Promote(child_id) => {
                self.reparent(ctx, child_id, PageId::INVALID)?;
                ctx.set_root_id(child_id);
                self.write_header_record(child_id)?;
                ctx.mark_deleted(root_id);
            }
            RootChange::Clear => {
                ctx.set_root_id(PageId::INVALID);
                self.write_header_record(PageId::INVALID)?;
                ctx.mark_deleted(root_id);
            }
            RootChange::Keep => {}
        }
        Ok(())
    }

    // =========================================================================
    // Shared descent machinery
    // =========================================================================

    /// A page is safe for early release when the operation cannot cause a
    /// structural change above it: an insert must not split it, a removal
    /// must not empty it below its minimum (for the root, below the point
    /// where `adjust_root` fires).
    fn is_write_safe(&self, page: &BTreePage<K, V>, op: WriteOp, is_root: bool) -> bool {
        match (op, page) {
            (WriteOp::Insert, BTreePage::Leaf(leaf)) => leaf.size() < leaf.max_size() - 1,
            (WriteOp::Insert, BTreePage::Internal(internal)) => {
                internal.size() < internal.max_size()
            }
            (WriteOp::Remove, BTreePage::Leaf(leaf)) => {
                if is_root {
                    leaf.size() > 1
                } else {
                    leaf.size() > leaf.min_size()
                }
            }
            (WriteOp::Remove, BTreePage::Internal(internal)) => {
                if is_root {
                    internal.size() > 2
                } else {
                    internal.size() > internal.min_size()
                }
            }
            (_, other) => unreachable!("descended into {:?} page", other.page_type()),
        }
    }

    /// Pessimistic latch-crabbing descent to the target leaf. On return
    /// the context holds write latches on the leaf and every ancestor that
    /// might take part in a structural change.
    fn descend_write(&self, ctx: &mut OpContext<K, V>, key: &K, op: WriteOp) -> Result<()> {
        let root_id = ctx.root_id();
        let frame = self.pool.fetch_page(root_id)?;
        let latch = frame.latch_write();
        ctx.push_page(root_id, latch);
        if self.is_write_safe(&ctx.pages[0].guard, op, true) {
            ctx.release_ancestors();
        }

        loop {
            let child_id = {
                let held = ctx.pages.last().expect("descent stack is empty");
                match &*held.guard {
                    BTreePage::Leaf(_) => return Ok(()),
                    BTreePage::Internal(internal) => internal.lookup(key),
                    other => unreachable!("descended into {:?} page", other.page_type()),
                }
            };
            let child_frame = self.pool.fetch_page(child_id)?;
            let child_latch = child_frame.latch_write();
            ctx.push_page(child_id, child_latch);
            let child_safe = {
                let held = ctx.pages.last().expect("descent stack is empty");
                self.is_write_safe(&held.guard, op, false)
            };
            if child_safe {
                ctx.release_ancestors();
            }
        }
    }

    /// Points `child_id`'s parent link at `parent_id`, going through the
    /// held latch when the child sits on the descent path and a transient
    /// latch otherwise.
    fn reparent(&self, ctx: &mut OpContext<K, V>, child_id: PageId, parent_id: PageId) -> Result<()> {
        if ctx.holds(child_id) {
            ctx.page_mut(child_id).set_parent_id(parent_id);
            return Ok(());
        }
        let frame = self.pool.fetch_page(child_id)?;
        frame.latch_write().set_parent_id(parent_id);
        self.pool.unpin_page(child_id, true);
        Ok(())
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Iterates the whole tree in ascending key order.
    pub fn iter(&self) -> Result<IndexIterator<K, V>> {
        self.make_iterator(None)
    }

    /// Iterates in ascending key order starting at the first entry whose
    /// key is `>= key`.
    pub fn iter_from(&self, key: &K) -> Result<IndexIterator<K, V>> {
        self.make_iterator(Some(key))
    }

    fn make_iterator(&self, key: Option<&K>) -> Result<IndexIterator<K, V>> {
        let root_guard = self.root.read();
        let root_id = *root_guard;
        if !root_id.is_valid() {
            return Ok(IndexIterator::exhausted(Arc::clone(&self.pool)));
        }

        let frame = self.pool.fetch_page(root_id)?;
        let mut current_id = root_id;
        let mut current_frame = frame;
        let mut latch = current_frame.latch_read();
        drop(root_guard);

        loop {
            let child_id = match &*latch {
                BTreePage::Leaf(leaf) => {
                    let index = key.map_or(0, |k| leaf.key_index(k));
                    drop(latch);
                    // The pin travels into the iterator; no latch is held
                    // between steps.
                    return Ok(IndexIterator::new(
                        Arc::clone(&self.pool),
                        current_id,
                        current_frame,
                        index,
                    ));
                }
                BTreePage::Internal(internal) => match key {
                    Some(k) => internal.lookup(k),
                    None => internal.child_at(0),
                },
                other => unreachable!("descended into {:?} page", other.page_type()),
            };

            let child_frame = match self.pool.fetch_page(child_id) {
                Ok(frame) => frame,
                Err(e) => {
                    drop(latch);
                    self.pool.unpin_page(current_id, false);
                    return Err(e);
                }
            };
            let child_latch = child_frame.latch_read();
            drop(latch);
            self.pool.unpin_page(current_id, false);
            current_id = child_id;
            current_frame = child_frame;
            latch = child_latch;
        }
    }
}
