//! Buffer pool manager.

use crate::frame::Frame;
use crate::page_table::ExtendibleHashTable;
use crate::replacer::{LruKReplacer, Replacer};
use parking_lot::Mutex;
use quarry_common::{BufferConfig, FrameId, PageId, QuarryError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Bucket capacity for the page table's extendible hash directory.
const PAGE_TABLE_BUCKET_CAPACITY: usize = 16;

/// State behind the pool mutex: the free list and the parking area for
/// evicted page payloads (standing in for disk storage).
struct PoolState<P> {
    free_list: Vec<FrameId>,
    parked: HashMap<PageId, P>,
}

/// Buffer pool manager over typed page payloads.
///
/// Manages a fixed set of frames with:
/// - Page ID to frame ID mapping through an extendible hash table
/// - Free frame list for new pages
/// - LRU-K replacement for eviction
/// - Pin counting for concurrent access
///
/// All pin-state transitions (fetch/new/unpin/delete) are serialized by a
/// single pool mutex. Page latches are never acquired while the pool mutex
/// is held.
pub struct BufferPool<P> {
    /// Array of buffer frames, indexed by frame id.
    frames: Vec<Arc<Frame<P>>>,
    /// Page ID to frame ID mapping.
    page_table: ExtendibleHashTable<PageId, FrameId>,
    /// Page replacement policy.
    replacer: LruKReplacer,
    /// Free list and parked payloads.
    state: Mutex<PoolState<P>>,
    /// Monotonic page id allocator. Ids are never reused.
    next_page_id: AtomicU32,
}

impl<P: Default + Send + Sync> BufferPool<P> {
    /// Creates a new buffer pool.
    pub fn new(config: BufferConfig) -> Result<Self> {
        config.validate()?;
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| Arc::new(Frame::new(FrameId(i as u32))))
            .collect();

        // All frames start in the free list; pop() hands out low ids first.
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        Ok(Self {
            frames,
            page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_CAPACITY),
            replacer: LruKReplacer::new(num_frames, config.lru_k),
            state: Mutex::new(PoolState {
                free_list,
                parked: HashMap::new(),
            }),
            next_page_id: AtomicU32::new(0),
        })
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Checks if a page is resident in a frame.
    pub fn is_resident(&self, page_id: PageId) -> bool {
        self.page_table.find(&page_id).is_some()
    }

    /// Claims a frame: free list first, then eviction. The victim's payload
    /// is parked so a later fetch can bring it back; with no disk below the
    /// pool, this happens whether or not the page was marked dirty.
    fn allocate_frame(&self, state: &mut PoolState<P>) -> Result<Arc<Frame<P>>> {
        if let Some(frame_id) = state.free_list.pop() {
            return Ok(Arc::clone(&self.frames[frame_id.0 as usize]));
        }

        let victim_id = self.replacer.evict().ok_or(QuarryError::BufferPoolFull)?;
        let frame = &self.frames[victim_id.0 as usize];
        let old_page_id = frame.page_id();
        let payload = frame.reset();
        if let Some(page_id) = old_page_id {
            self.page_table.remove(&page_id);
            state.parked.insert(page_id, payload);
        }
        Ok(Arc::clone(frame))
    }

    /// Installs a payload into a claimed frame and registers the mapping.
    fn install(&self, frame: &Arc<Frame<P>>, page_id: PageId, payload: Option<P>) {
        if let Some(payload) = payload {
            frame.replace(payload);
        }
        frame.set_page_id(Some(page_id));
        frame.pin();
        self.replacer.access_and_pin(frame.frame_id());
        self.page_table.insert(page_id, frame.frame_id());
    }

    /// Allocates a fresh page with a newly minted id.
    ///
    /// The returned frame is pinned; the caller must `unpin_page` exactly
    /// once when done. Errors with `BufferPoolFull` when every frame is
    /// pinned.
    pub fn new_page(&self) -> Result<(PageId, Arc<Frame<P>>)> {
        let mut state = self.state.lock();
        let frame = self.allocate_frame(&mut state)?;
        let page_id = PageId(self.next_page_id.fetch_add(1, Ordering::AcqRel));
        self.install(&frame, page_id, None);
        Ok((page_id, frame))
    }

    /// Fetches a page, pinning its frame.
    ///
    /// A resident page is pinned in place; a parked page is loaded into a
    /// claimed frame. Unknown ids yield `PageNotFound`.
    pub fn fetch_page(&self, page_id: PageId) -> Result<Arc<Frame<P>>> {
        let mut state = self.state.lock();

        if let Some(frame_id) = self.page_table.find(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.access_and_pin(frame_id);
            return Ok(Arc::clone(frame));
        }

        let Some(payload) = state.parked.remove(&page_id) else {
            return Err(QuarryError::PageNotFound { page_id });
        };
        match self.allocate_frame(&mut state) {
            Ok(frame) => {
                self.install(&frame, page_id, Some(payload));
                Ok(frame)
            }
            Err(e) => {
                // Put the payload back so the page is not lost.
                state.parked.insert(page_id, payload);
                Err(e)
            }
        }
    }

    /// Unpins a page, recording dirtiness.
    ///
    /// When the pin count reaches zero the frame becomes evictable.
    /// Returns false if the page is not resident.
    pub fn unpin_page(&self, page_id: PageId, dirty: bool) -> bool {
        // Serialized with fetch/new/delete: otherwise a fetch that re-pins
        // this frame could interleave and leave a pinned frame evictable.
        let _state = self.state.lock();
        let Some(frame_id) = self.page_table.find(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.0 as usize];
        if dirty {
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Deletes a page from the pool.
    ///
    /// Returns false if the page is pinned. Parked (non-resident) pages are
    /// deleted directly. Unknown ids return true, matching the idempotent
    /// delete contract.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut state = self.state.lock();

        if let Some(frame_id) = self.page_table.find(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                return false;
            }
            self.page_table.remove(&page_id);
            self.replacer.remove(frame_id);
            frame.reset();
            state.free_list.push(frame_id);
            return true;
        }

        state.parked.remove(&page_id);
        true
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let state = self.state.lock();
        let pinned_frames = self.frames.iter().filter(|f| f.is_pinned()).count();
        BufferPoolStats {
            total_frames: self.frames.len(),
            free_frames: state.free_list.len(),
            resident_pages: self.page_table.len(),
            parked_pages: state.parked.len(),
            pinned_frames,
            evictable_frames: self.replacer.size(),
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of pages resident in frames.
    pub resident_pages: usize,
    /// Number of evicted payloads parked outside the frame array.
    pub parked_pages: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of evictable frames.
    pub evictable_frames: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_pool(num_frames: usize) -> BufferPool<Vec<u8>> {
        BufferPool::new(BufferConfig {
            num_frames,
            lru_k: 2,
        })
        .unwrap()
    }

    #[test]
    fn test_pool_new() {
        let pool = create_test_pool(10);

        assert_eq!(pool.num_frames(), 10);
        let stats = pool.stats();
        assert_eq!(stats.free_frames, 10);
        assert_eq!(stats.resident_pages, 0);
    }

    #[test]
    fn test_pool_new_page() {
        let pool = create_test_pool(10);

        let (page_id, frame) = pool.new_page().unwrap();

        assert_eq!(frame.page_id(), Some(page_id));
        assert!(frame.is_pinned());
        assert!(pool.is_resident(page_id));

        let stats = pool.stats();
        assert_eq!(stats.free_frames, 9);
        assert_eq!(stats.resident_pages, 1);
        assert_eq!(stats.pinned_frames, 1);
    }

    #[test]
    fn test_pool_page_ids_monotonic() {
        let pool = create_test_pool(10);
        let (a, _) = pool.new_page().unwrap();
        let (b, _) = pool.new_page().unwrap();
        let (c, _) = pool.new_page().unwrap();
        assert!(a < b && b < c);
        assert_eq!(a, PageId(0));
    }

    #[test]
    fn test_pool_fetch_resident() {
        let pool = create_test_pool(10);
        let (page_id, _) = pool.new_page().unwrap();
        pool.unpin_page(page_id, false);

        let frame = pool.fetch_page(page_id).unwrap();
        assert_eq!(frame.page_id(), Some(page_id));
        assert!(frame.is_pinned());
    }

    #[test]
    fn test_pool_fetch_unknown() {
        let pool = create_test_pool(10);
        assert!(matches!(
            pool.fetch_page(PageId(99)),
            Err(QuarryError::PageNotFound { .. })
        ));
    }

    #[test]
    fn test_pool_unpin() {
        let pool = create_test_pool(10);
        let (page_id, frame) = pool.new_page().unwrap();
        assert!(frame.is_pinned());

        assert!(pool.unpin_page(page_id, false));
        assert!(!frame.is_pinned());
        assert!(!pool.unpin_page(PageId(99), false));
    }

    #[test]
    fn test_pool_eviction_round_trip() {
        let pool = create_test_pool(2);

        // Fill both frames, writing a recognizable payload.
        let mut ids = Vec::new();
        for byte in [1u8, 2] {
            let (page_id, frame) = pool.new_page().unwrap();
            frame.latch_write().push(byte);
            pool.unpin_page(page_id, true);
            ids.push(page_id);
        }

        // A third page forces an eviction.
        let (third, _) = pool.new_page().unwrap();
        pool.unpin_page(third, false);

        let stats = pool.stats();
        assert_eq!(stats.parked_pages, 1);

        // Both original pages must still be readable, including the parked
        // one (which reloads through eviction of another frame).
        for (page_id, byte) in ids.iter().zip([1u8, 2]) {
            let frame = pool.fetch_page(*page_id).unwrap();
            assert_eq!(*frame.latch_read(), vec![byte]);
            pool.unpin_page(*page_id, false);
        }
    }

    #[test]
    fn test_pool_full_all_pinned() {
        let pool = create_test_pool(2);

        pool.new_page().unwrap();
        pool.new_page().unwrap();

        assert!(matches!(
            pool.new_page(),
            Err(QuarryError::BufferPoolFull)
        ));
    }

    #[test]
    fn test_pool_fetch_failure_keeps_parked_payload() {
        let pool = create_test_pool(2);

        let (victim, frame) = pool.new_page().unwrap();
        frame.latch_write().push(7);
        pool.unpin_page(victim, true);

        // Evict `victim` by filling the pool with pinned pages.
        let (a, _) = pool.new_page().unwrap();
        let (b, _) = pool.new_page().unwrap();
        assert!(!pool.is_resident(victim));

        // Fetching it back fails while everything is pinned...
        assert!(matches!(
            pool.fetch_page(victim),
            Err(QuarryError::BufferPoolFull)
        ));

        // ...but the payload survives for a later fetch.
        pool.unpin_page(a, false);
        pool.unpin_page(b, false);
        let frame = pool.fetch_page(victim).unwrap();
        assert_eq!(*frame.latch_read(), vec![7]);
        pool.unpin_page(victim, false);
    }

    #[test]
    fn test_pool_delete_page() {
        let pool = create_test_pool(10);
        let (page_id, _) = pool.new_page().unwrap();
        pool.unpin_page(page_id, false);

        assert!(pool.delete_page(page_id));
        assert!(!pool.is_resident(page_id));
        assert_eq!(pool.stats().free_frames, 10);

        // Deleted pages cannot be fetched again.
        assert!(pool.fetch_page(page_id).is_err());
    }

    #[test]
    fn test_pool_delete_pinned_page() {
        let pool = create_test_pool(10);
        let (page_id, _) = pool.new_page().unwrap();

        assert!(!pool.delete_page(page_id));
        assert!(pool.is_resident(page_id));
    }

    #[test]
    fn test_pool_delete_parked_page() {
        let pool = create_test_pool(1);
        let (first, _) = pool.new_page().unwrap();
        pool.unpin_page(first, true);

        // Evict `first` into the parking area.
        let (second, _) = pool.new_page().unwrap();
        pool.unpin_page(second, false);
        assert_eq!(pool.stats().parked_pages, 1);

        assert!(pool.delete_page(first));
        assert_eq!(pool.stats().parked_pages, 0);
        assert!(pool.fetch_page(first).is_err());
    }

    #[test]
    fn test_pool_pin_count_protects_from_eviction() {
        let pool = create_test_pool(2);

        let (kept, _) = pool.new_page().unwrap(); // stays pinned
        let (other, _) = pool.new_page().unwrap();
        pool.unpin_page(other, false);

        // Only `other` is evictable, so the new page replaces it.
        let (third, _) = pool.new_page().unwrap();
        assert!(pool.is_resident(kept));
        assert!(pool.is_resident(third));
        assert!(!pool.is_resident(other));
    }

    #[test]
    fn test_pool_lru_k_victim_order() {
        let pool = create_test_pool(3);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let (page_id, _) = pool.new_page().unwrap();
            pool.unpin_page(page_id, false);
            ids.push(page_id);
        }

        // Re-fetch pages 1 and 2 so page 0 has the oldest history.
        for &page_id in &ids[1..] {
            pool.fetch_page(page_id).unwrap();
            pool.unpin_page(page_id, false);
        }

        let (_, _) = pool.new_page().unwrap();
        assert!(!pool.is_resident(ids[0]));
        assert!(pool.is_resident(ids[1]));
        assert!(pool.is_resident(ids[2]));
    }

    #[test]
    fn test_pool_concurrent_new_fetch_unpin() {
        use std::sync::Arc;

        let pool: Arc<BufferPool<Vec<u8>>> = Arc::new(create_test_pool(16));
        let mut handles = Vec::new();

        for t in 0..4u8 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                let mut my_pages = Vec::new();
                for _ in 0..50 {
                    let (page_id, frame) = pool.new_page().unwrap();
                    frame.latch_write().push(t);
                    pool.unpin_page(page_id, true);
                    my_pages.push(page_id);
                }
                for &page_id in &my_pages {
                    let frame = pool.fetch_page(page_id).unwrap();
                    assert_eq!(*frame.latch_read(), vec![t]);
                    pool.unpin_page(page_id, false);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
