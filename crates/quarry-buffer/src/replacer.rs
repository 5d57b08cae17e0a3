//! Page replacement policies for the buffer pool.

use parking_lot::Mutex;
use quarry_common::FrameId;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

/// Trait for page replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed.
    fn record_access(&self, frame_id: FrameId);

    /// Marks a frame as evictable (unpinned).
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);

    /// Combined operation: records access and pins the frame (sets non-evictable).
    /// Single lock acquisition instead of two separate calls.
    fn access_and_pin(&self, frame_id: FrameId);

    /// Selects a victim frame for eviction.
    ///
    /// Returns None if no frames are evictable.
    fn evict(&self) -> Option<FrameId>;

    /// Removes a frame from the replacer.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// Per-frame bookkeeping.
struct FrameInfo {
    /// Number of recorded accesses.
    access_count: usize,
    /// Whether the frame may be chosen as an eviction victim.
    evictable: bool,
}

struct LruKInner {
    /// Promotion threshold (the k in LRU-K).
    k: usize,
    /// Tracked frames and their access counts / evictable flags.
    frames: HashMap<FrameId, FrameInfo>,
    /// Frames with fewer than k accesses. Front = most recently inserted,
    /// so the rear holds the frame with the largest backward k-distance.
    history: VecDeque<FrameId>,
    /// Frames with k or more accesses. Front = most recently accessed,
    /// so the rear holds the least recently used frame.
    cache: VecDeque<FrameId>,
    /// Number of frames whose evictable flag is true.
    current_size: usize,
}

impl LruKInner {
    fn remove_from_queue(queue: &mut VecDeque<FrameId>, frame_id: FrameId) {
        if let Some(pos) = queue.iter().position(|&f| f == frame_id) {
            queue.remove(pos);
        }
    }

    /// Records one access, maintaining the two-queue invariant:
    /// every tracked frame sits in exactly one of {history, cache}.
    fn record(&mut self, frame_id: FrameId) {
        let count = match self.frames.entry(frame_id) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().access_count += 1;
                entry.get().access_count
            }
            Entry::Vacant(entry) => {
                entry.insert(FrameInfo {
                    access_count: 1,
                    evictable: false,
                });
                self.history.push_front(frame_id);
                1
            }
        };

        if count == self.k {
            // Promotion: the k-th access moves the frame to the cache queue.
            Self::remove_from_queue(&mut self.history, frame_id);
            self.cache.push_front(frame_id);
        } else if count > self.k {
            // Already cached: move to the front to reflect the latest access.
            Self::remove_from_queue(&mut self.cache, frame_id);
            self.cache.push_front(frame_id);
        }
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        if let Some(info) = self.frames.get_mut(&frame_id) {
            if info.evictable != evictable {
                info.evictable = evictable;
                if evictable {
                    self.current_size += 1;
                } else {
                    self.current_size -= 1;
                }
            }
        }
    }
}

/// LRU-K replacement algorithm.
///
/// Victims are chosen first among frames with fewer than k recorded
/// accesses (infinite backward k-distance), earliest-inserted first;
/// only when none exists does eviction fall back to the least recently
/// used frame among those with k or more accesses.
pub struct LruKReplacer {
    /// Maximum number of frames (frame ids must be below this).
    replacer_size: usize,
    /// State protected by a single mutex.
    inner: Mutex<LruKInner>,
}

impl LruKReplacer {
    /// Creates a new LRU-K replacer for frame ids in `0..replacer_size`.
    ///
    /// # Panics
    /// Panics if `k` is zero.
    pub fn new(replacer_size: usize, k: usize) -> Self {
        assert!(k > 0, "LRU-K requires k >= 1");
        Self {
            replacer_size,
            inner: Mutex::new(LruKInner {
                k,
                frames: HashMap::new(),
                history: VecDeque::new(),
                cache: VecDeque::new(),
                current_size: 0,
            }),
        }
    }

    /// Returns the frame capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.replacer_size
    }

    /// Number of frames currently in the sub-k history queue.
    pub fn history_len(&self) -> usize {
        self.inner.lock().history.len()
    }

    /// Number of frames currently in the cache queue.
    pub fn cache_len(&self) -> usize {
        self.inner.lock().cache.len()
    }

    fn assert_in_range(&self, frame_id: FrameId) {
        assert!(
            (frame_id.0 as usize) < self.replacer_size,
            "invalid frame id {} (replacer size {})",
            frame_id,
            self.replacer_size
        );
    }
}

impl Replacer for LruKReplacer {
    fn record_access(&self, frame_id: FrameId) {
        self.assert_in_range(frame_id);
        self.inner.lock().record(frame_id);
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        self.assert_in_range(frame_id);
        self.inner.lock().set_evictable(frame_id, evictable);
    }

    fn access_and_pin(&self, frame_id: FrameId) {
        self.assert_in_range(frame_id);
        let mut inner = self.inner.lock();
        inner.record(frame_id);
        inner.set_evictable(frame_id, false);
    }

    fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        if inner.current_size == 0 {
            return None;
        }

        // Sub-k frames have infinite backward k-distance and are scanned
        // first, from the rear (earliest first access).
        let victim = inner
            .history
            .iter()
            .rev()
            .copied()
            .find(|f| inner.frames[f].evictable)
            .or_else(|| {
                inner
                    .cache
                    .iter()
                    .rev()
                    .copied()
                    .find(|f| inner.frames[f].evictable)
            })?;

        let info = inner.frames.remove(&victim).unwrap();
        if info.access_count < inner.k {
            LruKInner::remove_from_queue(&mut inner.history, victim);
        } else {
            LruKInner::remove_from_queue(&mut inner.cache, victim);
        }
        inner.current_size -= 1;
        Some(victim)
    }

    fn remove(&self, frame_id: FrameId) {
        self.assert_in_range(frame_id);
        let mut inner = self.inner.lock();
        let Some(info) = inner.frames.get(&frame_id) else {
            return;
        };
        assert!(
            info.evictable,
            "cannot remove pinned frame {} from replacer",
            frame_id
        );

        let sub_k = info.access_count < inner.k;
        inner.frames.remove(&frame_id);
        if sub_k {
            LruKInner::remove_from_queue(&mut inner.history, frame_id);
        } else {
            LruKInner::remove_from_queue(&mut inner.cache, frame_id);
        }
        inner.current_size -= 1;
    }

    fn size(&self) -> usize {
        self.inner.lock().current_size
    }
}
