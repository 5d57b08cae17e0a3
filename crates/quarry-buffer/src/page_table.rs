//! Extendible hash table, used as the buffer pool's page table.
//!
//! The directory is a dense vector of shared bucket handles whose length is
//! always `2^global_depth`. A full bucket splits locally; when its local
//! depth already equals the global depth, the directory doubles first.
//! Buckets are never freed explicitly: the last handle disappears once every
//! directory slot has been redirected away.

use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

/// A bucket holding at most `capacity` key/value pairs.
struct Bucket<K, V> {
    /// Number of hash bits this bucket discriminates on.
    local_depth: usize,
    /// Maximum number of pairs before the bucket must split.
    capacity: usize,
    items: Vec<(K, V)>,
}

impl<K: Eq, V> Bucket<K, V> {
    fn new(capacity: usize, local_depth: usize) -> Self {
        Self {
            local_depth,
            capacity,
            items: Vec::with_capacity(capacity),
        }
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    fn find(&self, key: &K) -> Option<&V> {
        self.items.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn remove(&mut self, key: &K) -> bool {
        if let Some(pos) = self.items.iter().position(|(k, _)| k == key) {
            self.items.remove(pos);
            true
        } else {
            false
        }
    }

    /// Appends a pair. Caller ensures the key is absent and the bucket
    /// has room.
    fn push(&mut self, key: K, value: V) {
        debug_assert!(!self.is_full());
        self.items.push((key, value));
    }
}

struct Inner<K, V> {
    /// Number of hash bits the directory discriminates on.
    global_depth: usize,
    /// Cached count of distinct buckets.
    num_buckets: usize,
    /// Directory of length `2^global_depth`; slots may alias one bucket.
    dir: Vec<Arc<Mutex<Bucket<K, V>>>>,
}

/// Thread-safe extendible hash table.
///
/// All operations are serialized by a single table mutex; the per-bucket
/// mutexes only exist because directory slots share buckets through `Arc`.
pub struct ExtendibleHashTable<K, V, S = RandomState> {
    bucket_capacity: usize,
    hash_builder: S,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> ExtendibleHashTable<K, V, RandomState>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    /// Creates a table with a single empty bucket and `global_depth = 0`.
    pub fn new(bucket_capacity: usize) -> Self {
        Self::with_hasher(bucket_capacity, RandomState::new())
    }
}

impl<K, V, S> ExtendibleHashTable<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
    S: BuildHasher,
{
    /// Creates a table with an explicit hasher. Tests use this to pin hash
    /// values; production code takes the default `RandomState`.
    pub fn with_hasher(bucket_capacity: usize, hash_builder: S) -> Self {
        assert!(bucket_capacity > 0, "bucket capacity must be positive");
        Self {
            bucket_capacity,
            hash_builder,
            inner: Mutex::new(Inner {
                global_depth: 0,
                num_buckets: 1,
                dir: vec![Arc::new(Mutex::new(Bucket::new(bucket_capacity, 0)))],
            }),
        }
    }

    #[inline]
    fn hash(&self, key: &K) -> usize {
        self.hash_builder.hash_one(key) as usize
    }

    /// Directory slot for a key: the low `global_depth` bits of its hash.
    #[inline]
    fn index_of(&self, key: &K, global_depth: usize) -> usize {
        self.hash(key) & ((1 << global_depth) - 1)
    }

    /// Returns the number of hash bits the directory discriminates on.
    pub fn global_depth(&self) -> usize {
        self.inner.lock().global_depth
    }

    /// Returns the local depth of the bucket at the given directory slot.
    pub fn local_depth(&self, dir_index: usize) -> usize {
        self.inner.lock().dir[dir_index].lock().local_depth
    }

    /// Returns the number of distinct buckets.
    pub fn num_buckets(&self) -> usize {
        self.inner.lock().num_buckets
    }

    /// Returns the number of live key/value pairs.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        let mut seen: Vec<*const Mutex<Bucket<K, V>>> = Vec::new();
        let mut count = 0;
        for bucket in &inner.dir {
            let ptr = Arc::as_ptr(bucket);
            if !seen.contains(&ptr) {
                seen.push(ptr);
                count += bucket.lock().items.len();
            }
        }
        count
    }

    /// Returns true if the table holds no pairs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up the value for a key.
    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let index = self.index_of(key, inner.global_depth);
        let result = inner.dir[index].lock().find(key).cloned();
        result
    }

    /// Removes a key. Returns whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        let inner = self.inner.lock();
        let index = self.index_of(key, inner.global_depth);
        let result = inner.dir[index].lock().remove(key);
        result
    }

    /// Inserts a key/value pair, splitting buckets (and doubling the
    /// directory) until the target bucket has room.
    ///
    /// Upsert semantics: present with the same value is a no-op; present
    /// with a different value replaces the old pair.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();

        {
            let index = self.index_of(&key, inner.global_depth);
            let mut bucket = inner.dir[index].lock();
            if let Some(existing) = bucket.find(&key) {
                if *existing == value {
                    return;
                }
                bucket.remove(&key);
            }
        }

        loop {
            let index = self.index_of(&key, inner.global_depth);
            let target = Arc::clone(&inner.dir[index]);
            if !target.lock().is_full() {
                target.lock().push(key, value);
                return;
            }
            self.split(&mut inner, &target);
        }
    }

    /// Splits `target` into two buckets of local depth `d + 1`, doubling
    /// the directory first when `d` already equals the global depth.
    fn split(&self, inner: &mut Inner<K, V>, target: &Arc<Mutex<Bucket<K, V>>>) {
        let local_depth = target.lock().local_depth;

        if local_depth == inner.global_depth {
            // Double: append a copy of the directory so every existing
            // bucket is aliased by its high-bit twin slot.
            inner.global_depth += 1;
            let len = inner.dir.len();
            for i in 0..len {
                let alias = Arc::clone(&inner.dir[i]);
                inner.dir.push(alias);
            }
        }

        let mask = 1 << local_depth;
        let bucket0 = Arc::new(Mutex::new(Bucket::new(self.bucket_capacity, local_depth + 1)));
        let bucket1 = Arc::new(Mutex::new(Bucket::new(self.bucket_capacity, local_depth + 1)));
        inner.num_buckets += 1;

        // Rehash on the newly discriminated bit.
        for (k, v) in target.lock().items.drain(..) {
            if self.hash(&k) & mask != 0 {
                bucket1.lock().push(k, v);
            } else {
                bucket0.lock().push(k, v);
            }
        }

        // Redirect every slot that aliased the old bucket.
        for (i, slot) in inner.dir.iter_mut().enumerate() {
            if Arc::ptr_eq(slot, target) {
                *slot = if i & mask != 0 {
                    Arc::clone(&bucket1)
                } else {
                    Arc::clone(&bucket0)
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::Hasher;

    /// Hasher whose output equals the written integer, so tests control
    /// which directory slot a key lands in.
    #[derive(Default, Clone)]
    struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }

        fn write(&mut self, bytes: &[u8]) {
            let mut buf = [0u8; 8];
            let len = bytes.len().min(8);
            buf[..len].copy_from_slice(&bytes[..len]);
            self.0 = u64::from_ne_bytes(buf);
        }

        fn write_u64(&mut self, n: u64) {
            self.0 = n;
        }
    }

    #[derive(Default, Clone)]
    struct IdentityBuild;

    impl BuildHasher for IdentityBuild {
        type Hasher = IdentityHasher;

        fn build_hasher(&self) -> IdentityHasher {
            IdentityHasher::default()
        }
    }

    fn identity_table(bucket_capacity: usize) -> ExtendibleHashTable<u64, u64, IdentityBuild> {
        ExtendibleHashTable::with_hasher(bucket_capacity, IdentityBuild)
    }

    #[test]
    fn test_new_table_has_one_bucket() {
        let table: ExtendibleHashTable<i32, i32> = ExtendibleHashTable::new(4);
        assert_eq!(table.global_depth(), 0);
        assert_eq!(table.local_depth(0), 0);
        assert_eq!(table.num_buckets(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_insert_find_remove() {
        let table: ExtendibleHashTable<i32, String> = ExtendibleHashTable::new(4);

        table.insert(1, "a".to_string());
        table.insert(2, "b".to_string());
        table.insert(3, "c".to_string());

        assert_eq!(table.find(&1), Some("a".to_string()));
        assert_eq!(table.find(&2), Some("b".to_string()));
        assert_eq!(table.find(&3), Some("c".to_string()));
        assert_eq!(table.find(&4), None);
        assert_eq!(table.len(), 3);

        assert!(table.remove(&2));
        assert!(!table.remove(&2));
        assert_eq!(table.find(&2), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_insert_is_upsert() {
        let table: ExtendibleHashTable<i32, i32> = ExtendibleHashTable::new(4);

        table.insert(1, 10);
        table.insert(1, 10); // same value: no-op
        assert_eq!(table.len(), 1);

        table.insert(1, 20); // different value: replace
        assert_eq!(table.find(&1), Some(20));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_directory_doubling_sequence() {
        // bucket_capacity = 2, identity hashes. 0 and 1 share the single
        // bucket; 2 fills it past capacity and doubles the directory to
        // global_depth 1 ({0,2} / {1}); 3 still fits next to 1; 4 lands in
        // the full {0,2} bucket and doubles again to global_depth 2.
        let table = identity_table(2);

        table.insert(0, 0);
        table.insert(1, 10);
        assert_eq!(table.global_depth(), 0);
        assert_eq!(table.num_buckets(), 1);

        table.insert(2, 20);
        assert_eq!(table.global_depth(), 1);
        assert_eq!(table.num_buckets(), 2);

        table.insert(3, 30);
        assert_eq!(table.global_depth(), 1);
        assert_eq!(table.num_buckets(), 2);

        table.insert(4, 40);
        assert_eq!(table.global_depth(), 2);
        assert_eq!(table.num_buckets(), 3);
        assert_eq!(table.local_depth(0), 2);
        assert_eq!(table.local_depth(1), 1);
        assert_eq!(table.local_depth(2), 2);
        assert_eq!(table.local_depth(3), 1);

        for key in 0..5u64 {
            assert_eq!(table.find(&key), Some(key * 10));
        }
    }

    #[test]
    fn test_split_preserves_all_entries() {
        let table = identity_table(2);
        for key in 0..32u64 {
            table.insert(key, key + 100);
        }
        for key in 0..32u64 {
            assert_eq!(table.find(&key), Some(key + 100));
        }
        assert_eq!(table.len(), 32);
    }

    #[test]
    fn test_local_depth_bounded_by_global_depth() {
        let table = identity_table(2);
        for key in 0..64u64 {
            table.insert(key, key);
        }
        let global = table.global_depth();
        for i in 0..(1usize << global) {
            assert!(table.local_depth(i) <= global);
        }
    }

    #[test]
    fn test_aliased_slots_agree_on_low_bits() {
        let table = identity_table(2);
        for key in 0..16u64 {
            table.insert(key, key);
        }
        let global = table.global_depth();
        // Every key must be findable through its own slot, which implies
        // slot aliasing is consistent with local depths.
        for key in 0..16u64 {
            let index = (key as usize) & ((1 << global) - 1);
            let local = table.local_depth(index);
            assert!(local <= global);
            assert_eq!(table.find(&key), Some(key));
        }
    }

    #[test]
    fn test_skewed_keys_keep_splitting() {
        // Keys that agree on their low 3 bits force repeated doubling
        // before they separate.
        let table = identity_table(2);
        for i in 0..4u64 {
            table.insert(i << 3, i);
        }
        for i in 0..4u64 {
            assert_eq!(table.find(&(i << 3)), Some(i));
        }
        assert!(table.global_depth() >= 2);
    }

    #[test]
    fn test_remove_then_reinsert() {
        let table = identity_table(2);
        for key in 0..8u64 {
            table.insert(key, key);
        }
        for key in 0..8u64 {
            assert!(table.remove(&key));
        }
        assert!(table.is_empty());

        // Depth does not shrink, but reinsertion must still work.
        let depth_after_removal = table.global_depth();
        for key in 0..8u64 {
            table.insert(key, key * 2);
        }
        assert_eq!(table.global_depth(), depth_after_removal);
        for key in 0..8u64 {
            assert_eq!(table.find(&key), Some(key * 2));
        }
    }

    #[test]
    fn test_default_hasher_smoke() {
        let table: ExtendibleHashTable<String, u32> = ExtendibleHashTable::new(3);
        for i in 0..100u32 {
            table.insert(format!("key-{i}"), i);
        }
        for i in 0..100u32 {
            assert_eq!(table.find(&format!("key-{i}")), Some(i));
        }
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn test_random_ops_match_hashmap() {
        use rand::Rng;
        use std::collections::HashMap;

        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(4);
        let mut model: HashMap<u32, u32> = HashMap::new();
        let mut rng = rand::thread_rng();

        for i in 0..2000u32 {
            let key = rng.gen_range(0..256);
            if rng.gen_bool(0.7) {
                table.insert(key, i);
                model.insert(key, i);
            } else {
                assert_eq!(table.remove(&key), model.remove(&key).is_some());
            }
        }

        assert_eq!(table.len(), model.len());
        for (key, value) in &model {
            assert_eq!(table.find(key), Some(*value));
        }
    }

    #[test]
    fn test_concurrent_inserts_and_finds() {
        use std::sync::Arc;

        let table: Arc<ExtendibleHashTable<u64, u64>> = Arc::new(ExtendibleHashTable::new(4));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                for i in 0..250u64 {
                    let key = t * 1000 + i;
                    table.insert(key, key);
                    assert_eq!(table.find(&key), Some(key));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 1000);
    }
}
