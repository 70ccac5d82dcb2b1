//! Per-recorder pipeline lookup caches.
//!
//! Recorders resolve almost every item against pipelines they saw a few
//! items ago, so each recorder keeps a small lock-free cache in front of the
//! shared map. Lookups that hit here never touch the shared `RwLock`.

use std::borrow::Borrow;

/// Fixed-capacity cache that overwrites the oldest entry on insert and
/// searches newest first.
pub struct CircularCache<K, V, const N: usize> {
    entries: [Option<(K, V)>; N],
    last: usize,
    count: usize,
}

impl<K, V, const N: usize> CircularCache<K, V, N> {
    pub fn new() -> Self {
        Self {
            entries: std::array::from_fn(|_| None),
            last: 0,
            count: 0,
        }
    }

    pub fn find<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        for i in 0..self.count {
            let slot = (N + self.last - i) % N;
            if let Some((k, v)) = self.entries[slot].as_ref() {
                if k.borrow() == key {
                    return Some(v);
                }
            }
        }
        None
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.last = (self.last + 1) % N;
        self.entries[self.last] = Some((key, value));
        self.count = (self.count + 1).min(N);
    }

    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            *entry = None;
        }
        self.last = 0;
        self.count = 0;
    }
}

impl<K, V, const N: usize> Default for CircularCache<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Bucketed front of [`CircularCache`] sets, addressed by the key's sealed
/// hash so a lookup only walks one small way-set.
pub struct HashedCircularCache<K, V, const BUCKETS: usize, const WAYS: usize> {
    buckets: Vec<CircularCache<K, V, WAYS>>,
}

impl<K, V, const BUCKETS: usize, const WAYS: usize> HashedCircularCache<K, V, BUCKETS, WAYS> {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(BUCKETS);
        buckets.resize_with(BUCKETS, CircularCache::new);
        Self { buckets }
    }

    fn bucket_of(hash: u64) -> usize {
        (hash % BUCKETS as u64) as usize
    }

    pub fn find_hashed<Q>(&self, hash: u64, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.buckets[Self::bucket_of(hash)].find(key)
    }

    pub fn insert_hashed(&mut self, hash: u64, key: K, value: V) {
        self.buckets[Self::bucket_of(hash)].insert(key, value);
    }

    pub fn reset(&mut self) {
        for bucket in &mut self.buckets {
            bucket.reset();
        }
    }
}

impl<K, V, const BUCKETS: usize, const WAYS: usize> Default
    for HashedCircularCache<K, V, BUCKETS, WAYS>
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrites_oldest_entry_when_full() {
        let mut cache: CircularCache<u32, u32, 4> = CircularCache::new();
        for i in 0..6u32 {
            cache.insert(i, i * 10);
        }
        assert_eq!(cache.find(&5), Some(&50));
        assert_eq!(cache.find(&2), Some(&20));
        assert_eq!(cache.find(&1), None);
        assert_eq!(cache.find(&0), None);
    }

    #[test]
    fn finds_newest_duplicate_first() {
        let mut cache: CircularCache<u32, u32, 4> = CircularCache::new();
        cache.insert(7, 1);
        cache.insert(7, 2);
        assert_eq!(cache.find(&7), Some(&2));
    }

    #[test]
    fn boxed_slice_keys_look_up_by_slice() {
        let mut cache: CircularCache<Box<[u8]>, u32, 4> = CircularCache::new();
        cache.insert(vec![1, 2, 3].into_boxed_slice(), 9);
        let probe: &[u8] = &[1, 2, 3];
        assert_eq!(cache.find(probe), Some(&9));
        let miss: &[u8] = &[1, 2, 4];
        assert_eq!(cache.find(miss), None);
    }

    #[test]
    fn hashed_cache_keeps_colliding_hashes_apart_by_key() {
        let mut cache: HashedCircularCache<Box<[u8]>, u32, 7, 2> = HashedCircularCache::new();
        // Same bucket, different keys.
        cache.insert_hashed(3, vec![1].into_boxed_slice(), 10);
        cache.insert_hashed(3, vec![2].into_boxed_slice(), 20);
        assert_eq!(cache.find_hashed(3, [1].as_slice()), Some(&10));
        assert_eq!(cache.find_hashed(3, [2].as_slice()), Some(&20));
        assert_eq!(cache.find_hashed(10, [1].as_slice()), None);
    }

    #[test]
    fn reset_clears_every_bucket() {
        let mut cache: HashedCircularCache<u64, u32, 7, 2> = HashedCircularCache::new();
        for hash in 0..14u64 {
            cache.insert_hashed(hash, hash, hash as u32);
        }
        cache.reset();
        for hash in 0..14u64 {
            assert_eq!(cache.find_hashed(hash, &hash), None);
        }
    }
}
