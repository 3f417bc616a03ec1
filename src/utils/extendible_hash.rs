use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// In-memory extendible hash table with unique keys.
///
/// The directory is a vector of indices into a bucket arena, so several
/// directory slots can share one bucket without aliasing: a split rebinds
/// directory entries, never bucket identities. A single mutex guards the
/// whole structure.
#[derive(Debug)]
pub struct ExtendibleHashTable<K, V> {
    bucket_size: usize,
    inner: Mutex<Inner<K, V>>,
}

#[derive(Debug)]
struct Inner<K, V> {
    global_depth: u32,
    dir: Vec<usize>,
    buckets: Vec<Bucket<K, V>>,
    num_buckets: usize,
}

#[derive(Debug)]
struct Bucket<K, V> {
    depth: u32,
    items: Vec<(K, V)>,
}

fn hash_of<K: Hash>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size > 0);
        Self {
            bucket_size,
            inner: Mutex::new(Inner {
                global_depth: 0,
                dir: vec![0],
                buckets: vec![Bucket {
                    depth: 0,
                    items: Vec::new(),
                }],
                num_buckets: 1,
            }),
        }
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let bucket = &inner.buckets[inner.dir[inner.index_of(key)]];
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let bucket_idx = inner.dir[inner.index_of(key)];
        let bucket = &mut inner.buckets[bucket_idx];
        match bucket.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                bucket.items.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Inserts a key-value pair, overwriting the value of an existing key.
    /// Splits the target bucket (doubling the directory when the bucket's
    /// local depth has caught up with the global depth) until a slot is
    /// available.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        loop {
            let bucket_idx = inner.dir[inner.index_of(&key)];
            if inner.buckets[bucket_idx].items.len() < self.bucket_size {
                break;
            }
            inner.split(bucket_idx);
        }
        let bucket_idx = inner.dir[inner.index_of(&key)];
        let bucket = &mut inner.buckets[bucket_idx];
        match bucket.items.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => bucket.items.push((key, value)),
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .dir
            .iter()
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .map(|&idx| inner.buckets[idx].items.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn global_depth(&self) -> u32 {
        self.inner.lock().global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> u32 {
        let inner = self.inner.lock();
        inner.buckets[inner.dir[dir_index]].depth
    }

    pub fn num_buckets(&self) -> usize {
        self.inner.lock().num_buckets
    }
}

impl<K, V> Inner<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn index_of(&self, key: &K) -> usize {
        (hash_of(key) as usize) & ((1usize << self.global_depth) - 1)
    }

    fn split(&mut self, bucket_idx: usize) {
        let old_depth = self.buckets[bucket_idx].depth;
        if old_depth == self.global_depth {
            // copy the lower half of the directory into the new upper half
            let capacity = self.dir.len();
            self.dir.extend_from_within(0..capacity);
            self.global_depth += 1;
        }

        // redistribute items on the bit the split introduces
        let mask = 1usize << old_depth;
        let items = std::mem::take(&mut self.buckets[bucket_idx].items);
        let (mut zeros, mut ones) = (Vec::new(), Vec::new());
        for (k, v) in items {
            if (hash_of(&k) as usize) & mask != 0 {
                ones.push((k, v));
            } else {
                zeros.push((k, v));
            }
        }
        self.buckets[bucket_idx].depth = old_depth + 1;
        self.buckets[bucket_idx].items = zeros;
        let new_idx = self.buckets.len();
        self.buckets.push(Bucket {
            depth: old_depth + 1,
            items: ones,
        });
        self.num_buckets += 1;

        for i in 0..self.dir.len() {
            if self.dir[i] == bucket_idx && i & mask != 0 {
                self.dir[i] = new_idx;
            }
        }
    }
}
