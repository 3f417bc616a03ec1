use log::{debug, trace};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::buffer::{BufferPoolManager, Page, PageId};
use crate::error::{ShaleDBError, ShaleDBResult};
use crate::storage::codec::{HashTableBucketPageCodec, HashTableDirectoryPageCodec};
use crate::storage::page::{HashTableBucketPage, HashTableDirectoryPage, DIRECTORY_MAX_DEPTH};

/// Disk-resident extendible hash table.
///
/// The directory lives in a single page whose id is fixed at construction;
/// buckets live in pages of their own. Every access goes through the buffer
/// pool: fetch, operate, unpin with an accurate dirty flag. The table latch
/// orders structural changes against readers; the per-page `RwLock` on each
/// bucket page protects bucket contents. Latches are taken table first,
/// bucket second, and pages are unpinned in the reverse order.
pub struct DiskExtendibleHashTable<K, V> {
    buffer_pool: Arc<BufferPoolManager>,
    directory_page_id: PageId,
    bucket_max_size: u32,
    table_latch: RwLock<()>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> DiskExtendibleHashTable<K, V>
where
    K: Serialize + DeserializeOwned + Hash + Eq + Clone,
    V: Serialize + DeserializeOwned + PartialEq + Clone,
{
    /// Sets up a one-bucket table: a fresh directory page pointing at a
    /// fresh bucket page, both written out immediately.
    pub fn try_new(
        buffer_pool: Arc<BufferPoolManager>,
        bucket_max_size: u32,
    ) -> ShaleDBResult<Self> {
        let (directory_page_id, directory_page) = buffer_pool
            .new_page()?
            .ok_or_else(|| ShaleDBError::Storage("buffer pool exhausted".to_string()))?;
        let (bucket_page_id, bucket_page) = buffer_pool
            .new_page()?
            .ok_or_else(|| ShaleDBError::Storage("buffer pool exhausted".to_string()))?;

        {
            let bucket = HashTableBucketPage::<K, V>::new(bucket_max_size);
            let mut guard = bucket_page.write();
            guard
                .data_mut()
                .copy_from_slice(&HashTableBucketPageCodec::encode(&bucket)?);
        }
        buffer_pool.unpin_page(bucket_page_id, true);

        {
            let directory = HashTableDirectoryPage::new(bucket_page_id);
            let mut guard = directory_page.write();
            guard
                .data_mut()
                .copy_from_slice(&HashTableDirectoryPageCodec::encode(&directory));
        }
        buffer_pool.unpin_page(directory_page_id, true);

        debug!(
            "created hash table: directory page {}, first bucket page {}",
            directory_page_id, bucket_page_id
        );
        Ok(Self {
            buffer_pool,
            directory_page_id,
            bucket_max_size,
            table_latch: RwLock::new(()),
            _marker: PhantomData,
        })
    }

    pub fn directory_page_id(&self) -> PageId {
        self.directory_page_id
    }

    /// Collects every value stored under `key`.
    pub fn get_value(&self, key: &K) -> ShaleDBResult<Vec<V>> {
        let _table_guard = self.table_latch.read();
        let (_directory_page, directory) = self.fetch_directory()?;
        let bucket_page_id = directory.bucket_page_id(self.dir_index(key, &directory));
        let bucket_page = self.fetch_page(bucket_page_id)?;

        let result = {
            let guard = bucket_page.read();
            let (bucket, _) = HashTableBucketPageCodec::decode::<K, V>(guard.data())?;
            bucket.get_value(key)
        };
        self.buffer_pool.unpin_page(bucket_page_id, false);
        self.buffer_pool.unpin_page(self.directory_page_id, false);
        Ok(result)
    }

    /// Inserts a key-value pair, splitting the target bucket as long as it
    /// is full. Returns false when the exact pair is already present.
    pub fn insert(&self, key: K, value: V) -> ShaleDBResult<bool> {
        {
            let _table_guard = self.table_latch.read();
            let (_directory_page, directory) = self.fetch_directory()?;
            let bucket_page_id = directory.bucket_page_id(self.dir_index(&key, &directory));
            let bucket_page = self.fetch_page(bucket_page_id)?;

            let mut guard = bucket_page.write();
            let (mut bucket, _) = HashTableBucketPageCodec::decode::<K, V>(guard.data())?;
            if !bucket.is_full() {
                let inserted = bucket.insert(key, value);
                if inserted {
                    guard
                        .data_mut()
                        .copy_from_slice(&HashTableBucketPageCodec::encode(&bucket)?);
                }
                drop(guard);
                self.buffer_pool.unpin_page(bucket_page_id, inserted);
                self.buffer_pool.unpin_page(self.directory_page_id, false);
                return Ok(inserted);
            }
            drop(guard);
            self.buffer_pool.unpin_page(bucket_page_id, false);
            self.buffer_pool.unpin_page(self.directory_page_id, false);
        }
        // the bucket was full: retry from scratch holding the table latch
        // exclusively
        self.split_insert(key, value)
    }

    /// Removes the exact key-value pair. A bucket left empty triggers a
    /// merge attempt with its buddy.
    pub fn remove(&self, key: &K, value: &V) -> ShaleDBResult<bool> {
        let removed;
        let mut merge_candidate = false;
        {
            let _table_guard = self.table_latch.read();
            let (_directory_page, directory) = self.fetch_directory()?;
            let bucket_idx = self.dir_index(key, &directory);
            let bucket_page_id = directory.bucket_page_id(bucket_idx);
            let bucket_page = self.fetch_page(bucket_page_id)?;

            let mut guard = bucket_page.write();
            let (mut bucket, _) = HashTableBucketPageCodec::decode::<K, V>(guard.data())?;
            removed = bucket.remove(key, value);
            if removed {
                guard
                    .data_mut()
                    .copy_from_slice(&HashTableBucketPageCodec::encode(&bucket)?);
            }
            let emptied = bucket.is_empty();
            drop(guard);
            self.buffer_pool.unpin_page(bucket_page_id, removed);
            self.buffer_pool.unpin_page(self.directory_page_id, false);

            if emptied && directory.local_depth(bucket_idx) > 0 {
                merge_candidate = true;
            }
        }
        if merge_candidate {
            self.merge(key)?;
        }
        Ok(removed)
    }

    pub fn global_depth(&self) -> ShaleDBResult<u32> {
        let _table_guard = self.table_latch.read();
        let (_directory_page, directory) = self.fetch_directory()?;
        self.buffer_pool.unpin_page(self.directory_page_id, false);
        Ok(directory.global_depth())
    }

    /// Re-checks the directory invariants; panics on violation.
    pub fn verify_integrity(&self) -> ShaleDBResult<()> {
        let _table_guard = self.table_latch.read();
        let (_directory_page, directory) = self.fetch_directory()?;
        self.buffer_pool.unpin_page(self.directory_page_id, false);
        directory.verify_integrity();
        Ok(())
    }

    fn split_insert(&self, key: K, value: V) -> ShaleDBResult<bool> {
        let _table_guard = self.table_latch.write();
        let (directory_page, mut directory) = self.fetch_directory()?;
        let mut directory_dirty = false;

        loop {
            let bucket_idx = self.dir_index(&key, &directory);
            let bucket_page_id = directory.bucket_page_id(bucket_idx);
            let bucket_page = self.fetch_page(bucket_page_id)?;

            let mut bucket = {
                let guard = bucket_page.read();
                HashTableBucketPageCodec::decode::<K, V>(guard.data())?.0
            };

            if !bucket.is_full() {
                let inserted = bucket.insert(key, value);
                if inserted {
                    let mut guard = bucket_page.write();
                    guard
                        .data_mut()
                        .copy_from_slice(&HashTableBucketPageCodec::encode(&bucket)?);
                }
                self.buffer_pool.unpin_page(bucket_page_id, inserted);
                if directory_dirty {
                    let mut guard = directory_page.write();
                    guard
                        .data_mut()
                        .copy_from_slice(&HashTableDirectoryPageCodec::encode(&directory));
                }
                self.buffer_pool
                    .unpin_page(self.directory_page_id, directory_dirty);
                return Ok(inserted);
            }

            let local_depth = directory.local_depth(bucket_idx);
            let global_depth = directory.global_depth();
            if local_depth == global_depth && global_depth >= DIRECTORY_MAX_DEPTH {
                self.buffer_pool.unpin_page(bucket_page_id, false);
                self.buffer_pool
                    .unpin_page(self.directory_page_id, directory_dirty);
                return Err(ShaleDBError::Storage(
                    "hash table directory is at maximum depth".to_string(),
                ));
            }

            let (new_bucket_page_id, new_bucket_page) = match self.buffer_pool.new_page()? {
                Some(allocated) => allocated,
                None => {
                    self.buffer_pool.unpin_page(bucket_page_id, false);
                    self.buffer_pool
                        .unpin_page(self.directory_page_id, directory_dirty);
                    return Err(ShaleDBError::Storage("buffer pool exhausted".to_string()));
                }
            };
            trace!(
                "splitting bucket page {} (local depth {}) into new page {}",
                bucket_page_id,
                local_depth,
                new_bucket_page_id
            );

            if local_depth == global_depth {
                // the bucket owns its only directory slot: double the
                // directory and hand the new upper image to the new bucket
                directory.incr_global_depth();
                let split_image_idx = bucket_idx + (1usize << global_depth);
                directory.set_bucket_page_id(split_image_idx, new_bucket_page_id);
                directory.incr_local_depth(bucket_idx);
                directory.incr_local_depth(split_image_idx);
            } else {
                // several slots alias the bucket; the ones with the next
                // hash bit set move over to the new bucket
                let step = 1usize << local_depth;
                let base_idx = bucket_idx & (step - 1);
                let slots_per_side = 1usize << (global_depth - local_depth - 1);
                let mut idx = base_idx;
                for _ in 0..slots_per_side {
                    directory.incr_local_depth(idx);
                    idx += step * 2;
                }
                let mut idx = base_idx + step;
                for _ in 0..slots_per_side {
                    directory.set_bucket_page_id(idx, new_bucket_page_id);
                    directory.incr_local_depth(idx);
                    idx += step * 2;
                }
            }
            directory_dirty = true;

            // rehash everything through the updated directory
            let mut new_bucket = HashTableBucketPage::<K, V>::new(self.bucket_max_size);
            for (k, v) in bucket.take_entries() {
                if directory.bucket_page_id(self.dir_index(&k, &directory)) == bucket_page_id {
                    bucket.insert(k, v);
                } else {
                    new_bucket.insert(k, v);
                }
            }
            {
                let mut guard = bucket_page.write();
                guard
                    .data_mut()
                    .copy_from_slice(&HashTableBucketPageCodec::encode(&bucket)?);
            }
            self.buffer_pool.unpin_page(bucket_page_id, true);
            {
                let mut guard = new_bucket_page.write();
                guard
                    .data_mut()
                    .copy_from_slice(&HashTableBucketPageCodec::encode(&new_bucket)?);
            }
            self.buffer_pool.unpin_page(new_bucket_page_id, true);
        }
    }

    /// Folds an empty bucket into its buddy (the slot with the top local
    /// bit flipped) when both are empty at the same depth, then shrinks the
    /// directory if no bucket still needs the full depth. One level only;
    /// deeper merges happen through later removes.
    fn merge(&self, key: &K) -> ShaleDBResult<()> {
        let _table_guard = self.table_latch.write();
        let (directory_page, mut directory) = self.fetch_directory()?;
        let mut directory_dirty = false;

        let bucket_idx = self.dir_index(key, &directory);
        let bucket_page_id = directory.bucket_page_id(bucket_idx);
        let local_depth = directory.local_depth(bucket_idx);

        if local_depth > 0 && self.bucket_is_empty(bucket_page_id)? {
            let buddy_idx = bucket_idx ^ (1usize << (local_depth - 1));
            let buddy_page_id = directory.bucket_page_id(buddy_idx);

            if buddy_page_id != bucket_page_id
                && directory.local_depth(buddy_idx) == local_depth
                && self.bucket_is_empty(buddy_page_id)?
            {
                // every slot congruent to the pair modulo 2^(L-1) now points
                // at the buddy, one level shallower
                let step = 1usize << (local_depth - 1);
                let mut idx = bucket_idx & (step - 1);
                while idx < directory.size() {
                    directory.set_bucket_page_id(idx, buddy_page_id);
                    directory.decr_local_depth(idx);
                    idx += step;
                }
                self.buffer_pool.delete_page(bucket_page_id)?;
                directory_dirty = true;
                debug!(
                    "merged empty bucket page {} into buddy page {}",
                    bucket_page_id, buddy_page_id
                );
            }
            if directory.can_shrink() {
                directory.decr_global_depth();
                directory_dirty = true;
            }
        }

        if directory_dirty {
            let mut guard = directory_page.write();
            guard
                .data_mut()
                .copy_from_slice(&HashTableDirectoryPageCodec::encode(&directory));
        }
        self.buffer_pool
            .unpin_page(self.directory_page_id, directory_dirty);
        Ok(())
    }

    fn bucket_is_empty(&self, bucket_page_id: PageId) -> ShaleDBResult<bool> {
        let bucket_page = self.fetch_page(bucket_page_id)?;
        let empty = {
            let guard = bucket_page.read();
            HashTableBucketPageCodec::decode::<K, V>(guard.data())?
                .0
                .is_empty()
        };
        self.buffer_pool.unpin_page(bucket_page_id, false);
        Ok(empty)
    }

    fn fetch_directory(&self) -> ShaleDBResult<(Arc<RwLock<Page>>, HashTableDirectoryPage)> {
        let page = self.fetch_page(self.directory_page_id)?;
        let directory = {
            let guard = page.read();
            HashTableDirectoryPageCodec::decode(guard.data())?.0
        };
        Ok((page, directory))
    }

    fn fetch_page(&self, page_id: PageId) -> ShaleDBResult<Arc<RwLock<Page>>> {
        self.buffer_pool.fetch_page(page_id)?.ok_or_else(|| {
            ShaleDBError::Storage(format!("buffer pool exhausted fetching page {}", page_id))
        })
    }

    /// 64-bit hash downcast to 32 bits; the directory index is the low
    /// `global_depth` bits.
    fn hash(&self, key: &K) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as u32
    }

    fn dir_index(&self, key: &K, directory: &HashTableDirectoryPage) -> usize {
        (self.hash(key) & directory.global_depth_mask()) as usize
    }
}
