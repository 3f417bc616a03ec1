use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::buffer::page::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::config::BufferPoolConfig;
use crate::error::{ShaleDBError, ShaleDBResult};
use crate::storage::disk_manager::DiskManager;
use crate::utils::cache::lru_k::LRUKReplacer;
use crate::utils::cache::Replacer;
use crate::utils::extendible_hash::ExtendibleHashTable;

pub type FrameId = usize;

// slots per page-table bucket
const PAGE_TABLE_BUCKET_SIZE: usize = 4;

/// Manages a fixed array of in-memory frames caching disk pages.
///
/// A single latch serializes every public operation; disk traffic happens
/// under it. Callers must unpin every page they fetch or create exactly
/// once, or the frame stays resident forever.
pub struct BufferPoolManager {
    pool: Vec<Arc<RwLock<Page>>>,
    inner: Mutex<BufferPoolInner>,
    disk_manager: Arc<DiskManager>,
}

struct BufferPoolInner {
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: LRUKReplacer,
    free_list: VecDeque<FrameId>,
    next_page_id: PageId,
    // page ids are striped so that shard k of n only ever allocates ids
    // congruent to k modulo n
    page_id_stride: PageId,
}

impl BufferPoolInner {
    fn allocate_page_id(&mut self) -> PageId {
        let page_id = self.next_page_id;
        self.next_page_id += self.page_id_stride;
        page_id
    }
}

impl BufferPoolManager {
    pub fn new(config: BufferPoolConfig, disk_manager: Arc<DiskManager>) -> Self {
        Self::with_instance(config, 1, 0, disk_manager)
    }

    /// Creates shard `instance_idx` of `num_instances` independent buffer
    /// pools sharing one disk manager.
    pub fn with_instance(
        config: BufferPoolConfig,
        num_instances: usize,
        instance_idx: usize,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        assert!(num_instances > 0 && instance_idx < num_instances);
        let mut pool = Vec::with_capacity(config.buffer_pool_size);
        let mut free_list = VecDeque::with_capacity(config.buffer_pool_size);
        for frame_id in 0..config.buffer_pool_size {
            pool.push(Arc::new(RwLock::new(Page::empty())));
            free_list.push_back(frame_id);
        }
        Self {
            pool,
            inner: Mutex::new(BufferPoolInner {
                page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
                replacer: LRUKReplacer::new(config.buffer_pool_size, config.replacer_k),
                free_list,
                next_page_id: instance_idx as PageId,
                page_id_stride: num_instances as PageId,
            }),
            disk_manager,
        }
    }

    /// Allocates a brand-new page pinned into a frame. Returns `None` when
    /// every frame is pinned.
    pub fn new_page(&self) -> ShaleDBResult<Option<(PageId, Arc<RwLock<Page>>)>> {
        let mut inner = self.inner.lock();
        if inner.free_list.is_empty() && inner.replacer.size() == 0 {
            return Ok(None);
        }
        let frame_id = self.acquire_frame(&mut inner)?;
        let page_id = inner.allocate_page_id();

        inner.page_table.insert(page_id, frame_id);
        inner.replacer.record_access(frame_id)?;
        inner.replacer.set_evictable(frame_id, false)?;
        {
            let mut page = self.pool[frame_id].write();
            page.reset();
            page.page_id = page_id;
            page.pin_count = 1;
        }
        Ok(Some((page_id, self.pool[frame_id].clone())))
    }

    /// Pins the page into a frame, reading it from disk if it is not
    /// resident. Returns `None` when every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> ShaleDBResult<Option<Arc<RwLock<Page>>>> {
        let mut inner = self.inner.lock();
        if let Some(frame_id) = inner.page_table.find(&page_id) {
            self.pool[frame_id].write().pin_count += 1;
            inner.replacer.record_access(frame_id)?;
            inner.replacer.set_evictable(frame_id, false)?;
            return Ok(Some(self.pool[frame_id].clone()));
        }

        if inner.free_list.is_empty() && inner.replacer.size() == 0 {
            return Ok(None);
        }
        let frame_id = self.acquire_frame(&mut inner)?;

        let mut buf = [0u8; PAGE_SIZE];
        self.disk_manager.read_page(page_id, &mut buf)?;

        inner.page_table.insert(page_id, frame_id);
        inner.replacer.record_access(frame_id)?;
        inner.replacer.set_evictable(frame_id, false)?;
        {
            let mut page = self.pool[frame_id].write();
            page.page_id = page_id;
            page.pin_count = 1;
            page.is_dirty = false;
            page.data_mut().copy_from_slice(&buf);
        }
        Ok(Some(self.pool[frame_id].clone()))
    }

    /// Drops one pin. The dirty flag only ever accumulates here: a
    /// read-only unpin can never clear a dirty mark left by a writer.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut inner = self.inner.lock();
        let Some(frame_id) = inner.page_table.find(&page_id) else {
            return false;
        };
        let mut page = self.pool[frame_id].write();
        if page.pin_count == 0 {
            return false;
        }
        if is_dirty {
            page.is_dirty = true;
        }
        page.pin_count -= 1;
        if page.pin_count == 0 {
            if let Err(e) = inner.replacer.set_evictable(frame_id, true) {
                warn!("failed to mark frame {} evictable: {}", frame_id, e);
            }
        }
        true
    }

    /// Writes the page to disk regardless of its dirty state. The dirty
    /// flag stays set so a later eviction still writes the page back.
    pub fn flush_page(&self, page_id: PageId) -> ShaleDBResult<bool> {
        let inner = self.inner.lock();
        self.flush_page_inner(&inner, page_id)
    }

    pub fn flush_all_pages(&self) -> ShaleDBResult<()> {
        let inner = self.inner.lock();
        for frame in &self.pool {
            let page_id = frame.read().page_id;
            self.flush_page_inner(&inner, page_id)?;
        }
        Ok(())
    }

    /// Evicts the page from its frame and gives the frame back to the free
    /// list. Deleting a page that is not resident succeeds trivially;
    /// deleting a pinned page fails.
    pub fn delete_page(&self, page_id: PageId) -> ShaleDBResult<bool> {
        let mut inner = self.inner.lock();
        let Some(frame_id) = inner.page_table.find(&page_id) else {
            return Ok(true);
        };
        if self.pool[frame_id].read().pin_count > 0 {
            return Ok(false);
        }

        inner.replacer.remove(frame_id)?;
        self.pool[frame_id].write().reset();
        inner.page_table.remove(&page_id);
        inner.free_list.push_back(frame_id);
        self.disk_manager.deallocate_page(page_id);
        Ok(true)
    }

    pub fn size(&self) -> usize {
        self.pool.len()
    }

    fn flush_page_inner(&self, inner: &BufferPoolInner, page_id: PageId) -> ShaleDBResult<bool> {
        if page_id == INVALID_PAGE_ID {
            return Ok(false);
        }
        let Some(frame_id) = inner.page_table.find(&page_id) else {
            return Ok(false);
        };
        let guard = self.pool[frame_id].read();
        self.disk_manager.write_page(page_id, guard.data())?;
        Ok(true)
    }

    /// Hands back a usable frame, preferring the free list and falling back
    /// to eviction. A dirty victim is written back before the frame is
    /// reused; its mapping leaves the page table.
    fn acquire_frame(&self, inner: &mut BufferPoolInner) -> ShaleDBResult<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }
        let frame_id = inner
            .replacer
            .evict()
            .ok_or_else(|| ShaleDBError::Storage("no evictable frame available".to_string()))?;

        let (evicted_page_id, dirty_data) = {
            let mut page = self.pool[frame_id].write();
            let page_id = page.page_id;
            let data = if page.is_dirty {
                Some(page.data().to_vec())
            } else {
                None
            };
            page.reset();
            (page_id, data)
        };
        if let Some(data) = dirty_data {
            debug!(
                "writing back dirty page {} evicted from frame {}",
                evicted_page_id, frame_id
            );
            self.disk_manager.write_page(evicted_page_id, &data)?;
        }
        inner.page_table.remove(&evicted_page_id);
        Ok(frame_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(pool_size: usize) -> (TempDir, BufferPoolManager) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let config = BufferPoolConfig {
            buffer_pool_size: pool_size,
            replacer_k: 2,
        };
        (temp_dir, BufferPoolManager::new(config, disk_manager))
    }

    #[test]
    fn new_page_until_pool_is_full() {
        let (_temp_dir, pool) = setup(2);

        let (p0, _page0) = pool.new_page().unwrap().unwrap();
        let (p1, _page1) = pool.new_page().unwrap().unwrap();
        assert_eq!(p0, 0);
        assert_eq!(p1, 1);

        // both frames pinned, nothing to evict
        assert!(pool.new_page().unwrap().is_none());

        assert!(pool.unpin_page(p0, true));
        assert!(pool.flush_page(p0).unwrap());

        // the freed frame is reused for the next allocation
        let (p2, _page2) = pool.new_page().unwrap().unwrap();
        assert_eq!(p2, 2);
        assert!(pool.fetch_page(p0).unwrap().is_none());
    }

    #[test]
    fn fetch_reads_evicted_page_back_from_disk() {
        let (_temp_dir, pool) = setup(1);

        let (p0, page0) = pool.new_page().unwrap().unwrap();
        page0.write().data_mut()[..4].copy_from_slice(b"ab12");
        drop(page0);
        assert!(pool.unpin_page(p0, true));

        // evicts p0 (writing it back) and takes over the only frame
        let (p1, _page1) = pool.new_page().unwrap().unwrap();
        assert!(pool.unpin_page(p1, false));

        let page0 = pool.fetch_page(p0).unwrap().unwrap();
        assert_eq!(&page0.read().data()[..4], b"ab12");
        drop(page0);
        assert!(pool.unpin_page(p0, false));
    }

    #[test]
    fn unpin_composes_dirty_flags() {
        let (_temp_dir, pool) = setup(2);
        let (p0, page0) = pool.new_page().unwrap().unwrap();

        // double pin, then a dirty unpin followed by a clean one
        let fetched = pool.fetch_page(p0).unwrap().unwrap();
        assert_eq!(fetched.read().pin_count, 2);
        assert!(pool.unpin_page(p0, true));
        assert!(pool.unpin_page(p0, false));
        assert!(page0.read().is_dirty);

        // pin count is zero now, further unpins fail
        assert!(!pool.unpin_page(p0, false));
        assert!(!pool.unpin_page(12345, false));
    }

    #[test]
    fn delete_page_frees_the_frame() {
        let (_temp_dir, pool) = setup(2);
        let (p0, _g0) = pool.new_page().unwrap().unwrap();
        let (p1, _g1) = pool.new_page().unwrap().unwrap();

        // pinned pages cannot be deleted
        assert!(!pool.delete_page(p0).unwrap());

        assert!(pool.unpin_page(p0, false));
        assert!(pool.delete_page(p0).unwrap());
        // deleting an absent page succeeds
        assert!(pool.delete_page(p0).unwrap());

        // the frame is free again even though p1 is still pinned
        assert!(pool.new_page().unwrap().is_some());
        let _ = p1;
    }

    #[test]
    fn fetch_fails_when_all_frames_pinned() {
        let (_temp_dir, pool) = setup(2);
        let (p0, _g0) = pool.new_page().unwrap().unwrap();
        let (_p1, _g1) = pool.new_page().unwrap().unwrap();
        assert!(pool.unpin_page(p0, false));
        let (_p2, _g2) = pool.new_page().unwrap().unwrap();

        // p0 was evicted; with every frame pinned it cannot come back
        assert!(pool.fetch_page(p0).unwrap().is_none());
    }

    #[test]
    fn flush_all_pages_writes_resident_pages() {
        let (_temp_dir, pool) = setup(3);
        let (p0, page0) = pool.new_page().unwrap().unwrap();
        let (p1, page1) = pool.new_page().unwrap().unwrap();
        page0.write().data_mut()[0] = 1;
        page1.write().data_mut()[0] = 2;
        drop(page0);
        drop(page1);
        pool.flush_all_pages().unwrap();
        assert!(pool.unpin_page(p0, true));
        assert!(pool.unpin_page(p1, true));

        let mut buf = [0u8; PAGE_SIZE];
        pool.disk_manager.read_page(p0, &mut buf).unwrap();
        assert_eq!(buf[0], 1);
        pool.disk_manager.read_page(p1, &mut buf).unwrap();
        assert_eq!(buf[0], 2);
    }
}
