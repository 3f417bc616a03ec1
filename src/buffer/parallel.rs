use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use crate::buffer::buffer_pool::BufferPoolManager;
use crate::buffer::page::{Page, PageId};
use crate::config::BufferPoolConfig;
use crate::error::ShaleDBResult;
use crate::storage::disk_manager::DiskManager;

/// Shards the page-id space over independent buffer pool instances so that
/// unrelated pages never contend on the same latch.
///
/// Routing is `page_id % num_instances`; each instance allocates page ids
/// in its own residue class, which keeps routing and allocation agreeing.
pub struct ParallelBufferPoolManager {
    instances: Vec<Arc<BufferPoolManager>>,
    // next instance to try for an allocation, advanced round-robin
    start_idx: Mutex<usize>,
}

impl ParallelBufferPoolManager {
    pub fn new(
        num_instances: usize,
        config: BufferPoolConfig,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        assert!(num_instances > 0);
        let instances = (0..num_instances)
            .map(|idx| {
                Arc::new(BufferPoolManager::with_instance(
                    config,
                    num_instances,
                    idx,
                    disk_manager.clone(),
                ))
            })
            .collect();
        Self {
            instances,
            start_idx: Mutex::new(0),
        }
    }

    fn instance_for(&self, page_id: PageId) -> &BufferPoolManager {
        &self.instances[page_id as usize % self.instances.len()]
    }

    pub fn pool_size(&self) -> usize {
        self.instances.iter().map(|instance| instance.size()).sum()
    }

    /// Tries every instance round-robin starting at `start_idx`. On success
    /// the cursor moves just past the owning instance; on total failure it
    /// advances by one so the next attempt starts elsewhere.
    pub fn new_page(&self) -> ShaleDBResult<Option<(PageId, Arc<RwLock<Page>>)>> {
        let mut start_idx = self.start_idx.lock();
        let num_instances = self.instances.len();
        for offset in 0..num_instances {
            let idx = (*start_idx + offset) % num_instances;
            if let Some((page_id, page)) = self.instances[idx].new_page()? {
                *start_idx = (page_id as usize + 1) % num_instances;
                return Ok(Some((page_id, page)));
            }
        }
        *start_idx = (*start_idx + 1) % num_instances;
        Ok(None)
    }

    pub fn fetch_page(&self, page_id: PageId) -> ShaleDBResult<Option<Arc<RwLock<Page>>>> {
        self.instance_for(page_id).fetch_page(page_id)
    }

    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.instance_for(page_id).unpin_page(page_id, is_dirty)
    }

    pub fn flush_page(&self, page_id: PageId) -> ShaleDBResult<bool> {
        self.instance_for(page_id).flush_page(page_id)
    }

    pub fn delete_page(&self, page_id: PageId) -> ShaleDBResult<bool> {
        self.instance_for(page_id).delete_page(page_id)
    }

    pub fn flush_all_pages(&self) -> ShaleDBResult<()> {
        for instance in &self.instances {
            instance.flush_all_pages()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(num_instances: usize, pool_size: usize) -> (TempDir, ParallelBufferPoolManager) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let config = BufferPoolConfig {
            buffer_pool_size: pool_size,
            replacer_k: 2,
        };
        (
            temp_dir,
            ParallelBufferPoolManager::new(num_instances, config, disk_manager),
        )
    }

    #[test]
    fn pool_size_sums_instances() {
        let (_temp_dir, pool) = setup(4, 3);
        assert_eq!(pool.pool_size(), 12);
    }

    #[test]
    fn allocations_round_robin_over_instances() {
        let (_temp_dir, pool) = setup(2, 2);

        let mut page_ids = Vec::new();
        for _ in 0..4 {
            let (page_id, _page) = pool.new_page().unwrap().unwrap();
            page_ids.push(page_id);
        }
        // alternating shards: even, odd, even, odd
        assert_eq!(page_ids, vec![0, 1, 2, 3]);

        // everything is pinned now
        assert!(pool.new_page().unwrap().is_none());

        // freeing a page on the odd shard lets the next allocation land there
        assert!(pool.unpin_page(1, false));
        let (page_id, _page) = pool.new_page().unwrap().unwrap();
        assert_eq!(page_id % 2, 1);
    }

    #[test]
    fn operations_route_to_owning_instance() {
        let (_temp_dir, pool) = setup(3, 2);
        let (page_id, page) = pool.new_page().unwrap().unwrap();
        page.write().data_mut()[0] = 42;
        drop(page);

        assert!(pool.unpin_page(page_id, true));
        assert!(pool.flush_page(page_id).unwrap());
        pool.flush_all_pages().unwrap();

        let page = pool.fetch_page(page_id).unwrap().unwrap();
        assert_eq!(page.read().data()[0], 42);
        drop(page);
        assert!(pool.unpin_page(page_id, false));
        assert!(pool.delete_page(page_id).unwrap());
    }
}
