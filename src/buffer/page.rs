use std::sync::atomic::AtomicI32;

pub type PageId = i32;
pub type AtomicPageId = AtomicI32;

pub const INVALID_PAGE_ID: PageId = -1;
pub const PAGE_SIZE: usize = 4096;

/// A fixed-size page resident in a buffer pool frame.
///
/// Frames hand pages out as `Arc<RwLock<Page>>`; the surrounding `RwLock`
/// doubles as the page latch. Pin count and dirty flag are only touched
/// under the owning buffer pool's latch.
pub struct Page {
    pub page_id: PageId,
    data: [u8; PAGE_SIZE],
    pub pin_count: u32,
    pub is_dirty: bool,
}

impl Page {
    pub fn empty() -> Self {
        Self::new(INVALID_PAGE_ID)
    }

    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            data: [0; PAGE_SIZE],
            pin_count: 0,
            is_dirty: false,
        }
    }

    /// Returns the frame to its pristine state.
    pub fn reset(&mut self) {
        self.page_id = INVALID_PAGE_ID;
        self.data = [0; PAGE_SIZE];
        self.pin_count = 0;
        self.is_dirty = false;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("page_id", &self.page_id)
            .field("pin_count", &self.pin_count)
            .field("is_dirty", &self.is_dirty)
            .finish()
    }
}
