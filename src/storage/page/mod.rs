pub mod hash_page;

pub use hash_page::{HashTableBucketPage, HashTableDirectoryPage, DIRECTORY_MAX_DEPTH};

use crate::buffer::PageId;
use serde::{Deserialize, Serialize};

/// Identifies a row: the page holding it plus the slot within that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot_num: u32,
}

impl RecordId {
    pub fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }
}
