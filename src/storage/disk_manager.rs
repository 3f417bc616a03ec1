use log::debug;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::buffer::{PageId, PAGE_SIZE};
use crate::error::{ShaleDBError, ShaleDBResult};

/// Reads and writes fixed-size pages against a single database file. A
/// mutex over the file handle serializes seeks against their reads and
/// writes.
#[derive(Debug)]
pub struct DiskManager {
    db_file: Mutex<File>,
}

impl DiskManager {
    pub fn try_new(db_path: impl AsRef<Path>) -> ShaleDBResult<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path.as_ref())?;
        debug!("opened database file {:?}", db_path.as_ref());
        Ok(Self {
            db_file: Mutex::new(db_file),
        })
    }

    /// Reads a page into `buf`. Reading past the end of the file zero-fills
    /// the remainder, so freshly allocated pages come back empty.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> ShaleDBResult<()> {
        Self::check_page_id(page_id)?;
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(Self::page_offset(page_id)))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < buf.len() {
            debug!(
                "short read for page {} ({} of {} bytes), zero-filling the rest",
                page_id,
                filled,
                buf.len()
            );
            buf[filled..].fill(0);
        }
        Ok(())
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> ShaleDBResult<()> {
        Self::check_page_id(page_id)?;
        if data.len() != PAGE_SIZE {
            return Err(ShaleDBError::Storage(format!(
                "page write of {} bytes, expected {}",
                data.len(),
                PAGE_SIZE
            )));
        }
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(Self::page_offset(page_id)))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }

    /// Page ids are not recycled; the slot simply becomes garbage until the
    /// file is rebuilt.
    pub fn deallocate_page(&self, page_id: PageId) {
        debug!("deallocate page {}", page_id);
    }

    fn check_page_id(page_id: PageId) -> ShaleDBResult<()> {
        if page_id < 0 {
            return Err(ShaleDBError::Storage(format!(
                "invalid page id {}",
                page_id
            )));
        }
        Ok(())
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id as u64 * PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        let mut data = vec![0u8; PAGE_SIZE];
        data[..5].copy_from_slice(b"hello");
        disk_manager.write_page(3, &data).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        disk_manager.read_page(3, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn read_past_eof_zero_fills() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        let mut buf = vec![0xFFu8; PAGE_SIZE];
        disk_manager.read_page(7, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_invalid_page_ids() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(disk_manager.read_page(-1, &mut buf).is_err());
        assert!(disk_manager.write_page(-1, &buf).is_err());
        assert!(disk_manager.write_page(0, &buf[..10]).is_err());
    }
}
