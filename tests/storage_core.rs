use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use shaledb::buffer::{BufferPoolManager, ParallelBufferPoolManager};
use shaledb::config::{BufferPoolConfig, LockManagerConfig};
use shaledb::error::{AbortReason, ShaleDBError};
use shaledb::storage::disk_manager::DiskManager;
use shaledb::storage::index::DiskExtendibleHashTable;
use shaledb::storage::page::RecordId;
use shaledb::transaction::{IsolationLevel, LockManager, LockMode, Transaction, TransactionState};

fn buffer_pool(pool_size: usize) -> (TempDir, Arc<BufferPoolManager>) {
    let temp_dir = TempDir::new().unwrap();
    let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("shale.db")).unwrap());
    let config = BufferPoolConfig {
        buffer_pool_size: pool_size,
        replacer_k: 2,
    };
    (
        temp_dir,
        Arc::new(BufferPoolManager::new(config, disk_manager)),
    )
}

// A pool of 4 frames under a table with dozens of bucket pages forces the
// hash table to survive constant eviction and re-reads.
#[test]
fn hash_table_survives_a_tiny_buffer_pool() {
    let (_temp_dir, pool) = buffer_pool(4);
    let table: DiskExtendibleHashTable<u64, RecordId> =
        DiskExtendibleHashTable::try_new(pool, 4).unwrap();

    for i in 0..128u64 {
        assert!(table.insert(i, RecordId::new(i as i32, 0)).unwrap());
    }
    table.verify_integrity().unwrap();
    for i in 0..128u64 {
        assert_eq!(
            table.get_value(&i).unwrap(),
            vec![RecordId::new(i as i32, 0)]
        );
    }
    for i in 0..64u64 {
        assert!(table.remove(&i, &RecordId::new(i as i32, 0)).unwrap());
    }
    table.verify_integrity().unwrap();
    for i in 0..128u64 {
        let expected = if i < 64 {
            vec![]
        } else {
            vec![RecordId::new(i as i32, 0)]
        };
        assert_eq!(table.get_value(&i).unwrap(), expected);
    }
}

#[test]
fn parallel_pool_backs_independent_pages() {
    let temp_dir = TempDir::new().unwrap();
    let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("shale.db")).unwrap());
    let config = BufferPoolConfig {
        buffer_pool_size: 4,
        replacer_k: 2,
    };
    let pool = Arc::new(ParallelBufferPoolManager::new(4, config, disk_manager));
    assert_eq!(pool.pool_size(), 16);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        handles.push(thread::spawn(move || {
            let mut owned = Vec::new();
            for _ in 0..8 {
                let (page_id, page) = pool.new_page().unwrap().unwrap();
                page.write().data_mut()[..4].copy_from_slice(&page_id.to_be_bytes());
                drop(page);
                assert!(pool.unpin_page(page_id, true));
                owned.push(page_id);
            }
            for page_id in owned {
                let page = pool.fetch_page(page_id).unwrap().unwrap();
                assert_eq!(&page.read().data()[..4], &page_id.to_be_bytes());
                drop(page);
                assert!(pool.unpin_page(page_id, false));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn transaction_walkthrough_under_strict_2pl() {
    let manager = LockManager::new(LockManagerConfig {
        cycle_detection_interval: Duration::from_millis(10),
    });
    let writer = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
    let rid = RecordId::new(3, 7);

    // the usual executor dance: IX on the table, X on the touched row
    assert!(manager
        .lock_table(&writer, LockMode::IntentionExclusive, 5)
        .unwrap());
    assert!(manager
        .lock_row(&writer, LockMode::Exclusive, 5, rid)
        .unwrap());

    // rows unlock before the table, and X release starts the shrink phase
    assert!(manager.unlock_row(&writer, 5, rid).unwrap());
    assert_eq!(writer.state(), TransactionState::Shrinking);
    assert!(manager.unlock_table(&writer, 5).unwrap());

    // any further acquisition dies with the protocol error
    let result = manager.lock_table(&writer, LockMode::IntentionShared, 5);
    assert!(matches!(
        result,
        Err(ShaleDBError::TransactionAbort {
            txn_id: 1,
            reason: AbortReason::LockOnShrinking,
        })
    ));
    assert_eq!(writer.state(), TransactionState::Aborted);
}

#[test]
fn deadlocked_writers_make_progress() {
    let manager = Arc::new(LockManager::new(LockManagerConfig {
        cycle_detection_interval: Duration::from_millis(10),
    }));
    let txn1 = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
    let txn2 = Arc::new(Transaction::new(2, IsolationLevel::RepeatableRead));
    let rid1 = RecordId::new(1, 1);
    let rid2 = RecordId::new(1, 2);

    assert!(manager
        .lock_table(&txn1, LockMode::IntentionExclusive, 1)
        .unwrap());
    assert!(manager
        .lock_table(&txn2, LockMode::IntentionExclusive, 1)
        .unwrap());
    assert!(manager
        .lock_row(&txn1, LockMode::Exclusive, 1, rid1)
        .unwrap());
    assert!(manager
        .lock_row(&txn2, LockMode::Exclusive, 1, rid2)
        .unwrap());

    let older = {
        let manager = manager.clone();
        let txn1 = txn1.clone();
        thread::spawn(move || manager.lock_row(&txn1, LockMode::Exclusive, 1, rid2))
    };
    thread::sleep(Duration::from_millis(20));
    let younger = {
        let manager = manager.clone();
        let txn2 = txn2.clone();
        thread::spawn(move || manager.lock_row(&txn2, LockMode::Exclusive, 1, rid1))
    };

    // the younger transaction is picked as the victim and backs out
    assert!(!younger.join().unwrap().unwrap());
    assert_eq!(txn2.state(), TransactionState::Aborted);
    manager.release_all_locks(&txn2);

    // with the victim gone the older transaction finishes its write set
    assert!(older.join().unwrap().unwrap());
    manager.release_all_locks(&txn1);
    assert!(!txn1.holds_row_locks_on(1));
}
