mod lock_manager;
mod transaction;

pub use lock_manager::{LockManager, LockMode};
pub use transaction::{
    IsolationLevel, TableOid, Transaction, TransactionId, TransactionState,
};
