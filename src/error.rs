use crate::transaction::TransactionId;
use thiserror::Error;

pub type ShaleDBResult<T, E = ShaleDBError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum ShaleDBError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("transaction {txn_id} aborted: {reason}")]
    TransactionAbort {
        txn_id: TransactionId,
        reason: AbortReason,
    },
}

/// Reason codes attached to a [`ShaleDBError::TransactionAbort`]. The
/// display form is the code itself so callers can surface it unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockSharedOnReadUncommitted,
    LockOnShrinking,
    UpgradeConflict,
    IncompatibleUpgrade,
    AttemptedIntentionLockOnRow,
    TableLockNotPresent,
    AttemptedUnlockButNoLockHeld,
    TableUnlockedBeforeUnlockingRows,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            AbortReason::LockSharedOnReadUncommitted => "LOCK_SHARED_ON_READ_UNCOMMITTED",
            AbortReason::LockOnShrinking => "LOCK_ON_SHRINKING",
            AbortReason::UpgradeConflict => "UPGRADE_CONFLICT",
            AbortReason::IncompatibleUpgrade => "INCOMPATIBLE_UPGRADE",
            AbortReason::AttemptedIntentionLockOnRow => "ATTEMPTED_INTENTION_LOCK_ON_ROW",
            AbortReason::TableLockNotPresent => "TABLE_LOCK_NOT_PRESENT",
            AbortReason::AttemptedUnlockButNoLockHeld => "ATTEMPTED_UNLOCK_BUT_NO_LOCK_HELD",
            AbortReason::TableUnlockedBeforeUnlockingRows => "TABLE_UNLOCKED_BEFORE_UNLOCKING_ROWS",
        };
        write!(f, "{}", code)
    }
}
