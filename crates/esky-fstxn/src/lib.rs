mod detect;
mod fs_utils;
mod journal;
mod scope;
mod transaction;

pub use detect::{detect_strategy, TxnStrategy};
pub use fs_utils::{copy_dir_recursive, remove_path, snapshot_tree};
pub use journal::{recover_stale_transactions, JournalState, TransactionJournalEntry, UndoRecord};
pub use transaction::{Transaction, SCRATCH_PREFIX};

#[cfg(test)]
mod tests;
