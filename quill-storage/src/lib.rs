//! Durable state for the consensus core: a sorted key/value database with
//! atomic write-batches (transaction index, block index records, best-chain
//! pointer, checkpoints, registry snapshots) plus the append-only block
//! files.

pub mod blockfile;
pub mod db;
pub mod records;

pub use blockfile::{BlockFilePos, BlockFileStore, MAX_BLOCK_FILE_SIZE};
pub use db::{ChainDb, SnapshotWriter, StoreError, DATABASE_VERSION};
pub use records::{DiskBlockIndexRecord, TxDiskPos, TxIndexEntry};
