//! Storage core of a native XML database: paged files behind a shared page
//! cache, B+tree indexes, a write-ahead journal with crash recovery, and a
//! lock manager for collection and document level locking.
pub mod btree;

pub mod cache;

pub mod error;

pub mod failpoint;

pub mod lock_manager;

pub mod loggable;

pub mod page;

pub mod page_store;

pub mod pager;

pub mod recovery;

pub mod transaction;

pub mod wal;

pub type PageId = u32;

pub type FileId = u16;

pub type TxnId = i64;

/// Page 0 holds the file header, so it doubles as the "no page" marker.
pub const INVALID_PAGE_ID: PageId = 0;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 1024;
pub const MAX_PAGE_SIZE: usize = 32768;

pub use btree::{BTree, KeyRange, RangeScan, ScanPosition};
pub use cache::{CacheStats, PageCache, PageGuard};
pub use error::{Error, LockError, LogError, RecoveryError, Result};
pub use lock_manager::{
    HeldEntry, LockManager, LockManagerOptions, LockMode, LockResource, ManagedLock, OwnerId,
    WaitEntry, WaitGraph,
};
pub use page::Page;
pub use page_store::PageStore;
pub use recovery::{RecoveryManager, RecoveryReport};
pub use transaction::{TransactionManager, Txn, TxnState};
pub use wal::{Journal, JournalOptions, JournalReader, Lsn};
