#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use strata::{
    BTree, FileId, Journal, JournalOptions, PageCache, PageStore, RecoveryManager, RecoveryReport,
    TransactionManager,
};

/// A database opened over a directory: every start runs recovery, and
/// dropping the value without [`Db::shutdown`] is a crash.
pub struct Db {
    pub journal: Arc<Journal>,
    pub cache: Arc<PageCache>,
    pub tm: TransactionManager,
    pub report: RecoveryReport,
}

impl Db {
    /// Opens (creating if missing) the given index and raw page files.
    pub fn open(dir: &Path, indexes: &[(&str, FileId)], raw: &[(&str, FileId)]) -> Db {
        Self::open_with(dir, indexes, raw, 256)
    }

    pub fn open_with(
        dir: &Path,
        indexes: &[(&str, FileId)],
        raw: &[(&str, FileId)],
        capacity: usize,
    ) -> Db {
        let journal = Journal::open(dir.join("journal"), JournalOptions::default()).unwrap();
        let cache = Arc::new(PageCache::with_wal(capacity, journal.clone()));
        for (name, id) in indexes {
            let path = dir.join(name);
            if path.exists() {
                BTree::open(cache.clone(), &path).unwrap();
            } else {
                BTree::create(cache.clone(), &path, *id, 1024).unwrap();
            }
        }
        for (name, id) in raw {
            let path = dir.join(name);
            if path.exists() {
                PageStore::open(cache.clone(), &path).unwrap();
            } else {
                PageStore::create(cache.clone(), &path, *id, 4096).unwrap();
            }
        }
        let report = RecoveryManager::new(journal.clone(), cache.clone())
            .recover()
            .unwrap();
        let tm = TransactionManager::new(journal.clone(), cache.clone(), report.next_txn_id());
        Db {
            journal,
            cache,
            tm,
            report,
        }
    }

    pub fn tree(&self, file: FileId) -> BTree {
        BTree::attach(self.cache.clone(), file).unwrap()
    }

    pub fn store(&self, file: FileId) -> PageStore {
        PageStore::new(self.cache.clone(), file).unwrap()
    }

    /// Clean shutdown: final checkpoint, pages written, journal closed.
    pub fn shutdown(self) {
        self.tm.shutdown().unwrap();
        self.cache.sync_all().unwrap();
        self.journal.close().unwrap();
    }
}

pub fn key(i: u32) -> Vec<u8> {
    format!("key{i:06}").into_bytes()
}
