//! Crash recovery.
//!
//! Recovery starts at the redo point stored in the last checkpoint, replays
//! every record in LSN order (repeating history, gated by page LSNs) and then
//! rolls back the losers: transactions with neither a commit nor an abort
//! record. Their compensations and a final abort record are logged, and a
//! fresh checkpoint closes the run.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::PageCache;
use crate::error::RecoveryError;
use crate::loggable::{LogKind, Loggable};
use crate::transaction::Txn;
use crate::wal::{Journal, Lsn, JOURNAL_HEADER_LEN};
use crate::{Error, Result, TxnId};

/// Outcome of a recovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records read from the journal.
    pub scanned: usize,
    /// Records whose redo touched at least one page.
    pub redone: usize,
    /// Loser records rolled back.
    pub undone: usize,
    pub losers: Vec<TxnId>,
    pub highest_txn_id: TxnId,
    /// Checkpoint the run started from.
    pub checkpoint: Option<Lsn>,
    /// First damaged record found in the journal tail.
    pub truncated_at: Option<Lsn>,
}

impl RecoveryReport {
    /// The id the transaction manager should hand out next.
    pub fn next_txn_id(&self) -> TxnId {
        self.highest_txn_id + 1
    }

    pub fn was_clean(&self) -> bool {
        self.losers.is_empty() && self.redone == 0
    }
}

pub struct RecoveryManager {
    journal: Arc<Journal>,
    cache: Arc<PageCache>,
}

impl RecoveryManager {
    /// Every file the journal may reference must already be registered with
    /// `cache`.
    pub fn new(journal: Arc<Journal>, cache: Arc<PageCache>) -> Self {
        Self { journal, cache }
    }

    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let start = self.redo_start(&mut report)?;
        info!(%start, checkpoint = ?report.checkpoint, "recovery started");

        let mut reader = self.journal.read_from(start)?;
        let mut records = Vec::new();
        for entry in reader.by_ref() {
            records.push(entry?);
        }
        report.truncated_at = reader.truncated_at();
        report.scanned = records.len();

        // analysis
        let mut seen: BTreeSet<TxnId> = BTreeSet::new();
        let mut finished: BTreeSet<TxnId> = BTreeSet::new();
        for entry in &records {
            report.highest_txn_id = report.highest_txn_id.max(entry.txn_id);
            match &entry.kind {
                LogKind::Checkpoint { active, .. } => {
                    for (id, _) in active {
                        report.highest_txn_id = report.highest_txn_id.max(*id);
                    }
                }
                LogKind::TxnCommit | LogKind::TxnAbort => {
                    seen.insert(entry.txn_id);
                    finished.insert(entry.txn_id);
                }
                _ => {
                    seen.insert(entry.txn_id);
                }
            }
        }
        report.losers = seen.difference(&finished).copied().collect();

        // redo
        for entry in &records {
            if self.redo(entry)? {
                report.redone += 1;
            }
        }
        debug!(redone = report.redone, "redo pass complete");

        // undo
        if !report.losers.is_empty() {
            report.undone = self.undo_losers(&records, &report.losers)?;
        }

        self.journal.flush(true)?;
        self.cache.sync_all()?;
        self.journal.checkpoint(
            report.next_txn_id(),
            self.journal.next_lsn(),
            Vec::new(),
        )?;
        report.highest_txn_id += 1;
        info!(
            scanned = report.scanned,
            redone = report.redone,
            undone = report.undone,
            losers = report.losers.len(),
            "recovery finished"
        );
        Ok(report)
    }

    /// Where the scan starts: the redo point of the last checkpoint, or the
    /// oldest journal file when there is none.
    fn redo_start(&self, report: &mut RecoveryReport) -> Result<Lsn> {
        let checkpoint = self.journal.last_checkpoint();
        if checkpoint.is_valid() {
            match self.journal.read_at(checkpoint) {
                Ok(Loggable {
                    kind: LogKind::Checkpoint { redo_start, active },
                    txn_id,
                    ..
                }) => {
                    report.checkpoint = Some(checkpoint);
                    report.highest_txn_id = active
                        .iter()
                        .map(|(id, _)| *id)
                        .fold(txn_id, TxnId::max);
                    return Ok(if redo_start.is_valid() {
                        redo_start.min(checkpoint)
                    } else {
                        checkpoint
                    });
                }
                Ok(other) => {
                    warn!(%checkpoint, kind = other.kind.name(), "control file does not point at a checkpoint, scanning the whole journal");
                }
                Err(e) => {
                    warn!(%checkpoint, error = %e, "checkpoint record unreadable, scanning the whole journal");
                }
            }
        }
        let first = self.journal.files()?.first().copied().unwrap_or(1);
        Ok(Lsn::new(first, JOURNAL_HEADER_LEN))
    }

    /// Redo one record. An index page that no longer decodes marks its file
    /// unusable instead of stopping the database.
    fn redo(&self, entry: &Loggable) -> Result<bool> {
        if entry.kind.file().is_none() {
            return Ok(false);
        }
        match entry.redo(&self.cache) {
            Ok(()) => Ok(true),
            Err(Error::IndexCorruption { file, page, reason }) => {
                warn!(file, page, %reason, "index corrupt during redo, marking it unusable");
                if let Ok(slot) = self.cache.file(file) {
                    slot.mark_unusable();
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn undo_losers(&self, records: &[Loggable], losers: &[TxnId]) -> Result<usize> {
        let mut txns: HashMap<TxnId, Txn> = losers
            .iter()
            .map(|id| (*id, Txn::recovered(*id, Arc::clone(&self.journal))))
            .collect();
        // newest first across every loser
        let to_undo: BTreeMap<Lsn, &Loggable> = records
            .iter()
            .filter(|e| txns.contains_key(&e.txn_id))
            .filter_map(|e| e.lsn.map(|lsn| (lsn, e)))
            .collect();

        let mut undone = 0;
        for (lsn, entry) in to_undo.into_iter().rev() {
            if let Some(file) = entry.kind.file() {
                if self.cache.file(file).map_or(false, |s| s.is_unusable()) {
                    warn!(%lsn, file, "skipping undo against an unusable index");
                    continue;
                }
            }
            let Some(txn) = txns.get_mut(&entry.txn_id) else {
                continue;
            };
            entry.undo(&self.cache, txn).map_err(|e| {
                Error::from(RecoveryError::UndoFailed {
                    txn: entry.txn_id,
                    lsn,
                    reason: e.to_string(),
                })
            })?;
            undone += 1;
        }

        for id in losers {
            if let Some(txn) = txns.get_mut(id) {
                txn.log(LogKind::TxnAbort)?;
                debug!(txn = id, "loser rolled back");
            }
        }
        Ok(undone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::BTree;
    use crate::page_store::PageStore;
    use crate::test_util::Env;
    use crate::transaction::TransactionManager;
    use crate::wal::JournalOptions;

    /// Reopens journal and cache over the same directory, as after a crash.
    fn reopen(env: Env, files: &[&str]) -> (Env, RecoveryReport) {
        let Env { dir, journal, cache, tm } = env;
        drop(tm);
        drop(cache);
        drop(journal);
        let journal = Journal::open(dir.path().join("journal"), JournalOptions::default()).unwrap();
        let cache = Arc::new(PageCache::with_wal(256, journal.clone()));
        for name in files {
            PageStore::open(cache.clone(), dir.path().join(name)).unwrap();
        }
        let report = RecoveryManager::new(journal.clone(), cache.clone())
            .recover()
            .unwrap();
        let tm = TransactionManager::new(journal.clone(), cache.clone(), report.next_txn_id());
        (Env { dir, journal, cache, tm }, report)
    }

    #[test]
    fn test_committed_survive_and_losers_roll_back() {
        let env = Env::new();
        let tree = env.btree("idx.dbx", 1, 1024);

        let mut t1 = env.tm.begin().unwrap();
        for i in 0..200u32 {
            tree.insert(format!("a{i:04}").as_bytes(), b"committed", &mut t1).unwrap();
        }
        env.tm.commit(&mut t1).unwrap();

        let mut t2 = env.tm.begin().unwrap();
        for i in 0..200u32 {
            tree.insert(format!("b{i:04}").as_bytes(), b"lost", &mut t2).unwrap();
        }
        tree.remove(b"a0007", &mut t2).unwrap();
        env.journal.flush(true).unwrap();
        let loser = t2.id();
        drop(t2);
        drop(tree);

        let (env, report) = reopen(env, &["idx.dbx"]);
        assert_eq!(report.losers, vec![loser]);
        assert!(report.undone > 0);
        assert!(report.next_txn_id() > loser);

        let tree = BTree::attach(env.cache.clone(), 1).unwrap();
        assert_eq!(tree.len().unwrap(), 200);
        assert_eq!(tree.get(b"a0007").unwrap().as_deref(), Some(&b"committed"[..]));
        assert!(tree.get(b"b0000").unwrap().is_none());
        tree.verify().unwrap();
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let env = Env::new();
        let store = env.store("raw.dbx", 2);
        let mut txn = env.tm.begin().unwrap();
        let page = store.allocate_page(&mut txn).unwrap();
        store.write_page(page, b"durable", &mut txn).unwrap();
        env.tm.commit(&mut txn).unwrap();
        drop(store);

        let (env, first) = reopen(env, &["raw.dbx"]);
        assert!(first.losers.is_empty());
        let (env, second) = reopen(env, &["raw.dbx"]);
        assert!(second.was_clean());
        let store = PageStore::new(env.cache.clone(), 2).unwrap();
        assert_eq!(&store.read_page(page).unwrap()[..7], b"durable");
    }

    #[test]
    fn test_loser_allocation_returns_to_free_list() {
        let env = Env::new();
        let store = env.store("raw.dbx", 4);
        let mut setup = env.tm.begin().unwrap();
        let kept = store.allocate_page(&mut setup).unwrap();
        store.write_page(kept, b"kept", &mut setup).unwrap();
        env.tm.commit(&mut setup).unwrap();

        let mut loser = env.tm.begin().unwrap();
        let grown = store.allocate_page(&mut loser).unwrap();
        store.write_page(grown, b"lost", &mut loser).unwrap();
        store.free_page(kept, &mut loser).unwrap();
        env.journal.flush(true).unwrap();
        let loser_id = loser.id();
        drop(loser);
        drop(store);

        let (env, report) = reopen(env, &["raw.dbx"]);
        assert_eq!(report.losers, vec![loser_id]);
        let store = PageStore::new(env.cache.clone(), 4).unwrap();
        let header = store.header().unwrap();
        assert_eq!(header.free_list_head, grown);
        assert_eq!(&store.read_page(kept).unwrap()[..4], b"kept");

        let mut txn = env.tm.begin().unwrap();
        assert_eq!(store.allocate_page(&mut txn).unwrap(), grown);
        assert_eq!(store.header().unwrap().page_count, header.page_count);
        env.tm.commit(&mut txn).unwrap();
    }

    #[test]
    fn test_missing_file_refuses_start() {
        let env = Env::new();
        let store = env.store("raw.dbx", 3);
        let mut txn = env.tm.begin().unwrap();
        store.allocate_page(&mut txn).unwrap();
        env.tm.commit(&mut txn).unwrap();
        drop(store);

        let Env { dir, journal, cache, tm } = env;
        drop((tm, cache, journal));
        let journal = Journal::open(dir.path().join("journal"), JournalOptions::default()).unwrap();
        let cache = Arc::new(PageCache::with_wal(64, journal.clone()));
        let err = RecoveryManager::new(journal, cache).recover().unwrap_err();
        assert!(matches!(
            err,
            Error::Recovery(RecoveryError::MissingFile { file: 3, .. })
        ));
    }
}
