//! Transaction management.
//!
//! A [`Txn`] collects the LSNs of the records it logs. Commit appends a commit
//! record and waits for it to be durable; abort walks the records backwards
//! and undoes each one, logging compensations as it goes.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::cache::PageCache;
use crate::failpoint;
use crate::loggable::{LogKind, Loggable};
use crate::wal::{Journal, Lsn};
use crate::{Error, Result, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

/// A unit of work against the storage core.
pub struct Txn {
    id: TxnId,
    state: TxnState,
    first_lsn: Lsn,
    lsns: Vec<Lsn>,
    journal: Arc<Journal>,
}

impl Txn {
    /// A handle for a transaction found unfinished by recovery.
    pub(crate) fn recovered(id: TxnId, journal: Arc<Journal>) -> Self {
        Self {
            id,
            state: TxnState::Aborting,
            first_lsn: Lsn::INVALID,
            lsns: Vec::new(),
            journal,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }

    /// LSNs of every record this transaction logged, oldest first.
    pub fn lsns(&self) -> &[Lsn] {
        &self.lsns
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// Appends a record on behalf of this transaction.
    pub fn log(&mut self, kind: LogKind) -> Result<Lsn> {
        match self.state {
            TxnState::Active | TxnState::Aborting => {}
            state => {
                return Err(Error::Transaction(format!(
                    "transaction {} cannot log in state {state:?}",
                    self.id
                )))
            }
        }
        let mut entry = Loggable::new(self.id, kind);
        let lsn = self.journal.append(&mut entry)?;
        if !self.first_lsn.is_valid() {
            self.first_lsn = lsn;
        }
        self.lsns.push(lsn);
        Ok(lsn)
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            warn!(txn = self.id, records = self.lsns.len(), "transaction dropped while active; recovery will roll it back");
        }
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("records", &self.lsns.len())
            .finish()
    }
}

struct TransactionManagerState {
    next_txn_id: AtomicI64,
    /// Active transactions and their first LSN (invalid until they log).
    active: Mutex<HashMap<TxnId, Lsn>>,
    /// Commits and aborts hold this shared; checkpoints take it exclusively.
    commit_gate: RwLock<()>,
    journal: Arc<Journal>,
    cache: Arc<PageCache>,
    read_only: AtomicBool,
    shut_down: AtomicBool,
}

/// The transaction manager. Designed to be shared across threads.
#[derive(Clone)]
pub struct TransactionManager {
    state: Arc<TransactionManagerState>,
}

impl TransactionManager {
    pub fn new(journal: Arc<Journal>, cache: Arc<PageCache>, next_txn_id: TxnId) -> Self {
        debug!(next_txn_id, "transaction manager initialised");
        Self {
            state: Arc::new(TransactionManagerState {
                next_txn_id: AtomicI64::new(next_txn_id.max(1)),
                active: Mutex::new(HashMap::new()),
                commit_gate: RwLock::new(()),
                journal,
                cache,
                read_only: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.state.journal
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.state.cache
    }

    /// Starts a transaction and logs its start record.
    pub fn begin(&self) -> Result<Txn> {
        if self.state.shut_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        if self.state.read_only.load(Ordering::Acquire) {
            return Err(Error::ReadOnly);
        }
        let id = self.state.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let mut txn = Txn {
            id,
            state: TxnState::Active,
            first_lsn: Lsn::INVALID,
            lsns: Vec::new(),
            journal: Arc::clone(&self.state.journal),
        };
        // registered before logging so a concurrent checkpoint keeps our records
        self.state.active.lock().insert(id, self.state.journal.next_lsn());
        if let Err(e) = txn.log(LogKind::TxnStart) {
            self.state.active.lock().remove(&id);
            txn.state = TxnState::Aborted;
            return Err(e);
        }
        self.state.active.lock().insert(id, txn.first_lsn);
        debug!(txn = id, "transaction started");
        Ok(txn)
    }

    /// Logs the commit record and waits until it is durable.
    ///
    /// If the commit record cannot be logged the transaction is rolled back,
    /// the database drops to read-only mode and a fatal error is returned.
    pub fn commit(&self, txn: &mut Txn) -> Result<()> {
        self.require_active(txn)?;
        let _gate = self.state.commit_gate.read();
        txn.state = TxnState::Committing;

        let logged = failpoint::maybe_fail("tm.commit.before_wal")
            .map_err(|e| Error::Transaction(e.to_string()))
            .and_then(|_| {
                let mut entry = Loggable::new(txn.id, LogKind::TxnCommit);
                let lsn = self.state.journal.append(&mut entry)?;
                txn.lsns.push(lsn);
                Ok(lsn)
            })
            .and_then(|lsn| self.state.journal.commit_flush(lsn));

        if let Err(e) = logged {
            error!(txn = txn.id, error = %e, "commit record could not be logged, rolling back");
            self.state.read_only.store(true, Ordering::Release);
            txn.state = TxnState::Aborting;
            match self.rollback(txn) {
                // without an end record recovery would undo the transaction again
                Ok(()) => {
                    let ended = txn
                        .log(LogKind::TxnAbort)
                        .and_then(|lsn| self.state.journal.flush_to(lsn, false));
                    if let Err(abort) = ended {
                        warn!(txn = txn.id, error = %abort, "abort record after failed commit not logged");
                    }
                }
                Err(undo) => {
                    error!(txn = txn.id, error = %undo, "rollback after failed commit also failed");
                }
            }
            txn.state = TxnState::Aborted;
            self.state.active.lock().remove(&txn.id);
            return Err(Error::Transaction(format!(
                "commit of transaction {} failed: {e}",
                txn.id
            )));
        }

        txn.state = TxnState::Committed;
        self.state.active.lock().remove(&txn.id);
        debug!(txn = txn.id, "transaction committed");
        Ok(())
    }

    /// Undoes every change of `txn` in reverse order and logs its abort.
    pub fn abort(&self, txn: &mut Txn) -> Result<()> {
        self.require_active(txn)?;
        let _gate = self.state.commit_gate.read();
        txn.state = TxnState::Aborting;
        let result = self.rollback(txn).and_then(|_| {
            let lsn = txn.log(LogKind::TxnAbort)?;
            self.state.journal.flush_to(lsn, false)
        });
        txn.state = TxnState::Aborted;
        self.state.active.lock().remove(&txn.id);
        match result {
            Ok(()) => {
                debug!(txn = txn.id, "transaction aborted");
                Ok(())
            }
            Err(e) => {
                error!(txn = txn.id, error = %e, "abort failed; recovery will finish the rollback");
                Err(Error::Transaction(format!(
                    "abort of transaction {} failed: {e}",
                    txn.id
                )))
            }
        }
    }

    fn rollback(&self, txn: &mut Txn) -> Result<()> {
        let lsns: Vec<Lsn> = txn.lsns.iter().rev().copied().collect();
        for lsn in lsns {
            let entry = self.state.journal.read_at(lsn)?;
            entry.undo(&self.state.cache, txn)?;
        }
        Ok(())
    }

    fn require_active(&self, txn: &Txn) -> Result<()> {
        if txn.state != TxnState::Active {
            return Err(Error::Transaction(format!(
                "transaction {} is {:?}",
                txn.id, txn.state
            )));
        }
        Ok(())
    }

    /// Flushes every dirty page and writes a checkpoint record.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let _gate = self.state.commit_gate.write();
        let before_sync = self.state.journal.next_lsn();
        self.state.journal.flush(true)?;
        self.state.cache.sync_all()?;

        let active = self.active_transactions();
        let redo_start = active
            .iter()
            .map(|(_, first)| *first)
            .filter(Lsn::is_valid)
            .fold(before_sync, Lsn::min);
        let id = self.state.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let lsn = self.state.journal.checkpoint(id, redo_start, active)?;
        debug!(%lsn, %redo_start, "checkpoint complete");
        Ok(lsn)
    }

    /// Active transactions and the LSN of their first record.
    pub fn active_transactions(&self) -> Vec<(TxnId, Lsn)> {
        let mut active: Vec<_> = self
            .state
            .active
            .lock()
            .iter()
            .map(|(id, lsn)| (*id, *lsn))
            .collect();
        active.sort_unstable();
        active
    }

    pub fn next_txn_id(&self) -> TxnId {
        self.state.next_txn_id.load(Ordering::SeqCst)
    }

    pub fn is_read_only(&self) -> bool {
        self.state.read_only.load(Ordering::Acquire)
    }

    pub fn set_read_only(&self, read_only: bool) {
        if self.state.read_only.swap(read_only, Ordering::AcqRel) != read_only {
            warn!(read_only, "transaction manager mode changed");
        }
    }

    /// Refuses new transactions from now on and, when nothing is left
    /// uncommitted, writes a final checkpoint so the next start has nothing
    /// to replay.
    pub fn shutdown(&self) -> Result<()> {
        if self.state.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let active = self.active_transactions();
        if !active.is_empty() {
            warn!(
                active = active.len(),
                "shutting down with uncommitted transactions; recovery will roll them back"
            );
            return Ok(());
        }
        if self.is_read_only() {
            return Ok(());
        }
        self.checkpoint().map(|_| ())
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.shut_down.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failpoint::FailpointGuard;
    use crate::test_util::Env;
    use serial_test::serial;

    #[test]
    fn test_begin_assigns_increasing_ids() {
        let env = Env::new();
        let mut a = env.tm.begin().unwrap();
        let mut b = env.tm.begin().unwrap();
        assert!(b.id() > a.id());
        assert_eq!(env.tm.active_transactions().len(), 2);
        env.tm.commit(&mut a).unwrap();
        env.tm.abort(&mut b).unwrap();
        assert!(env.tm.active_transactions().is_empty());
        assert_eq!(a.state(), TxnState::Committed);
        assert_eq!(b.state(), TxnState::Aborted);
    }

    #[test]
    fn test_finished_transaction_cannot_commit_again() {
        let env = Env::new();
        let mut txn = env.tm.begin().unwrap();
        env.tm.commit(&mut txn).unwrap();
        assert!(matches!(env.tm.commit(&mut txn), Err(Error::Transaction(_))));
        assert!(txn.log(LogKind::TxnStart).is_err());
    }

    #[test]
    fn test_read_only_and_shutdown_refuse_begin() {
        let env = Env::new();
        env.tm.set_read_only(true);
        assert!(matches!(env.tm.begin(), Err(Error::ReadOnly)));
        env.tm.set_read_only(false);
        env.tm.shutdown().unwrap();
        assert!(matches!(env.tm.begin(), Err(Error::Shutdown)));
        assert!(env.journal.last_checkpoint().is_valid());
    }

    #[test]
    #[serial]
    fn test_commit_log_failure_rolls_back() {
        let env = Env::new();
        let store = env.store("raw.dbx", 1);
        let mut setup = env.tm.begin().unwrap();
        let page = store.allocate_page(&mut setup).unwrap();
        store.write_page(page, b"before", &mut setup).unwrap();
        env.tm.commit(&mut setup).unwrap();

        let mut txn = env.tm.begin().unwrap();
        store.write_page(page, b"after!", &mut txn).unwrap();
        {
            let _fp = FailpointGuard::new("tm.commit.before_wal");
            let err = env.tm.commit(&mut txn).unwrap_err();
            assert!(err.is_fatal());
        }
        assert_eq!(txn.state(), TxnState::Aborted);
        assert!(env.tm.is_read_only());
        assert_eq!(&store.read_page(page).unwrap()[..6], b"before");

        // the rollback is closed by an abort record, so recovery skips it
        let last = env
            .journal
            .read_from(Lsn::INVALID)
            .unwrap()
            .map(|r| r.unwrap())
            .filter(|r| r.txn_id == txn.id())
            .last()
            .unwrap();
        assert_eq!(last.kind, LogKind::TxnAbort);
    }

    #[test]
    #[serial]
    fn test_journal_write_failure_makes_database_read_only() {
        let env = Env::new();
        let store = env.store("raw.dbx", 1);
        let mut setup = env.tm.begin().unwrap();
        let page = store.allocate_page(&mut setup).unwrap();
        env.tm.commit(&mut setup).unwrap();

        let mut txn = env.tm.begin().unwrap();
        store.write_page(page, b"after!", &mut txn).unwrap();
        {
            let _fp = FailpointGuard::new("journal.write");
            let err = env.tm.commit(&mut txn).unwrap_err();
            assert!(err.is_fatal());
        }
        assert_eq!(txn.state(), TxnState::Aborted);
        assert!(env.tm.is_read_only());
        assert!(matches!(env.tm.begin(), Err(Error::ReadOnly)));
        // the journal stays failed once the failpoint is gone
        let mut entry = Loggable::new(txn.id(), LogKind::TxnStart);
        assert!(matches!(
            env.journal.append(&mut entry),
            Err(Error::Log(crate::error::LogError::Failed))
        ));
    }

    #[test]
    #[serial]
    fn test_journal_append_failure_reaches_the_caller() {
        let env = Env::new();
        let store = env.store("raw.dbx", 1);
        let mut setup = env.tm.begin().unwrap();
        let page = store.allocate_page(&mut setup).unwrap();
        env.tm.commit(&mut setup).unwrap();

        let mut txn = env.tm.begin().unwrap();
        {
            let _fp = FailpointGuard::new("journal.append");
            assert!(matches!(
                store.write_page(page, b"lost", &mut txn),
                Err(Error::Log(_))
            ));
            assert!(matches!(env.tm.begin(), Err(Error::Log(_))));
        }
        // nothing was applied without its record
        assert!(store.read_page(page).unwrap().iter().all(|b| *b == 0));
        assert_eq!(env.tm.active_transactions().len(), 1);
        env.tm.abort(&mut txn).unwrap();
        assert!(!env.tm.is_read_only());
    }

    #[test]
    #[serial]
    fn test_write_back_failure_fails_checkpoint_until_cleared() {
        let env = Env::new();
        let store = env.store("raw.dbx", 1);
        let mut txn = env.tm.begin().unwrap();
        let page = store.allocate_page(&mut txn).unwrap();
        store.write_page(page, b"payload", &mut txn).unwrap();
        env.tm.commit(&mut txn).unwrap();

        for point in ["cache.write_back", "pager.write"] {
            {
                let _fp = FailpointGuard::new(point);
                assert!(matches!(env.tm.checkpoint(), Err(Error::StorageFault { .. })));
            }
            assert!(env.cache.stats().dirty > 0, "{point} dropped a dirty page");
        }
        env.tm.checkpoint().unwrap();
        assert_eq!(env.cache.stats().dirty, 0);
        let mut pager = crate::pager::Pager::open(store.slot().path()).unwrap();
        assert_eq!(&pager.read_page(page).unwrap().body()[..7], b"payload");
    }

    #[test]
    fn test_checkpoint_keeps_records_of_active_transactions() {
        let env = Env::new();
        let mut open = env.tm.begin().unwrap();
        let first = open.first_lsn();
        env.tm.journal().rotate().unwrap();
        env.tm.checkpoint().unwrap();
        // the file holding the open transaction's start record survives
        assert!(env.tm.journal().files().unwrap().contains(&first.file));
        env.tm.commit(&mut open).unwrap();
        env.tm.journal().rotate().unwrap();
        env.tm.checkpoint().unwrap();
        assert!(!env.tm.journal().files().unwrap().contains(&first.file));
    }
}
