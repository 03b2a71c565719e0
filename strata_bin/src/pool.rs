//! The broker pool: opens the storage components, runs recovery and hands
//! out one broker per thread.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use strata::{
    BTree, CacheStats, FileId, Journal, LockManager, Lsn, PageCache, RecoveryManager,
    RecoveryReport, TransactionManager, TxnId, WaitGraph,
};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerId};
use crate::config::DatabaseConfig;
use crate::error::{PoolError, PoolResult};
use crate::system_task::{Scheduler, SyncTask};

const INDEX_SUFFIX: &str = "dbx";

#[derive(Debug)]
struct ActiveBroker {
    thread: ThreadId,
    /// Nested `get_broker` calls from the same thread.
    refs: usize,
    owner: strata::OwnerId,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    active: Option<ActiveBroker>,
}

#[derive(Debug, Default)]
struct BrokerSlots {
    slots: Vec<Slot>,
    by_thread: HashMap<ThreadId, usize>,
}

impl BrokerSlots {
    fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.active.is_some()).count()
    }
}

pub(crate) struct PoolInner {
    pub(crate) config: DatabaseConfig,
    pub(crate) journal: Arc<Journal>,
    pub(crate) cache: Arc<PageCache>,
    pub(crate) tm: TransactionManager,
    pub(crate) locks: LockManager,
    indexes: RwLock<HashMap<String, BTree>>,
    next_file_id: Mutex<FileId>,
    slots: Mutex<BrokerSlots>,
    slot_freed: Condvar,
    next_owner: AtomicU64,
    min_free_space: AtomicU64,
    /// Read-only mode was entered because of low disk space.
    space_read_only: AtomicBool,
    shut_down: AtomicBool,
    recovery: RecoveryReport,
}

impl PoolInner {
    pub(crate) fn index(&self, name: &str) -> PoolResult<BTree> {
        self.indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::UnknownIndex(name.to_string()))
    }

    pub(crate) fn create_index(&self, name: &str) -> PoolResult<BTree> {
        let mut indexes = self.indexes.write();
        if let Some(tree) = indexes.get(name) {
            return Ok(tree.clone());
        }
        let file_id = {
            let mut next = self.next_file_id.lock();
            let id = *next;
            *next = next.checked_add(1).ok_or_else(|| {
                PoolError::Config("no file ids left for a new index".into())
            })?;
            id
        };
        let tree = BTree::create(
            Arc::clone(&self.cache),
            self.config.data_dir.join(name),
            file_id,
            self.config.page_size,
        )?;
        info!(name, file_id, "created index");
        indexes.insert(name.to_string(), tree.clone());
        Ok(tree)
    }

    pub(crate) fn release_broker(&self, id: BrokerId) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.slots.get_mut(id.index) else {
            return;
        };
        if slot.generation != id.generation {
            warn!(?id, "stale broker handle returned");
            return;
        }
        let Some(active) = slot.active.as_mut() else {
            return;
        };
        active.refs -= 1;
        if active.refs > 0 {
            return;
        }
        let owner = active.owner;
        let thread = active.thread;
        slot.active = None;
        slots.by_thread.remove(&thread);
        drop(slots);

        let released = self.locks.release_all(owner);
        if released > 0 {
            warn!(owner, released, "broker returned while still holding locks");
        }
        self.slot_freed.notify_one();
    }

    /// Writes back dirty pages; a major sync also checkpoints and checks
    /// free disk space.
    pub(crate) fn sync(&self, task: SyncTask) -> strata::Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Ok(());
        }
        match task {
            SyncTask::Minor => {
                self.cache.sync_all()?;
                debug!("minor sync complete");
            }
            SyncTask::Major => {
                self.check_disk_space();
                if self.tm.is_read_only() {
                    self.cache.sync_all()?;
                } else {
                    // a checkpoint also writes back every dirty page
                    self.tm.checkpoint()?;
                }
                debug!("major sync complete");
            }
        }
        Ok(())
    }

    /// Switches to read-only below the configured free space and back
    /// once space is available again.
    pub(crate) fn check_disk_space(&self) -> bool {
        let min = self.min_free_space.load(Ordering::Acquire);
        let dirs = [self.config.data_dir.clone(), self.config.journal_dir()];
        let available = dirs
            .iter()
            .filter_map(|dir| match fs2::available_space(dir) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(dir = ?dir, error = %e, "cannot determine free disk space");
                    None
                }
            })
            .min();
        let Some(available) = available else {
            return true;
        };
        if available < min {
            if !self.space_read_only.swap(true, Ordering::AcqRel) {
                error!(available, min, "disk space below minimum, switching to read-only mode");
                self.tm.set_read_only(true);
            }
            false
        } else {
            if self.space_read_only.swap(false, Ordering::AcqRel) {
                info!(available, "disk space available again, leaving read-only mode");
                self.tm.set_read_only(false);
            }
            true
        }
    }
}

/// Snapshot returned by [`BrokerPool::status`].
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub cache: CacheStats,
    pub active_transactions: Vec<(TxnId, Lsn)>,
    pub read_only: bool,
    pub active_brokers: usize,
    pub max_brokers: usize,
    pub indexes: Vec<String>,
    pub last_checkpoint: Lsn,
    pub journal_files: Vec<u32>,
    pub locks: WaitGraph,
}

/// Composition root of a database.
///
/// Dropping the pool without [`shutdown`](Self::shutdown) stops the
/// background tasks but writes nothing back, like a crash; the next open
/// recovers from the journal.
pub struct BrokerPool {
    inner: Arc<PoolInner>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl BrokerPool {
    pub fn open(config: DatabaseConfig) -> PoolResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        let journal_dir = config.journal_dir();
        fs::create_dir_all(&journal_dir)?;

        let journal = Journal::open(&journal_dir, config.journal_options())?;
        let cache = Arc::new(PageCache::with_wal(
            config.cache.capacity_pages,
            journal.clone(),
        ));

        let mut indexes = HashMap::new();
        let mut max_file_id: FileId = 0;
        for path in index_files(&config.data_dir)? {
            let tree = BTree::open(Arc::clone(&cache), &path)?;
            max_file_id = max_file_id.max(tree.file_id());
            debug!(name = tree.name(), file_id = tree.file_id(), "opened index");
            indexes.insert(tree.name().to_string(), tree);
        }

        let report = RecoveryManager::new(journal.clone(), Arc::clone(&cache)).recover()?;
        if !report.was_clean() {
            info!(
                redone = report.redone,
                undone = report.undone,
                losers = report.losers.len(),
                "database recovered from an unclean shutdown"
            );
        }
        let tm = TransactionManager::new(journal.clone(), Arc::clone(&cache), report.next_txn_id());
        let locks = LockManager::with_options(config.lock_options());

        let inner = Arc::new(PoolInner {
            min_free_space: AtomicU64::new(config.sync.min_free_space),
            config,
            journal,
            cache,
            tm,
            locks,
            indexes: RwLock::new(indexes),
            next_file_id: Mutex::new(max_file_id + 1),
            slots: Mutex::new(BrokerSlots::default()),
            slot_freed: Condvar::new(),
            next_owner: AtomicU64::new(1),
            space_read_only: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            recovery: report,
        });

        for name in inner.config.core_files.clone() {
            inner.create_index(&name)?;
        }
        inner.check_disk_space();

        let scheduler = Scheduler::start(
            Arc::downgrade(&inner),
            inner.config.sync_period(),
            inner.config.major_sync_period(),
        )?;
        info!(
            data_dir = ?inner.config.data_dir,
            indexes = inner.indexes.read().len(),
            max_brokers = inner.config.max_brokers,
            "broker pool opened"
        );
        Ok(Self {
            inner,
            scheduler: Mutex::new(Some(scheduler)),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.inner.recovery
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.inner.tm
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.inner.locks
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.inner.cache
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.inner.journal
    }

    /// The calling thread's broker. A thread that already holds one gets the
    /// same broker again; otherwise waits up to the configured timeout for a
    /// free slot.
    pub fn get_broker(&self) -> PoolResult<Broker> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(strata::Error::Shutdown.into());
        }
        let thread = thread::current().id();
        let timeout = self.inner.config.broker_timeout();
        let deadline = Instant::now() + timeout;
        let max = self.inner.config.max_brokers;

        let mut slots = self.inner.slots.lock();
        if let Some(&index) = slots.by_thread.get(&thread) {
            let slot = &mut slots.slots[index];
            if let Some(active) = slot.active.as_mut() {
                active.refs += 1;
                let id = BrokerId::new(index, slot.generation);
                let owner = active.owner;
                return Ok(Broker::new(Arc::clone(&self.inner), id, owner));
            }
        }

        loop {
            let free = slots.slots.iter().position(|s| s.active.is_none());
            let index = match free {
                Some(index) => Some(index),
                None if slots.slots.len() < max => {
                    slots.slots.push(Slot::default());
                    Some(slots.slots.len() - 1)
                }
                None => None,
            };
            if let Some(index) = index {
                let owner = self.inner.next_owner.fetch_add(1, Ordering::Relaxed);
                let slot = &mut slots.slots[index];
                slot.generation = slot.generation.wrapping_add(1);
                slot.active = Some(ActiveBroker {
                    thread,
                    refs: 1,
                    owner,
                });
                let id = BrokerId::new(index, slot.generation);
                slots.by_thread.insert(thread, index);
                debug!(?id, owner, "broker handed out");
                return Ok(Broker::new(Arc::clone(&self.inner), id, owner));
            }
            if self
                .inner
                .slot_freed
                .wait_until(&mut slots, deadline)
                .timed_out()
                && slots.slots.iter().all(|s| s.active.is_some())
            {
                return Err(PoolError::PoolExhausted {
                    max,
                    waited: timeout,
                });
            }
        }
    }

    pub fn active_brokers(&self) -> usize {
        self.inner.slots.lock().active()
    }

    pub fn index(&self, name: &str) -> PoolResult<BTree> {
        self.inner.index(name)
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.indexes.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Runs a sync now instead of waiting for the scheduler.
    pub fn sync(&self, task: SyncTask) -> PoolResult<()> {
        Ok(self.inner.sync(task)?)
    }

    pub fn checkpoint(&self) -> PoolResult<Lsn> {
        Ok(self.inner.tm.checkpoint()?)
    }

    /// Re-evaluates free disk space against `min_free_space` bytes.
    /// Returns false when the pool is now read-only for lack of space.
    pub fn set_min_free_space(&self, bytes: u64) -> bool {
        self.inner.min_free_space.store(bytes, Ordering::Release);
        self.inner.check_disk_space()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.tm.is_read_only()
    }

    pub fn status(&self) -> PoolResult<PoolStatus> {
        Ok(PoolStatus {
            cache: self.inner.cache.stats(),
            active_transactions: self.inner.tm.active_transactions(),
            read_only: self.inner.tm.is_read_only(),
            active_brokers: self.active_brokers(),
            max_brokers: self.inner.config.max_brokers,
            indexes: self.index_names(),
            last_checkpoint: self.inner.journal.last_checkpoint(),
            journal_files: self.inner.journal.files()?,
            locks: self.inner.locks.deadlock_report(),
        })
    }

    /// Stops the scheduler, writes a final checkpoint when nothing is left
    /// uncommitted, writes back every page and closes the journal.
    pub fn shutdown(&self) -> PoolResult<()> {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let active = self.active_brokers();
        if active > 0 {
            warn!(active, "shutting down with brokers still in use");
        }
        self.inner.tm.shutdown()?;
        self.inner.cache.sync_all()?;
        self.inner.journal.close()?;
        info!("broker pool shut down");
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for BrokerPool {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.get_mut().take() {
            scheduler.stop();
        }
        if !self.is_shut_down() {
            warn!("broker pool dropped without shutdown; the next open will recover");
        }
    }
}

/// `*.dbx` files directly inside `dir`, sorted by name.
fn index_files(dir: &Path) -> PoolResult<Vec<std::path::PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == INDEX_SUFFIX) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
