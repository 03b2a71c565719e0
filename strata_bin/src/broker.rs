//! Per-thread handles on the database.

use std::marker::PhantomData;
use std::sync::Arc;

use strata::{BTree, LockMode, LockResource, ManagedLock, OwnerId, Txn};
use tracing::{error, warn};

use crate::error::PoolResult;
use crate::pool::PoolInner;
use crate::system_task::SystemTask;

/// Slot index plus the generation it was handed out in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BrokerId {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

impl BrokerId {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// A broker borrowed from the pool. Returned when dropped; any locks its
/// owner still holds are released then.
pub struct Broker {
    pool: Arc<PoolInner>,
    id: BrokerId,
    owner: OwnerId,
    // bound to the thread that borrowed it
    _not_send: PhantomData<*const ()>,
}

impl Broker {
    pub(crate) fn new(pool: Arc<PoolInner>, id: BrokerId, owner: OwnerId) -> Self {
        Self {
            pool,
            id,
            owner,
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> BrokerId {
        self.id
    }

    /// Lock owner id used for every lock taken through this broker.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn begin(&self) -> PoolResult<Txn> {
        Ok(self.pool.tm.begin()?)
    }

    pub fn commit(&self, txn: &mut Txn) -> PoolResult<()> {
        self.pool.tm.commit(txn).map_err(|e| {
            if e.is_fatal() {
                error!(txn = txn.id(), error = %e, "commit failed, database is read-only");
            }
            e.into()
        })
    }

    pub fn abort(&self, txn: &mut Txn) -> PoolResult<()> {
        Ok(self.pool.tm.abort(txn)?)
    }

    pub fn btree(&self, name: &str) -> PoolResult<BTree> {
        self.pool.index(name)
    }

    /// Opens the index, creating its file on first use.
    pub fn create_btree(&self, name: &str) -> PoolResult<BTree> {
        self.pool.create_index(name)
    }

    pub fn lock_collection(&self, uri: &str, mode: LockMode) -> PoolResult<ManagedLock> {
        self.lock(LockResource::Collection(uri.to_string()), mode)
    }

    pub fn lock_document(&self, uri: &str, mode: LockMode) -> PoolResult<ManagedLock> {
        self.lock(LockResource::Document(uri.to_string()), mode)
    }

    pub fn lock_btree(&self, name: &str, mode: LockMode) -> PoolResult<ManagedLock> {
        self.lock(LockResource::BTree(name.to_string()), mode)
    }

    fn lock(&self, resource: LockResource, mode: LockMode) -> PoolResult<ManagedLock> {
        Ok(self.pool.locks.acquire(resource, mode, self.owner)?)
    }

    /// Runs `task` inside its own transaction: committed when the task
    /// succeeds, aborted when it fails.
    pub fn run_task(&self, task: &mut dyn SystemTask) -> PoolResult<()> {
        let mut txn = self.begin()?;
        match task.execute(self, &mut txn) {
            Ok(()) => self.commit(&mut txn),
            Err(e) => {
                warn!(task = task.name(), error = %e, "system task failed");
                if let Err(abort) = self.abort(&mut txn) {
                    error!(task = task.name(), error = %abort, "abort after failed system task failed");
                }
                Err(e)
            }
        }
    }

    pub(crate) fn pool(&self) -> &PoolInner {
        &self.pool
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.pool.release_broker(self.id);
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .finish()
    }
}
