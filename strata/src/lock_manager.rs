//! Manages read/write locks on collections, documents and index files.
//!
//! Locks are reentrant per owner and a sole reader may upgrade to a write
//! lock. A read is granted whenever no other owner holds the write lock,
//! even if writers are waiting. Writers are served in arrival order once
//! all other holders have released. While an owner is blocked its request
//! is kept in a waits-for table that is checked for cycles on every wait.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::LockError;
use crate::{Error, Result};

pub type OwnerId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockResource {
    Collection(String),
    Document(String),
    BTree(String),
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockResource::Collection(uri) => write!(f, "collection {uri}"),
            LockResource::Document(uri) => write!(f, "document {uri}"),
            LockResource::BTree(name) => write!(f, "btree {name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Default)]
pub struct LockManagerOptions {
    /// Used by [`LockManager::acquire`]; `None` waits forever.
    pub default_timeout: Option<Duration>,
    /// Fail the requester with [`LockError::Deadlock`] instead of only
    /// reporting the cycle.
    pub fail_on_deadlock: bool,
}

#[derive(Debug)]
struct LockRequest {
    owner: OwnerId,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockQueue {
    queue: VecDeque<LockRequest>,
    /// Hold counts per reading owner.
    readers: HashMap<OwnerId, usize>,
    writer: Option<(OwnerId, usize)>,
}

impl LockQueue {
    fn holds_any(&self, owner: OwnerId) -> bool {
        self.readers.contains_key(&owner) || matches!(self.writer, Some((w, _)) if w == owner)
    }

    /// Owners whose locks conflict with `owner` taking `mode`.
    fn conflicting_holders(&self, owner: OwnerId, mode: LockMode) -> Vec<OwnerId> {
        let mut holders = Vec::new();
        if let Some((w, _)) = self.writer {
            if w != owner {
                holders.push(w);
            }
        }
        if mode == LockMode::Write {
            holders.extend(self.readers.keys().copied().filter(|r| *r != owner));
        }
        holders.sort_unstable();
        holders
    }

    fn can_grant(&self, owner: OwnerId, mode: LockMode) -> bool {
        if !self.conflicting_holders(owner, mode).is_empty() {
            return false;
        }
        if mode == LockMode::Read || self.holds_any(owner) {
            return true;
        }
        self.queue
            .iter()
            .find(|r| r.mode == LockMode::Write)
            .map_or(true, |r| r.owner == owner)
    }

    /// Who `owner` is waiting on: conflicting holders, or the writers
    /// queued ahead of it.
    fn blockers(&self, owner: OwnerId, mode: LockMode) -> Vec<OwnerId> {
        let holders = self.conflicting_holders(owner, mode);
        if !holders.is_empty() || mode == LockMode::Read {
            return holders;
        }
        let mut ahead: Vec<OwnerId> = self
            .queue
            .iter()
            .take_while(|r| r.owner != owner)
            .filter(|r| r.mode == LockMode::Write)
            .map(|r| r.owner)
            .collect();
        ahead.sort_unstable();
        ahead.dedup();
        ahead
    }

    fn grant(&mut self, owner: OwnerId, mode: LockMode) {
        match mode {
            LockMode::Read => *self.readers.entry(owner).or_default() += 1,
            LockMode::Write => match &mut self.writer {
                Some((w, count)) if *w == owner => *count += 1,
                _ => self.writer = Some((owner, 1)),
            },
        }
    }

    fn dequeue(&mut self, owner: OwnerId) {
        if let Some(pos) = self.queue.iter().position(|r| r.owner == owner) {
            self.queue.remove(pos);
        }
    }

    fn release(&mut self, owner: OwnerId, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => match self.readers.get_mut(&owner) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        self.readers.remove(&owner);
                    }
                    true
                }
                None => false,
            },
            LockMode::Write => match &mut self.writer {
                Some((w, count)) if *w == owner => {
                    *count -= 1;
                    if *count == 0 {
                        self.writer = None;
                    }
                    true
                }
                _ => false,
            },
        }
    }

    fn release_all(&mut self, owner: OwnerId) -> bool {
        let mut released = self.readers.remove(&owner).is_some();
        if matches!(self.writer, Some((w, _)) if w == owner) {
            self.writer = None;
            released = true;
        }
        released
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.readers.is_empty() && self.writer.is_none()
    }
}

#[derive(Debug, Default)]
struct WaitQueue {
    queue: Mutex<LockQueue>,
    cvar: Condvar,
}

/// A blocked request as shown in the wait graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitEntry {
    pub owner: OwnerId,
    pub thread: String,
    pub resource: LockResource,
    pub mode: LockMode,
    pub blocking_owners: Vec<OwnerId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldEntry {
    pub resource: LockResource,
    pub owner: OwnerId,
    pub mode: LockMode,
    pub count: usize,
}

/// Point-in-time snapshot of lock holders, waiters and waits-for cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitGraph {
    pub waiting: Vec<WaitEntry>,
    pub held: Vec<HeldEntry>,
    /// Each cycle starts at its smallest owner id.
    pub cycles: Vec<Vec<OwnerId>>,
}

impl WaitGraph {
    pub fn has_deadlock(&self) -> bool {
        !self.cycles.is_empty()
    }
}

struct LockManagerState {
    options: LockManagerOptions,
    table: Mutex<HashMap<LockResource, Arc<WaitQueue>>>,
    waits_for: Mutex<HashMap<OwnerId, WaitEntry>>,
}

/// Shared by every broker of a pool.
#[derive(Clone)]
pub struct LockManager {
    state: Arc<LockManagerState>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_options(LockManagerOptions::default())
    }

    pub fn with_options(options: LockManagerOptions) -> Self {
        Self {
            state: Arc::new(LockManagerState {
                options,
                table: Mutex::new(HashMap::new()),
                waits_for: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn options(&self) -> &LockManagerOptions {
        &self.state.options
    }

    /// Blocks until the lock is granted, or until the default timeout.
    pub fn acquire(&self, resource: LockResource, mode: LockMode, owner: OwnerId) -> Result<ManagedLock> {
        let timeout = self.state.options.default_timeout;
        self.try_acquire(resource, mode, owner, timeout)
    }

    /// Like [`acquire`](Self::acquire) with an explicit timeout.
    pub fn try_acquire(
        &self,
        resource: LockResource,
        mode: LockMode,
        owner: OwnerId,
        timeout: Option<Duration>,
    ) -> Result<ManagedLock> {
        self.lock(&resource, mode, owner, timeout)?;
        Ok(ManagedLock {
            manager: self.clone(),
            resource,
            mode,
            owner,
            held: true,
        })
    }

    fn queue_for(&self, resource: &LockResource) -> Arc<WaitQueue> {
        let mut table = self.state.table.lock();
        Arc::clone(table.entry(resource.clone()).or_default())
    }

    fn lock(
        &self,
        resource: &LockResource,
        mode: LockMode,
        owner: OwnerId,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let wait_queue = self.queue_for(resource);
        let mut queue = wait_queue.queue.lock();

        if queue.can_grant(owner, mode) {
            queue.grant(owner, mode);
            return Ok(());
        }

        queue.queue.push_back(LockRequest { owner, mode });
        let mut reported = false;
        loop {
            if queue.can_grant(owner, mode) {
                queue.dequeue(owner);
                queue.grant(owner, mode);
                self.state.waits_for.lock().remove(&owner);
                drop(queue);
                // the next reader in line may be grantable too
                wait_queue.cvar.notify_all();
                return Ok(());
            }

            let blockers = queue.blockers(owner, mode);
            if let Some(cycle) = self.record_wait(resource, mode, owner, blockers) {
                if !reported {
                    warn!(owner, %resource, ?mode, ?cycle, "deadlock detected");
                    reported = true;
                }
                if self.state.options.fail_on_deadlock {
                    self.abandon(&mut queue, owner);
                    drop(queue);
                    wait_queue.cvar.notify_all();
                    return Err(LockError::Deadlock {
                        owner,
                        resource: resource.clone(),
                    }
                    .into());
                }
            }

            match deadline {
                Some(deadline) => {
                    let timed_out = wait_queue.cvar.wait_until(&mut queue, deadline).timed_out();
                    if timed_out && !queue.can_grant(owner, mode) {
                        self.abandon(&mut queue, owner);
                        drop(queue);
                        wait_queue.cvar.notify_all();
                        debug!(owner, %resource, ?mode, "lock wait timed out");
                        return Err(Error::LockTimeout {
                            resource: resource.clone(),
                            mode,
                        });
                    }
                }
                None => wait_queue.cvar.wait(&mut queue),
            }
        }
    }

    fn abandon(&self, queue: &mut LockQueue, owner: OwnerId) {
        queue.dequeue(owner);
        self.state.waits_for.lock().remove(&owner);
    }

    /// Updates the waits-for entry of `owner`; returns the cycle through it, if any.
    fn record_wait(
        &self,
        resource: &LockResource,
        mode: LockMode,
        owner: OwnerId,
        blocking_owners: Vec<OwnerId>,
    ) -> Option<Vec<OwnerId>> {
        let mut waits_for = self.state.waits_for.lock();
        waits_for.insert(
            owner,
            WaitEntry {
                owner,
                thread: thread_label(),
                resource: resource.clone(),
                mode,
                blocking_owners,
            },
        );
        let graph = edges(&waits_for);
        find_cycle(owner, &graph)
    }

    /// Releases one hold; see also [`ManagedLock::release`].
    pub fn release(&self, lock: ManagedLock) -> Result<()> {
        lock.release()
    }

    /// Releases one hold of `mode` on `resource` by `owner`.
    pub fn unlock(&self, resource: &LockResource, mode: LockMode, owner: OwnerId) -> Result<()> {
        let not_held = || {
            Error::from(LockError::NotHeld {
                owner,
                resource: resource.clone(),
                mode,
            })
        };
        let wait_queue = self
            .state
            .table
            .lock()
            .get(resource)
            .cloned()
            .ok_or_else(not_held)?;
        let idle = {
            let mut queue = wait_queue.queue.lock();
            if !queue.release(owner, mode) {
                return Err(not_held());
            }
            queue.is_idle()
        };
        wait_queue.cvar.notify_all();
        drop(wait_queue);
        if idle {
            self.forget_if_idle(resource);
        }
        Ok(())
    }

    /// Drops every lock `owner` holds. Returns the number of resources released.
    pub fn release_all(&self, owner: OwnerId) -> usize {
        let queues: Vec<(LockResource, Arc<WaitQueue>)> = self
            .state
            .table
            .lock()
            .iter()
            .map(|(r, q)| (r.clone(), Arc::clone(q)))
            .collect();
        self.state.waits_for.lock().remove(&owner);

        let mut released = 0;
        let mut idle = Vec::new();
        for (resource, wait_queue) in queues {
            let mut queue = wait_queue.queue.lock();
            queue.dequeue(owner);
            if queue.release_all(owner) {
                released += 1;
            }
            if queue.is_idle() {
                idle.push(resource);
            }
            drop(queue);
            wait_queue.cvar.notify_all();
        }
        for resource in &idle {
            self.forget_if_idle(resource);
        }
        if released > 0 {
            debug!(owner, released, "released all locks");
        }
        released
    }

    /// Removes the table entry of an idle resource nobody else references.
    fn forget_if_idle(&self, resource: &LockResource) {
        let mut table = self.state.table.lock();
        let idle = table
            .get(resource)
            .is_some_and(|q| Arc::strong_count(q) == 1 && q.queue.lock().is_idle());
        if idle {
            table.remove(resource);
        }
    }

    pub fn is_locked_for_write(&self, resource: &LockResource) -> bool {
        self.with_queue(resource, |q| q.writer.is_some())
    }

    pub fn is_locked_for_read(&self, resource: &LockResource) -> bool {
        self.with_queue(resource, |q| !q.readers.is_empty())
    }

    /// Whether `owner` holds `resource` in `mode` (a write lock covers reads).
    pub fn holds(&self, owner: OwnerId, resource: &LockResource, mode: LockMode) -> bool {
        self.with_queue(resource, |q| {
            let writes = matches!(q.writer, Some((w, _)) if w == owner);
            match mode {
                LockMode::Write => writes,
                LockMode::Read => writes || q.readers.contains_key(&owner),
            }
        })
    }

    fn with_queue(&self, resource: &LockResource, f: impl FnOnce(&LockQueue) -> bool) -> bool {
        let wait_queue = self.state.table.lock().get(resource).cloned();
        wait_queue.is_some_and(|q| f(&q.queue.lock()))
    }

    /// Snapshot of holders, waiters and current waits-for cycles.
    pub fn deadlock_report(&self) -> WaitGraph {
        let mut waiting: Vec<WaitEntry> = self.state.waits_for.lock().values().cloned().collect();
        waiting.sort_by_key(|w| w.owner);

        let queues: Vec<(LockResource, Arc<WaitQueue>)> = self
            .state
            .table
            .lock()
            .iter()
            .map(|(r, q)| (r.clone(), Arc::clone(q)))
            .collect();
        let mut held = Vec::new();
        for (resource, wait_queue) in queues {
            let queue = wait_queue.queue.lock();
            if let Some((owner, count)) = queue.writer {
                held.push(HeldEntry {
                    resource: resource.clone(),
                    owner,
                    mode: LockMode::Write,
                    count,
                });
            }
            for (owner, count) in &queue.readers {
                held.push(HeldEntry {
                    resource: resource.clone(),
                    owner: *owner,
                    mode: LockMode::Read,
                    count: *count,
                });
            }
        }
        held.sort_by(|a, b| (&a.resource, a.owner).cmp(&(&b.resource, b.owner)));

        let graph: HashMap<OwnerId, Vec<OwnerId>> = waiting
            .iter()
            .map(|w| (w.owner, w.blocking_owners.clone()))
            .collect();
        let mut cycles: Vec<Vec<OwnerId>> = Vec::new();
        for w in &waiting {
            if let Some(cycle) = find_cycle(w.owner, &graph) {
                let cycle = normalize(cycle);
                if !cycles.contains(&cycle) {
                    cycles.push(cycle);
                }
            }
        }
        WaitGraph {
            waiting,
            held,
            cycles,
        }
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("options", &self.state.options)
            .field("resources", &self.state.table.lock().len())
            .finish()
    }
}

/// A granted lock, released when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ManagedLock {
    manager: LockManager,
    resource: LockResource,
    mode: LockMode,
    owner: OwnerId,
    held: bool,
}

impl ManagedLock {
    pub fn resource(&self) -> &LockResource {
        &self.resource
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn release(mut self) -> Result<()> {
        self.held = false;
        self.manager.unlock(&self.resource, self.mode, self.owner)
    }
}

impl Drop for ManagedLock {
    fn drop(&mut self) {
        if self.held {
            // already gone after release_all
            if let Err(e) = self.manager.unlock(&self.resource, self.mode, self.owner) {
                debug!(owner = self.owner, resource = %self.resource, error = %e, "lock already released");
            }
        }
    }
}

impl fmt::Debug for ManagedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedLock")
            .field("resource", &self.resource)
            .field("mode", &self.mode)
            .field("owner", &self.owner)
            .finish()
    }
}

fn thread_label() -> String {
    let current = thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

fn edges(waits_for: &HashMap<OwnerId, WaitEntry>) -> HashMap<OwnerId, Vec<OwnerId>> {
    waits_for
        .iter()
        .map(|(owner, entry)| (*owner, entry.blocking_owners.clone()))
        .collect()
}

/// Depth-first search for a waits-for path from `start` back to itself.
fn find_cycle(start: OwnerId, graph: &HashMap<OwnerId, Vec<OwnerId>>) -> Option<Vec<OwnerId>> {
    fn visit(
        node: OwnerId,
        start: OwnerId,
        graph: &HashMap<OwnerId, Vec<OwnerId>>,
        visited: &mut HashSet<OwnerId>,
        path: &mut Vec<OwnerId>,
    ) -> bool {
        path.push(node);
        for next in graph.get(&node).into_iter().flatten() {
            if *next == start {
                return true;
            }
            if visited.insert(*next) && visit(*next, start, graph, visited, path) {
                return true;
            }
        }
        path.pop();
        false
    }

    let mut visited = HashSet::from([start]);
    let mut path = Vec::new();
    visit(start, start, graph, &mut visited, &mut path).then_some(path)
}

fn normalize(mut cycle: Vec<OwnerId>) -> Vec<OwnerId> {
    if let Some(min_pos) = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, o)| **o)
        .map(|(i, _)| i)
    {
        cycle.rotate_left(min_pos);
    }
    cycle
}
