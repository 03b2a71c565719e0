//! Periodic maintenance run by the broker pool.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use strata::Txn;
use tracing::{debug, error};

use crate::broker::Broker;
use crate::error::PoolResult;
use crate::pool::PoolInner;

/// Work the pool runs on behalf of the database rather than a client.
pub trait SystemTask: Send {
    fn name(&self) -> &str;

    fn execute(&mut self, broker: &Broker, txn: &mut Txn) -> PoolResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTask {
    /// Write back dirty cache pages.
    Minor,
    /// Minor sync plus checkpoint and disk-space check.
    Major,
}

impl SystemTask for SyncTask {
    fn name(&self) -> &str {
        match self {
            SyncTask::Minor => "minor-sync",
            SyncTask::Major => "major-sync",
        }
    }

    fn execute(&mut self, broker: &Broker, _txn: &mut Txn) -> PoolResult<()> {
        Ok(broker.pool().sync(*self)?)
    }
}

/// Background thread running minor and major syncs at fixed periods. It
/// holds only a weak reference, so it never keeps a dropped pool alive.
pub(crate) struct Scheduler {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub(crate) fn start(pool: Weak<PoolInner>, minor: Duration, major: Duration) -> std::io::Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("strata-sync".into())
            .spawn(move || run(pool, signal, minor, major))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("sync scheduler panicked");
            }
        }
    }

    fn signal_stop(&self) {
        let (flag, cvar) = &*self.stop;
        *flag.lock() = true;
        cvar.notify_all();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

fn run(pool: Weak<PoolInner>, stop: Arc<(Mutex<bool>, Condvar)>, minor: Duration, major: Duration) {
    let (flag, cvar) = &*stop;
    let mut next_minor = Instant::now() + minor;
    let mut next_major = Instant::now() + major;
    loop {
        let wake = next_minor.min(next_major);
        {
            let mut stopped = flag.lock();
            while !*stopped && Instant::now() < wake {
                cvar.wait_until(&mut stopped, wake);
            }
            if *stopped {
                break;
            }
        }
        let Some(pool) = pool.upgrade() else {
            break;
        };
        let now = Instant::now();
        let task = if now >= next_major {
            next_major = now + major;
            next_minor = now + minor;
            SyncTask::Major
        } else {
            next_minor = now + minor;
            SyncTask::Minor
        };
        if let Err(e) = pool.sync(task) {
            error!(task = ?task, error = %e, "scheduled sync failed");
        }
    }
    debug!("sync scheduler stopped");
}
