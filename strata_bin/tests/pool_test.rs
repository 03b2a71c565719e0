use std::path::Path;
use std::thread;
use std::time::Duration;

use serial_test::serial;
use strata::{KeyRange, LockMode, LockResource};
use strata_bin::{BrokerPool, DatabaseConfig, PoolError, SyncTask, SystemTask, CONFIG_ENV, DATA_DIR_ENV};
use tempfile::tempdir;

fn config(dir: &Path) -> DatabaseConfig {
    DatabaseConfig::new(dir)
        .with_page_size(1024)
        .with_cache_capacity(64)
        .with_min_free_space(0)
        .with_broker_timeout(Duration::from_millis(100))
        .with_lock_timeout(Some(Duration::from_millis(200)))
}

fn key(i: u32) -> Vec<u8> {
    format!("doc{i:05}").into_bytes()
}

#[test]
fn test_open_creates_core_files() {
    let dir = tempdir().unwrap();
    let pool = BrokerPool::open(config(dir.path())).unwrap();
    assert_eq!(
        pool.index_names(),
        vec!["collections.dbx", "dom.dbx", "structure.dbx", "values.dbx"]
    );
    for name in pool.index_names() {
        assert!(dir.path().join(&name).is_file());
    }
    assert!(pool.recovery_report().was_clean());
    pool.shutdown().unwrap();
    assert!(pool.is_shut_down());
    assert!(matches!(
        pool.get_broker(),
        Err(PoolError::Storage(strata::Error::Shutdown))
    ));
}

#[test]
fn test_same_thread_gets_same_broker() {
    let dir = tempdir().unwrap();
    let pool = BrokerPool::open(config(dir.path())).unwrap();

    let outer = pool.get_broker().unwrap();
    let first_owner = outer.owner();
    let inner = pool.get_broker().unwrap();
    assert_eq!(outer.id(), inner.id());
    assert_eq!(outer.owner(), inner.owner());
    assert_eq!(pool.active_brokers(), 1);

    drop(inner);
    assert_eq!(pool.active_brokers(), 1);
    drop(outer);
    assert_eq!(pool.active_brokers(), 0);

    // a fresh borrow gets a new lock owner
    let again = pool.get_broker().unwrap();
    assert_ne!(again.owner(), first_owner);
    drop(again);
    pool.shutdown().unwrap();
}

#[test]
fn test_pool_exhausted_when_all_brokers_busy() {
    let dir = tempdir().unwrap();
    let pool = BrokerPool::open(config(dir.path()).with_max_brokers(1)).unwrap();
    let held = pool.get_broker().unwrap();

    thread::scope(|s| {
        let result = s.spawn(|| pool.get_broker().map(|b| b.id())).join().unwrap();
        assert!(matches!(result, Err(PoolError::PoolExhausted { max: 1, .. })));
    });

    drop(held);
    thread::scope(|s| {
        assert!(s.spawn(|| pool.get_broker().map(|b| b.id())).join().unwrap().is_ok());
    });
    pool.shutdown().unwrap();
}

#[test]
fn test_waiting_thread_gets_released_broker() {
    let dir = tempdir().unwrap();
    let pool = BrokerPool::open(
        config(dir.path())
            .with_max_brokers(1)
            .with_broker_timeout(Duration::from_secs(5)),
    )
    .unwrap();
    let held = pool.get_broker().unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| pool.get_broker().map(|b| b.owner()));
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap().is_ok());
    });
    pool.shutdown().unwrap();
}

#[test]
fn test_returning_broker_releases_its_locks() {
    let dir = tempdir().unwrap();
    let pool = BrokerPool::open(config(dir.path())).unwrap();
    let resource = LockResource::Document("/db/letters/a.xml".into());

    let broker = pool.get_broker().unwrap();
    let lock = broker.lock_document("/db/letters/a.xml", LockMode::Write).unwrap();
    // the guard is leaked so only the broker return can release it
    std::mem::forget(lock);
    assert!(pool.lock_manager().is_locked_for_write(&resource));
    drop(broker);
    assert!(!pool.lock_manager().is_locked_for_write(&resource));

    thread::scope(|s| {
        s.spawn(|| {
            let other = pool.get_broker().unwrap();
            let lock = other.lock_document("/db/letters/a.xml", LockMode::Write).unwrap();
            lock.release().unwrap();
        });
    });
    pool.shutdown().unwrap();
}

#[test]
fn test_brokers_on_two_threads_contend_for_document_lock() {
    let dir = tempdir().unwrap();
    let pool = BrokerPool::open(config(dir.path()).with_lock_timeout(None)).unwrap();
    {
        let broker = pool.get_broker().unwrap();
        let tree = broker.btree("values.dbx").unwrap();
        let mut txn = broker.begin().unwrap();
        tree.insert(b"counter", &0u32.to_be_bytes(), &mut txn).unwrap();
        broker.commit(&mut txn).unwrap();
    }

    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                let broker = pool.get_broker().unwrap();
                let tree = broker.btree("values.dbx").unwrap();
                for _ in 0..50 {
                    let _lock = broker.lock_document("counter", LockMode::Write).unwrap();
                    let mut txn = broker.begin().unwrap();
                    let old = tree.remove(b"counter", &mut txn).unwrap().unwrap();
                    let n = u32::from_be_bytes(old.try_into().unwrap()) + 1;
                    tree.insert(b"counter", &n.to_be_bytes(), &mut txn).unwrap();
                    broker.commit(&mut txn).unwrap();
                }
            });
        }
    });

    let tree = pool.index("values.dbx").unwrap();
    assert_eq!(tree.get(b"counter").unwrap(), Some(100u32.to_be_bytes().to_vec()));
    assert!(pool.lock_manager().deadlock_report().held.is_empty());
    pool.shutdown().unwrap();
}

#[test]
fn test_create_btree_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let pool = BrokerPool::open(config(dir.path())).unwrap();
        let broker = pool.get_broker().unwrap();
        let tree = broker.create_btree("names.dbx").unwrap();
        assert!(tree.file_id() > pool.index("values.dbx").unwrap().file_id());
        let mut txn = broker.begin().unwrap();
        for i in 0..100 {
            tree.insert(&key(i), b"name", &mut txn).unwrap();
        }
        broker.commit(&mut txn).unwrap();
        drop(broker);
        pool.shutdown().unwrap();
    }

    let pool = BrokerPool::open(config(dir.path())).unwrap();
    assert!(pool.recovery_report().was_clean());
    let tree = pool.index("names.dbx").unwrap();
    assert_eq!(tree.len().unwrap(), 100);
    assert!(matches!(pool.index("missing.dbx"), Err(PoolError::UnknownIndex(_))));
    pool.shutdown().unwrap();
}

#[test]
fn test_drop_without_shutdown_recovers_on_open() {
    let dir = tempdir().unwrap();
    {
        let pool = BrokerPool::open(config(dir.path())).unwrap();
        let broker = pool.get_broker().unwrap();
        let tree = broker.btree("dom.dbx").unwrap();

        let mut committed = broker.begin().unwrap();
        for i in 0..200 {
            tree.insert(&key(i), b"kept", &mut committed).unwrap();
        }
        broker.commit(&mut committed).unwrap();

        let mut loser = broker.begin().unwrap();
        for i in 200..400 {
            tree.insert(&key(i), b"lost", &mut loser).unwrap();
        }
        pool.journal().flush(true).unwrap();
        drop(loser);
        drop(broker);
        // no shutdown: the pool goes away like a crashed process
    }

    let pool = BrokerPool::open(config(dir.path())).unwrap();
    let report = pool.recovery_report();
    assert!(!report.was_clean());
    assert_eq!(report.losers.len(), 1);

    let tree = pool.index("dom.dbx").unwrap();
    let entries: Vec<_> = tree
        .range_scan(KeyRange::all())
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(entries.len(), 200);
    assert!(entries.iter().all(|(_, v)| v == b"kept"));
    tree.verify().unwrap();

    // transaction ids keep increasing past the recovered ones
    let broker = pool.get_broker().unwrap();
    let txn = broker.begin().unwrap();
    assert!(txn.id() > report.losers[0]);
    drop(txn);
    drop(broker);
    pool.shutdown().unwrap();
}

#[test]
fn test_low_disk_space_switches_to_read_only() {
    let dir = tempdir().unwrap();
    let pool = BrokerPool::open(config(dir.path())).unwrap();
    let broker = pool.get_broker().unwrap();

    assert!(!pool.set_min_free_space(u64::MAX));
    assert!(pool.is_read_only());
    assert!(matches!(
        broker.begin(),
        Err(PoolError::Storage(strata::Error::ReadOnly))
    ));
    // a major sync still writes back pages while read-only
    pool.sync(SyncTask::Major).unwrap();

    assert!(pool.set_min_free_space(0));
    assert!(!pool.is_read_only());
    let mut txn = broker.begin().unwrap();
    broker.commit(&mut txn).unwrap();
    drop(broker);
    pool.shutdown().unwrap();
}

#[test]
fn test_system_task_runs_in_own_transaction() {
    struct Seed {
        rows: u32,
    }

    impl SystemTask for Seed {
        fn name(&self) -> &str {
            "seed"
        }

        fn execute(&mut self, broker: &strata_bin::Broker, txn: &mut strata::Txn) -> strata_bin::PoolResult<()> {
            let tree = broker.btree("structure.dbx")?;
            for i in 0..self.rows {
                tree.insert(&key(i), b"seeded", txn)?;
            }
            if self.rows > 10 {
                return Err(PoolError::Config("too many rows".into()));
            }
            Ok(())
        }
    }

    let dir = tempdir().unwrap();
    let pool = BrokerPool::open(config(dir.path())).unwrap();
    let broker = pool.get_broker().unwrap();
    let tree = pool.index("structure.dbx").unwrap();

    broker.run_task(&mut Seed { rows: 5 }).unwrap();
    assert_eq!(tree.len().unwrap(), 5);

    // a failing task is rolled back as a whole
    assert!(broker.run_task(&mut Seed { rows: 20 }).is_err());
    assert_eq!(tree.len().unwrap(), 5);

    let before = pool.journal().last_checkpoint();
    broker.run_task(&mut SyncTask::Major).unwrap();
    assert!(pool.journal().last_checkpoint() > before);
    broker.run_task(&mut SyncTask::Minor).unwrap();
    assert!(pool.transaction_manager().active_transactions().is_empty());

    drop(broker);
    pool.shutdown().unwrap();
}

#[test]
fn test_scheduler_checkpoints_in_background() {
    let dir = tempdir().unwrap();
    let pool = BrokerPool::open(
        config(dir.path()).with_sync_periods(Duration::from_millis(20), Duration::from_millis(60)),
    )
    .unwrap();
    let before = pool.journal().last_checkpoint();
    {
        let broker = pool.get_broker().unwrap();
        let tree = broker.btree("values.dbx").unwrap();
        let mut txn = broker.begin().unwrap();
        tree.insert(b"k", b"v", &mut txn).unwrap();
        broker.commit(&mut txn).unwrap();
    }
    let mut waited = Duration::ZERO;
    while pool.journal().last_checkpoint() <= before && waited < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(20));
        waited += Duration::from_millis(20);
    }
    assert!(pool.journal().last_checkpoint() > before);
    assert_eq!(pool.cache().stats().dirty, 0);
    pool.shutdown().unwrap();
}

#[test]
fn test_status_reports_components() {
    let dir = tempdir().unwrap();
    let pool = BrokerPool::open(config(dir.path()).with_max_brokers(3)).unwrap();
    let broker = pool.get_broker().unwrap();
    let mut txn = broker.begin().unwrap();

    let status = pool.status().unwrap();
    assert_eq!(status.max_brokers, 3);
    assert_eq!(status.active_brokers, 1);
    assert_eq!(status.indexes.len(), 4);
    assert_eq!(status.active_transactions.len(), 1);
    assert_eq!(status.active_transactions[0].0, txn.id());
    assert!(!status.read_only);
    assert!(!status.journal_files.is_empty());
    assert!(status.last_checkpoint.is_valid());
    assert!(!status.locks.has_deadlock());

    broker.abort(&mut txn).unwrap();
    drop(broker);
    pool.shutdown().unwrap();
}

#[test]
#[serial]
fn test_config_from_env() {
    let dir = tempdir().unwrap();
    std::env::remove_var(CONFIG_ENV);
    std::env::set_var(DATA_DIR_ENV, dir.path());
    let config = DatabaseConfig::from_env().unwrap();
    assert_eq!(config.data_dir, dir.path());

    let file = dir.path().join("strata.json");
    std::fs::write(
        &file,
        r#"{ "data_dir": "/srv/strata", "max_brokers": 7, "sync": { "min_free_space": 0 } }"#,
    )
    .unwrap();
    std::env::set_var(CONFIG_ENV, &file);
    let config = DatabaseConfig::from_env().unwrap();
    assert_eq!(config.data_dir, Path::new("/srv/strata"));
    assert_eq!(config.max_brokers, 7);
    assert_eq!(config.sync.min_free_space, 0);

    std::env::remove_var(CONFIG_ENV);
    std::env::remove_var(DATA_DIR_ENV);
}
