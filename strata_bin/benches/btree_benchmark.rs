use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use strata::KeyRange;
use strata_bin::{BrokerPool, DatabaseConfig};
use tempfile::TempDir;

fn setup_pool() -> (TempDir, BrokerPool) {
    let temp_dir = TempDir::new().unwrap();
    let config = DatabaseConfig::new(temp_dir.path())
        .with_cache_capacity(1024)
        .with_min_free_space(0);
    let pool = BrokerPool::open(config).unwrap();

    // Initialize with test data
    {
        let broker = pool.get_broker().unwrap();
        let tree = broker.btree("values.dbx").unwrap();
        let mut txn = broker.begin().unwrap();
        for i in 0..10_000u32 {
            tree.insert(&key(i), &i.to_be_bytes(), &mut txn).unwrap();
        }
        broker.commit(&mut txn).unwrap();
    }
    (temp_dir, pool)
}

fn key(i: u32) -> Vec<u8> {
    format!("key{i:08}").into_bytes()
}

fn benchmark_point_lookup(c: &mut Criterion) {
    let (_dir, pool) = setup_pool();
    let tree = pool.index("values.dbx").unwrap();
    let mut i = 0u32;

    c.bench_function("btree_get", |b| {
        b.iter(|| {
            i = (i + 7919) % 10_000;
            black_box(tree.get(&key(i)).unwrap());
        });
    });
}

fn benchmark_insert_commit(c: &mut Criterion) {
    let (_dir, pool) = setup_pool();
    let broker = pool.get_broker().unwrap();
    let tree = broker.btree("dom.dbx").unwrap();
    let mut next = 0u32;

    c.bench_function("btree_insert_100_and_commit", |b| {
        b.iter_batched(
            || {
                next += 100;
                next
            },
            |end| {
                let mut txn = broker.begin().unwrap();
                for i in end - 100..end {
                    tree.insert(&key(i), b"value", &mut txn).unwrap();
                }
                broker.commit(&mut txn).unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

fn benchmark_range_scan(c: &mut Criterion) {
    let (_dir, pool) = setup_pool();
    let tree = pool.index("values.dbx").unwrap();

    c.bench_function("btree_range_scan_1000", |b| {
        b.iter(|| {
            let range = KeyRange::between(&key(2_000), &key(3_000));
            let count = tree.range_scan(black_box(range)).count();
            assert_eq!(count, 1_000);
        });
    });
}

criterion_group!(
    benches,
    benchmark_point_lookup,
    benchmark_insert_commit,
    benchmark_range_scan
);
criterion_main!(benches);
