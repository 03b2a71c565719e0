mod common;

use std::collections::BTreeMap;
use std::ops::Bound;

use common::Db;
use proptest::prelude::*;
use strata::KeyRange;
use tempfile::tempdir;

#[derive(Debug, Clone)]
enum Op {
    Put(u16, Vec<u8>),
    Delete(u16),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u16..300, prop::collection::vec(any::<u8>(), 0..300)).prop_map(|(k, v)| Op::Put(k, v)),
        1 => (0u16..300).prop_map(Op::Delete),
    ]
}

fn key(k: u16) -> Vec<u8> {
    format!("k{k:05}").into_bytes()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn last_writer_wins(ops in prop::collection::vec(op(), 1..400)) {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path(), &[("idx.dbx", 1)], &[]);
        let tree = db.tree(1);
        let mut model = BTreeMap::new();

        let mut txn = db.tm.begin().unwrap();
        for op in &ops {
            match op {
                Op::Put(k, v) => {
                    tree.remove(&key(*k), &mut txn).unwrap();
                    tree.insert(&key(*k), v, &mut txn).unwrap();
                    model.insert(key(*k), v.clone());
                }
                Op::Delete(k) => {
                    let removed = tree.remove(&key(*k), &mut txn).unwrap();
                    prop_assert_eq!(removed, model.remove(&key(*k)));
                }
            }
        }
        db.tm.commit(&mut txn).unwrap();

        for k in 0..300u16 {
            prop_assert_eq!(tree.get(&key(k)).unwrap(), model.get(&key(k)).cloned());
        }
        let scanned: Vec<_> = tree.range_scan(KeyRange::all()).map(|e| e.unwrap()).collect();
        let expected: Vec<_> = model.clone().into_iter().collect();
        prop_assert_eq!(scanned, expected);

        let range = KeyRange::new(Bound::Included(key(50)), Bound::Excluded(key(150)));
        let scanned: Vec<_> = tree.range_scan(range).map(|e| e.unwrap().0).collect();
        let expected: Vec<_> = model.range(key(50)..key(150)).map(|(k, _)| k.clone()).collect();
        prop_assert_eq!(scanned, expected);
        tree.verify().unwrap();
    }
}

#[test]
fn duplicates_keep_insertion_order_and_remove_newest() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path(), &[("idx.dbx", 1)], &[]);
    let tree = db.tree(1);
    let mut txn = db.tm.begin().unwrap();
    for v in [b"a", b"b", b"c", b"b"] {
        tree.insert(b"dup", v, &mut txn).unwrap();
    }
    assert_eq!(tree.remove(b"dup", &mut txn).unwrap(), Some(b"b".to_vec()));
    assert!(tree.remove_value(b"dup", b"a", &mut txn).unwrap());
    assert!(!tree.remove_value(b"dup", b"zzz", &mut txn).unwrap());
    db.tm.commit(&mut txn).unwrap();
    assert_eq!(tree.get_all(b"dup").unwrap(), vec![b"b".to_vec(), b"c".to_vec()]);
}
