use std::collections::VecDeque;
use std::ops::Bound;

use super::BTree;
use crate::{Error, Result};

/// Bounds of a range scan over keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
}

impl KeyRange {
    pub fn new(start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Self {
        Self { start, end }
    }

    pub fn all() -> Self {
        Self::new(Bound::Unbounded, Bound::Unbounded)
    }

    /// `[start, ..)`
    pub fn from(start: &[u8]) -> Self {
        Self::new(Bound::Included(start.to_vec()), Bound::Unbounded)
    }

    /// `[start, end)`
    pub fn between(start: &[u8], end: &[u8]) -> Self {
        Self::new(Bound::Included(start.to_vec()), Bound::Excluded(end.to_vec()))
    }

    /// Every key equal to `key`.
    pub fn key(key: &[u8]) -> Self {
        Self::new(Bound::Included(key.to_vec()), Bound::Included(key.to_vec()))
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        let mut upper = prefix.to_vec();
        while let Some(last) = upper.pop() {
            if last < u8::MAX {
                upper.push(last + 1);
                return Self::new(Bound::Included(prefix.to_vec()), Bound::Excluded(upper));
            }
        }
        Self::new(Bound::Included(prefix.to_vec()), Bound::Unbounded)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = match &self.start {
            Bound::Included(s) => key >= s.as_slice(),
            Bound::Excluded(s) => key > s.as_slice(),
            Bound::Unbounded => true,
        };
        after_start && self.before_end(key)
    }

    fn before_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Included(e) => key <= e.as_slice(),
            Bound::Excluded(e) => key < e.as_slice(),
            Bound::Unbounded => true,
        }
    }

    /// First `(key, seq)` position the range admits.
    fn start_position(&self) -> (Vec<u8>, u64) {
        match &self.start {
            Bound::Included(k) => (k.clone(), 0),
            // no real entry carries the maximum sequence number
            Bound::Excluded(k) => (k.clone(), u64::MAX),
            Bound::Unbounded => (Vec::new(), 0),
        }
    }
}

/// The entry a scan last returned; resuming continues right after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPosition {
    pub key: Vec<u8>,
    pub seq: u64,
}

/// Finite iterator over a key range, fixed at the moment the scan starts.
///
/// The matching entries are copied out under the tree's read latch when the
/// scan is created, so later inserts and removes never show up in it.
/// [`position`](Self::position) still lets a caller stop and start a new scan
/// after the last entry it consumed.
pub struct RangeScan {
    entries: VecDeque<(Vec<u8>, u64, Vec<u8>)>,
    error: Option<Error>,
    last: Option<ScanPosition>,
}

impl RangeScan {
    pub(crate) fn new(tree: BTree, range: KeyRange, after: Option<ScanPosition>) -> Self {
        let mut from = range.start_position();
        if let Some(after) = &after {
            let resume = (after.key.clone(), after.seq.saturating_add(1));
            if resume > from {
                from = resume;
            }
        }
        let (entries, error) = match snapshot(&tree, &range, from) {
            Ok(entries) => (entries, None),
            Err(e) => (VecDeque::new(), Some(e)),
        };
        Self {
            entries,
            error,
            last: after,
        }
    }

    /// Restarts a scan of `range` after a saved position.
    pub fn resume_from(tree: &BTree, range: KeyRange, after: ScanPosition) -> Self {
        Self::new(tree.clone(), range, Some(after))
    }

    /// Position of the last entry returned.
    pub fn position(&self) -> Option<&ScanPosition> {
        self.last.as_ref()
    }

    /// Entries not yet returned.
    pub fn remaining(&self) -> usize {
        self.entries.len()
    }
}

/// Copies every entry of `range` at or after `from`, walking the leaf chain
/// under one hold of the read latch.
fn snapshot(
    tree: &BTree,
    range: &KeyRange,
    from: (Vec<u8>, u64),
) -> Result<VecDeque<(Vec<u8>, u64, Vec<u8>)>> {
    let _latch = tree.slot().latch().read();
    tree.check_usable()?;
    let mut entries = VecDeque::new();
    let Some((mut leaf, mut pos)) = tree.seek(&from.0, from.1)? else {
        return Ok(entries);
    };
    loop {
        for cell in &leaf.cells[pos..] {
            if !range.before_end(&cell.key) {
                return Ok(entries);
            }
            let value = tree.read_value(&cell.value)?;
            entries.push_back((cell.key.clone(), cell.seq, value));
        }
        let Some(last) = leaf.cells.last() else {
            return Ok(entries);
        };
        // continue strictly after the leaf's last entry
        match tree.seek(&last.key, last.seq.saturating_add(1))? {
            Some((next, next_pos)) => {
                leaf = next;
                pos = next_pos;
            }
            None => return Ok(entries),
        }
    }
}

impl Iterator for RangeScan {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.error.take() {
            return Some(Err(e));
        }
        let (key, seq, value) = self.entries.pop_front()?;
        self.last = Some(ScanPosition {
            key: key.clone(),
            seq,
        });
        Some(Ok((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::Env;

    fn populate(env: &Env) -> BTree {
        let tree = env.btree("scan.dbx", 1, 1024);
        let mut txn = env.tm.begin().unwrap();
        for i in 0..500u32 {
            let key = format!("k{i:04}");
            tree.insert(key.as_bytes(), &i.to_be_bytes(), &mut txn).unwrap();
        }
        env.tm.commit(&mut txn).unwrap();
        tree
    }

    fn keys(scan: RangeScan) -> Vec<String> {
        scan.map(|e| String::from_utf8(e.unwrap().0).unwrap()).collect()
    }

    #[test]
    fn test_bounds() {
        let env = Env::new();
        let tree = populate(&env);
        let got = keys(tree.range_scan(KeyRange::between(b"k0100", b"k0105")));
        assert_eq!(got, vec!["k0100", "k0101", "k0102", "k0103", "k0104"]);

        let got = keys(tree.range_scan(KeyRange::new(
            Bound::Excluded(b"k0100".to_vec()),
            Bound::Included(b"k0102".to_vec()),
        )));
        assert_eq!(got, vec!["k0101", "k0102"]);

        assert_eq!(keys(tree.range_scan(KeyRange::prefix(b"k049"))).len(), 10);
        assert_eq!(keys(tree.range_scan(KeyRange::from(b"k0490"))).len(), 10);
        assert!(keys(tree.range_scan(KeyRange::from(b"z"))).is_empty());
    }

    #[test]
    fn test_resume_from_saved_position() {
        let env = Env::new();
        let tree = populate(&env);
        let mut scan = tree.range_scan(KeyRange::all());
        let first: Vec<_> = scan.by_ref().take(123).map(|e| e.unwrap().0).collect();
        let saved = scan.position().cloned().unwrap();
        drop(scan);

        let rest = keys(RangeScan::resume_from(&tree, KeyRange::all(), saved));
        assert_eq!(first.len() + rest.len(), 500);
        assert_eq!(rest[0], "k0123");
    }

    #[test]
    fn test_scan_sees_duplicates_in_insertion_order() {
        let env = Env::new();
        let tree = env.btree("dups.dbx", 1, 1024);
        let mut txn = env.tm.begin().unwrap();
        for i in 0..100u32 {
            tree.insert(b"same", &i.to_be_bytes(), &mut txn).unwrap();
        }
        env.tm.commit(&mut txn).unwrap();
        let values: Vec<u32> = tree
            .range_scan(KeyRange::key(b"same"))
            .map(|e| u32::from_be_bytes(e.unwrap().1.try_into().unwrap()))
            .collect();
        assert_eq!(values, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_scan_ignores_changes_made_after_it_started() {
        let env = Env::new();
        let tree = env.btree("snap.dbx", 1, 1024);
        let mut txn = env.tm.begin().unwrap();
        for i in (0..400u32).step_by(2) {
            tree.insert(format!("k{i:05}").as_bytes(), b"old", &mut txn).unwrap();
        }
        env.tm.commit(&mut txn).unwrap();

        let mut scan = tree.range_scan(KeyRange::all());
        let first = scan.next().unwrap().unwrap();
        assert_eq!(first.0, b"k00000");

        let mut late = env.tm.begin().unwrap();
        tree.insert(b"k00399", b"new", &mut late).unwrap();
        tree.remove(b"k00398", &mut late).unwrap();
        env.tm.commit(&mut late).unwrap();

        let rest = keys(scan);
        assert_eq!(rest.len(), 199);
        assert!(!rest.iter().any(|k| k == "k00399"));
        assert!(rest.iter().any(|k| k == "k00398"));

        // a new scan sees the committed change
        let now = keys(tree.range_scan(KeyRange::from(b"k00390")));
        assert_eq!(now, vec!["k00390", "k00392", "k00394", "k00396", "k00399"]);
    }

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(
            KeyRange::prefix(&[1, 0xff]),
            KeyRange::new(Bound::Included(vec![1, 0xff]), Bound::Excluded(vec![2]))
        );
        assert_eq!(
            KeyRange::prefix(&[0xff]),
            KeyRange::new(Bound::Included(vec![0xff]), Bound::Unbounded)
        );
        assert!(KeyRange::prefix(b"/db/").contains(b"/db/x"));
        assert!(!KeyRange::prefix(b"/db/").contains(b"/dc"));
    }
}
