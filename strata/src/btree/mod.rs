//! B+tree index stored in a page file.
//!
//! Entries are ordered by `(key, seq)` where `seq` is a per-file insertion
//! counter, so duplicate keys keep their insertion order. Values larger than
//! an eighth of a page spill into overflow page chains.
//!
//! Structural changes are logged as full page images (redo-only), while the
//! entry changes themselves are logged as `BtreeInsert`/`BtreeRemove` records
//! that undo through this module again.
mod node;
mod scan;

pub use node::ValueRef;
pub use scan::{KeyRange, RangeScan, ScanPosition};

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::{FileSlot, PageCache};
use crate::page::{Page, HEADER_PAGE_ID};
use crate::page_store::{self, PageStore};
use crate::pager::Pager;
use crate::transaction::{TransactionManager, Txn};
use crate::wal::Lsn;
use crate::{Error, FileId, PageId, Result, INVALID_PAGE_ID};

use node::{Internal, InternalCell, Leaf, LeafCell, Node};

/// Page holding the empty root leaf of a freshly created tree.
const INITIAL_ROOT: PageId = 1;

#[derive(Clone)]
pub struct BTree {
    store: Arc<PageStore>,
}

impl BTree {
    /// Creates a new index file with an empty root leaf and registers it.
    pub fn create<P: AsRef<Path>>(
        cache: Arc<PageCache>,
        path: P,
        file_id: FileId,
        page_size: usize,
    ) -> Result<Self> {
        let mut pager = Pager::create(path.as_ref(), file_id, page_size)?;
        init_root(&mut pager)?;
        drop(pager);
        Self::open(cache, path)
    }

    /// Opens an existing index file and registers it with the cache.
    pub fn open<P: AsRef<Path>>(cache: Arc<PageCache>, path: P) -> Result<Self> {
        let store = PageStore::open(cache, path)?;
        Ok(Self {
            store: Arc::new(store),
        })
    }

    /// A handle on an index already registered with the cache.
    pub fn attach(cache: Arc<PageCache>, file: FileId) -> Result<Self> {
        Ok(Self {
            store: Arc::new(PageStore::new(cache, file)?),
        })
    }

    pub fn file_id(&self) -> FileId {
        self.store.file_id()
    }

    pub fn name(&self) -> &str {
        self.slot().name()
    }

    pub fn slot(&self) -> &Arc<FileSlot> {
        self.store.slot()
    }

    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }

    /// Longest key accepted.
    pub fn max_key_len(&self) -> usize {
        self.page_size() / 8
    }

    /// Longest value stored inside a leaf.
    fn inline_max(&self) -> usize {
        self.page_size() / 8
    }

    fn cache(&self) -> &Arc<PageCache> {
        self.store.cache()
    }

    fn check_usable(&self) -> Result<()> {
        if self.slot().is_unusable() {
            return Err(Error::corruption(
                self.file_id(),
                HEADER_PAGE_ID,
                "index is marked unusable until rebuilt",
            ));
        }
        Ok(())
    }

    // --- public operations ---

    /// Inserts an entry; duplicates of `key` are kept after the existing ones.
    /// Returns the entry's sequence number.
    pub fn insert(&self, key: &[u8], value: &[u8], txn: &mut Txn) -> Result<u64> {
        self.check_key(key)?;
        let _latch = self.slot().latch().write();
        self.check_usable()?;
        let seq = self.store.take_seq()?;
        let value = self.store_value(value, txn)?;
        self.insert_entry(key, seq, value, txn)?;
        Ok(seq)
    }

    /// Re-inserts an entry at a known position. Returns false when it exists.
    pub(crate) fn insert_with_seq(
        &self,
        key: &[u8],
        seq: u64,
        value: &[u8],
        txn: &mut Txn,
    ) -> Result<bool> {
        let _latch = self.slot().latch().write();
        self.check_usable()?;
        if self.find_exact(key, seq)?.is_some() {
            return Ok(false);
        }
        page_store::bump_seq(self.cache(), self.file_id(), seq)?;
        let value = self.store_value(value, txn)?;
        self.insert_entry(key, seq, value, txn)?;
        Ok(true)
    }

    /// Most recently inserted value for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let _latch = self.slot().latch().read();
        self.check_usable()?;
        match self.cells_for_key(key)?.pop() {
            Some(cell) => Ok(Some(self.read_value(&cell.value)?)),
            None => Ok(None),
        }
    }

    /// Every value for `key`, oldest first.
    pub fn get_all(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let _latch = self.slot().latch().read();
        self.check_usable()?;
        self.cells_for_key(key)?
            .iter()
            .map(|cell| self.read_value(&cell.value))
            .collect()
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        let _latch = self.slot().latch().read();
        self.check_usable()?;
        Ok(!self.cells_for_key(key)?.is_empty())
    }

    /// Removes the most recent entry for `key` and returns its value.
    pub fn remove(&self, key: &[u8], txn: &mut Txn) -> Result<Option<Vec<u8>>> {
        let _latch = self.slot().latch().write();
        self.check_usable()?;
        match self.cells_for_key(key)?.pop() {
            Some(cell) => self.remove_entry(&cell.key, cell.seq, txn),
            None => Ok(None),
        }
    }

    /// Removes the most recent entry matching both `key` and `value`.
    pub fn remove_value(&self, key: &[u8], value: &[u8], txn: &mut Txn) -> Result<bool> {
        let _latch = self.slot().latch().write();
        self.check_usable()?;
        for cell in self.cells_for_key(key)?.iter().rev() {
            if self.read_value(&cell.value)? == value {
                self.remove_entry(&cell.key, cell.seq, txn)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Removes the entry `(key, seq)` if present.
    pub(crate) fn remove_exact(&self, key: &[u8], seq: u64, txn: &mut Txn) -> Result<Option<Vec<u8>>> {
        let _latch = self.slot().latch().write();
        self.check_usable()?;
        self.remove_entry(key, seq, txn)
    }

    /// Iterates the entries in `range` in key order as they stood when the
    /// scan was created.
    pub fn range_scan(&self, range: KeyRange) -> RangeScan {
        RangeScan::new(self.clone(), range, None)
    }

    /// Continues a scan after the last entry it returned.
    pub fn range_scan_from(&self, range: KeyRange, after: ScanPosition) -> RangeScan {
        RangeScan::new(self.clone(), range, Some(after))
    }

    /// Number of entries, by a full scan.
    pub fn len(&self) -> Result<usize> {
        let mut n = 0;
        for entry in self.range_scan(KeyRange::all()) {
            entry?;
            n += 1;
        }
        Ok(n)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Levels from the root down to the leaves.
    pub fn height(&self) -> Result<usize> {
        let _latch = self.slot().latch().read();
        self.check_usable()?;
        let mut height = 1;
        let mut page_id = self.root()?;
        while let Node::Internal(node) = self.load(page_id)? {
            page_id = node.first_child;
            height += 1;
        }
        Ok(height)
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    /// Writes back and closes the file.
    pub fn close(self) -> Result<()> {
        self.cache().unregister_file(self.file_id())
    }

    /// Reinitialises the index, keeping whatever entries can still be read
    /// through the leaf chain. The salvaged entries are re-inserted in one
    /// transaction and a checkpoint is taken so the journal no longer refers
    /// to the old layout. No other transaction may have pending changes in
    /// this file. Returns the number of entries kept.
    pub fn rebuild(&self, tm: &TransactionManager) -> Result<usize> {
        let salvaged = self.salvage();
        info!(file = self.file_id(), entries = salvaged.len(), "rebuilding index");

        self.store.truncate()?;
        {
            let _latch = self.slot().latch().write();
            let mut pager = self.slot().pager().lock();
            init_root(&mut pager)?;
        }

        let mut txn = tm.begin()?;
        for (key, seq, value) in &salvaged {
            if let Err(e) = self.insert_with_seq(key, *seq, value, &mut txn) {
                tm.abort(&mut txn)?;
                return Err(e);
            }
        }
        tm.commit(&mut txn)?;
        tm.checkpoint()?;
        Ok(salvaged.len())
    }

    /// Walks the leaf chain from the leftmost leaf, stopping at the first
    /// unreadable page.
    fn salvage(&self) -> Vec<(Vec<u8>, u64, Vec<u8>)> {
        let _latch = self.slot().latch().read();
        let mut out = Vec::new();
        let Ok(mut page_id) = self.root() else {
            return out;
        };
        loop {
            match self.read_node(page_id) {
                Ok(Node::Internal(node)) => page_id = node.first_child,
                Ok(Node::Leaf(_)) => break,
                Err(_) => return out,
            }
        }
        let mut visited = 0u32;
        while page_id != INVALID_PAGE_ID && visited <= self.page_count().unwrap_or(0) {
            let Ok(Node::Leaf(leaf)) = self.read_node(page_id) else {
                warn!(file = self.file_id(), page_id, "salvage stopped at unreadable leaf");
                break;
            };
            for cell in leaf.cells {
                match self.read_value(&cell.value) {
                    Ok(value) => out.push((cell.key, cell.seq, value)),
                    Err(e) => warn!(file = self.file_id(), error = %e, "dropping unreadable value"),
                }
            }
            page_id = leaf.next;
            visited += 1;
        }
        out
    }

    /// Checks ordering and separator bounds of every node. A violation marks
    /// the index unusable.
    pub fn verify(&self) -> Result<()> {
        let _latch = self.slot().latch().read();
        self.check_usable()?;
        let root = self.root()?;
        let result = self.verify_node(root, None, None);
        if let Err(Error::IndexCorruption { .. }) = &result {
            self.slot().mark_unusable();
        }
        result.map(|_| ())
    }

    fn verify_node(
        &self,
        page_id: PageId,
        lower: Option<(&[u8], u64)>,
        upper: Option<(&[u8], u64)>,
    ) -> Result<usize> {
        let in_bounds = |key: &[u8], seq: u64| {
            lower.map_or(true, |(k, s)| node::cmp_entry(key, seq, k, s).is_ge())
                && upper.map_or(true, |(k, s)| node::cmp_entry(key, seq, k, s).is_lt())
        };
        match self.load(page_id)? {
            Node::Leaf(leaf) => {
                if leaf.cells.iter().any(|c| !in_bounds(&c.key, c.seq)) {
                    return Err(Error::corruption(self.file_id(), page_id, "leaf entry outside separator bounds"));
                }
                Ok(1)
            }
            Node::Internal(node) => {
                if node.cells.iter().any(|c| !in_bounds(&c.key, c.seq)) {
                    return Err(Error::corruption(self.file_id(), page_id, "separator outside parent bounds"));
                }
                let mut depth = None;
                for idx in 0..node.children() {
                    let lo = if idx == 0 {
                        lower
                    } else {
                        let c = &node.cells[idx - 1];
                        Some((c.key.as_slice(), c.seq))
                    };
                    let hi = node
                        .cells
                        .get(idx)
                        .map(|c| (c.key.as_slice(), c.seq))
                        .or(upper);
                    let d = self.verify_node(node.child(idx), lo, hi)?;
                    if *depth.get_or_insert(d) != d {
                        return Err(Error::corruption(self.file_id(), page_id, "unbalanced subtrees"));
                    }
                }
                Ok(depth.unwrap_or(0) + 1)
            }
        }
    }

    // --- node access ---

    fn root(&self) -> Result<PageId> {
        let root = self.store.header()?.root_page;
        if root == INVALID_PAGE_ID {
            self.slot().mark_unusable();
            return Err(Error::corruption(self.file_id(), HEADER_PAGE_ID, "file has no root page"));
        }
        Ok(root)
    }

    fn page_count(&self) -> Result<u32> {
        Ok(self.store.header()?.page_count)
    }

    fn read_node(&self, page_id: PageId) -> Result<Node> {
        let guard = self.cache().get_or_load(self.file_id(), page_id)?;
        let page = guard.read();
        Node::decode(&page)
    }

    /// Decodes a node, flagging the file unusable when it is damaged.
    fn load(&self, page_id: PageId) -> Result<Node> {
        self.read_node(page_id).inspect_err(|e| {
            if matches!(e, Error::IndexCorruption { .. }) {
                self.slot().mark_unusable();
            }
        })
    }

    fn load_internal(&self, page_id: PageId) -> Result<Internal> {
        match self.load(page_id)? {
            Node::Internal(node) => Ok(node),
            Node::Leaf(_) => {
                self.slot().mark_unusable();
                Err(Error::corruption(self.file_id(), page_id, "expected an internal node"))
            }
        }
    }

    /// Logs a full image of `node` at `page_id` and installs it.
    fn write_node(&self, page_id: PageId, node: &Node, txn: &mut Txn) -> Result<()> {
        let mut page = Page::new(self.file_id(), page_id, self.page_size());
        node.encode_into(&mut page)?;
        self.store.put_image(&page, txn)?;
        Ok(())
    }

    /// Descends to the leaf whose range holds `(key, seq)`, recording the
    /// internal pages passed and the child index taken at each.
    fn descend(&self, key: &[u8], seq: u64) -> Result<(Vec<(PageId, usize)>, PageId, Leaf)> {
        let mut path = Vec::new();
        let mut page_id = self.root()?;
        loop {
            match self.load(page_id)? {
                Node::Internal(node) => {
                    let idx = node.route(key, seq);
                    path.push((page_id, idx));
                    page_id = node.child(idx);
                    if path.len() > 64 {
                        self.slot().mark_unusable();
                        return Err(Error::corruption(self.file_id(), page_id, "tree deeper than 64 levels"));
                    }
                }
                Node::Leaf(leaf) => return Ok((path, page_id, leaf)),
            }
        }
    }

    /// The leaf holding the first entry `>= (key, seq)` and its index there.
    pub(crate) fn seek(&self, key: &[u8], seq: u64) -> Result<Option<(Leaf, usize)>> {
        let (_, _, mut leaf) = self.descend(key, seq)?;
        let mut pos = leaf.lower_bound(key, seq);
        while pos == leaf.cells.len() {
            if leaf.next == INVALID_PAGE_ID {
                return Ok(None);
            }
            leaf = match self.load(leaf.next)? {
                Node::Leaf(next) => next,
                Node::Internal(_) => {
                    self.slot().mark_unusable();
                    return Err(Error::corruption(self.file_id(), leaf.next, "leaf chain points at an internal node"));
                }
            };
            pos = 0;
        }
        Ok(Some((leaf, pos)))
    }

    fn cells_for_key(&self, key: &[u8]) -> Result<Vec<LeafCell>> {
        let mut out = Vec::new();
        let Some((mut leaf, mut pos)) = self.seek(key, 0)? else {
            return Ok(out);
        };
        loop {
            for cell in &leaf.cells[pos..] {
                if cell.key != key {
                    return Ok(out);
                }
                out.push(cell.clone());
            }
            if leaf.next == INVALID_PAGE_ID {
                return Ok(out);
            }
            leaf = match self.load(leaf.next)? {
                Node::Leaf(next) => next,
                Node::Internal(_) => return Err(Error::corruption(self.file_id(), leaf.next, "leaf chain points at an internal node")),
            };
            pos = 0;
        }
    }

    fn find_exact(&self, key: &[u8], seq: u64) -> Result<Option<LeafCell>> {
        let (_, _, leaf) = self.descend(key, seq)?;
        Ok(leaf
            .position(key, seq)
            .ok()
            .map(|idx| leaf.cells[idx].clone()))
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        let max = self.max_key_len();
        if key.len() > max {
            return Err(Error::KeyTooLarge {
                max,
                actual: key.len(),
            });
        }
        Ok(())
    }

    // --- values ---

    fn store_value(&self, value: &[u8], txn: &mut Txn) -> Result<ValueRef> {
        if value.len() <= self.inline_max() {
            return Ok(ValueRef::Inline(value.to_vec()));
        }
        let chunks: Vec<&[u8]> = value
            .chunks(Page::overflow_capacity(self.page_size()))
            .collect();
        let ids = chunks
            .iter()
            .map(|_| self.store.allocate_structural(txn))
            .collect::<Result<Vec<_>>>()?;
        for (i, chunk) in chunks.iter().enumerate() {
            let next = ids.get(i + 1).copied().unwrap_or(INVALID_PAGE_ID);
            let mut page = Page::new(self.file_id(), ids[i], self.page_size());
            page.write_overflow(next, chunk);
            self.store.put_image(&page, txn)?;
        }
        Ok(ValueRef::Overflow {
            first: ids[0],
            len: value.len() as u64,
        })
    }

    fn read_value(&self, value: &ValueRef) -> Result<Vec<u8>> {
        match value {
            ValueRef::Inline(bytes) => Ok(bytes.clone()),
            ValueRef::Overflow { first, len } => {
                let mut out = Vec::with_capacity(*len as usize);
                for page_id in self.overflow_chain(*first, *len)? {
                    let guard = self.cache().get_or_load(self.file_id(), page_id)?;
                    let page = guard.read();
                    let (_, chunk) = page.read_overflow()?;
                    out.extend_from_slice(chunk);
                }
                if out.len() as u64 != *len {
                    return Err(Error::corruption(self.file_id(), *first, "overflow chain length mismatch"));
                }
                Ok(out)
            }
        }
    }

    fn overflow_chain(&self, first: PageId, len: u64) -> Result<Vec<PageId>> {
        let cap = Page::overflow_capacity(self.page_size()) as u64;
        let expected = len.div_ceil(cap).max(1) as usize;
        let mut ids = Vec::with_capacity(expected);
        let mut page_id = first;
        while page_id != INVALID_PAGE_ID {
            if ids.len() == expected {
                return Err(Error::corruption(self.file_id(), first, "overflow chain longer than its value"));
            }
            ids.push(page_id);
            let guard = self.cache().get_or_load(self.file_id(), page_id)?;
            let (next, _) = guard.read().read_overflow()?;
            page_id = next;
        }
        Ok(ids)
    }

    fn free_value(&self, value: &ValueRef, txn: &mut Txn) -> Result<()> {
        if let ValueRef::Overflow { first, len } = value {
            for page_id in self.overflow_chain(*first, *len)? {
                self.store.free_structural(page_id, txn)?;
            }
        }
        Ok(())
    }

    // --- insert ---

    fn insert_entry(&self, key: &[u8], seq: u64, value: ValueRef, txn: &mut Txn) -> Result<()> {
        let (path, leaf_id, leaf) = self.descend(key, seq)?;
        let cell = LeafCell {
            key: key.to_vec(),
            seq,
            value,
        };
        let pos = match leaf.position(key, seq) {
            Ok(_) => {
                return Err(Error::InvalidState(format!(
                    "entry with sequence {seq} already exists in file {}",
                    self.file_id()
                )))
            }
            Err(pos) => pos,
        };

        let mut with_cell = leaf;
        with_cell.cells.insert(pos, cell.clone());
        let target = if with_cell.encoded_len() <= self.page_size() {
            leaf_id
        } else {
            self.split_leaf(path, leaf_id, with_cell, pos, txn)?
        };
        self.log_insert(target, cell, txn)
    }

    /// Splits an over-full leaf. `cells` already contains the new cell at
    /// `new_pos`; it is left out of the logged images and the page that
    /// should receive it is returned.
    fn split_leaf(
        &self,
        path: Vec<(PageId, usize)>,
        leaf_id: PageId,
        mut leaf: Leaf,
        new_pos: usize,
        txn: &mut Txn,
    ) -> Result<PageId> {
        let mid = split_point(leaf.cells.iter().map(LeafCell::encoded_len));
        let right_id = self.store.allocate_structural(txn)?;
        let mut right = Leaf {
            next: leaf.next,
            cells: leaf.cells.split_off(mid),
        };
        leaf.next = right_id;
        let separator = InternalCell {
            key: right.cells[0].key.clone(),
            seq: right.cells[0].seq,
            child: right_id,
        };
        let target = if new_pos < mid {
            leaf.cells.remove(new_pos);
            leaf_id
        } else {
            right.cells.remove(new_pos - mid);
            right_id
        };

        self.write_node(right_id, &Node::Leaf(right), txn)?;
        self.write_node(leaf_id, &Node::Leaf(leaf), txn)?;
        debug!(file = self.file_id(), leaf_id, right_id, "split leaf");
        self.insert_separator(path, separator, txn)?;
        Ok(target)
    }

    /// Adds a separator for a new right sibling to the parents on `path`,
    /// splitting them as needed and growing a new root when the root splits.
    fn insert_separator(
        &self,
        mut path: Vec<(PageId, usize)>,
        separator: InternalCell,
        txn: &mut Txn,
    ) -> Result<()> {
        let mut pending = separator;
        loop {
            let Some((parent_id, idx)) = path.pop() else {
                let old_root = self.root()?;
                let new_root = self.store.allocate_structural(txn)?;
                let node = Internal {
                    first_child: old_root,
                    cells: vec![pending],
                };
                self.write_node(new_root, &Node::Internal(node), txn)?;
                self.store.set_root(new_root, txn)?;
                debug!(file = self.file_id(), old_root, new_root, "grew new root");
                return Ok(());
            };

            let mut left = self.load_internal(parent_id)?;
            left.cells.insert(idx, pending);
            if left.encoded_len() <= self.page_size() {
                return self.write_node(parent_id, &Node::Internal(left), txn);
            }

            let mid = split_point(left.cells.iter().map(InternalCell::encoded_len));
            let mut upper = left.cells.split_off(mid);
            let promoted = upper.remove(0);
            let right_id = self.store.allocate_structural(txn)?;
            let right = Internal {
                first_child: promoted.child,
                cells: upper,
            };
            self.write_node(right_id, &Node::Internal(right), txn)?;
            self.write_node(parent_id, &Node::Internal(left), txn)?;
            debug!(file = self.file_id(), parent_id, right_id, "split internal node");
            pending = InternalCell {
                key: promoted.key,
                seq: promoted.seq,
                child: right_id,
            };
        }
    }

    fn log_insert(&self, leaf_id: PageId, cell: LeafCell, txn: &mut Txn) -> Result<()> {
        let guard = self.cache().get_or_load(self.file_id(), leaf_id)?;
        let mut page = guard.write();
        let Node::Leaf(mut leaf) = Node::decode(&page)? else {
            return Err(Error::corruption(self.file_id(), leaf_id, "expected a leaf"));
        };
        let pos = leaf.position(&cell.key, cell.seq).unwrap_or_else(|p| p);
        let lsn = txn.log(crate::loggable::LogKind::BtreeInsert {
            file: self.file_id(),
            page: leaf_id,
            key: cell.key.clone(),
            seq: cell.seq,
            value: cell.value.clone(),
        })?;
        leaf.cells.insert(pos, cell);
        Node::Leaf(leaf).encode_into(&mut page)?;
        page.set_lsn(lsn);
        drop(page);
        self.cache().mark_dirty(&guard);
        Ok(())
    }

    // --- remove ---

    fn remove_entry(&self, key: &[u8], seq: u64, txn: &mut Txn) -> Result<Option<Vec<u8>>> {
        let (path, leaf_id, leaf) = self.descend(key, seq)?;
        let Ok(idx) = leaf.position(key, seq) else {
            return Ok(None);
        };
        let cell = leaf.cells[idx].clone();
        let value = self.read_value(&cell.value)?;

        {
            let guard = self.cache().get_or_load(self.file_id(), leaf_id)?;
            let mut page = guard.write();
            let lsn = txn.log(crate::loggable::LogKind::BtreeRemove {
                file: self.file_id(),
                page: leaf_id,
                key: key.to_vec(),
                seq,
                value: value.clone(),
            })?;
            let mut leaf = leaf;
            leaf.cells.remove(idx);
            Node::Leaf(leaf).encode_into(&mut page)?;
            page.set_lsn(lsn);
            drop(page);
            self.cache().mark_dirty(&guard);
        }
        self.free_value(&cell.value, txn)?;
        self.rebalance(path, leaf_id, txn)?;
        Ok(Some(value))
    }

    /// Merges an under-full node into a sibling, walking up while parents
    /// become under-full, and collapses a root left with a single child.
    fn rebalance(&self, mut path: Vec<(PageId, usize)>, mut page_id: PageId, txn: &mut Txn) -> Result<()> {
        let page_size = self.page_size();
        loop {
            let node = self.load(page_id)?;
            let Some((parent_id, idx)) = path.pop() else {
                if let Node::Internal(root) = node {
                    if root.cells.is_empty() {
                        self.store.set_root(root.first_child, txn)?;
                        self.store.free_structural(page_id, txn)?;
                        debug!(file = self.file_id(), old_root = page_id, new_root = root.first_child, "collapsed root");
                    }
                }
                return Ok(());
            };
            if node.encoded_len() >= page_size / 4 {
                return Ok(());
            }

            let mut parent = self.load_internal(parent_id)?;
            let (left_idx, right_idx) = if idx + 1 < parent.children() {
                (idx, idx + 1)
            } else if idx > 0 {
                (idx - 1, idx)
            } else {
                return Ok(());
            };
            let left_id = parent.child(left_idx);
            let right_id = parent.child(right_idx);
            let separator = parent.cells[right_idx - 1].clone();

            let merged = match (self.load(left_id)?, self.load(right_id)?) {
                (Node::Leaf(mut left), Node::Leaf(right)) => {
                    left.cells.extend(right.cells);
                    left.next = right.next;
                    Node::Leaf(left)
                }
                (Node::Internal(mut left), Node::Internal(right)) => {
                    left.cells.push(InternalCell {
                        key: separator.key,
                        seq: separator.seq,
                        child: right.first_child,
                    });
                    left.cells.extend(right.cells);
                    Node::Internal(left)
                }
                _ => {
                    self.slot().mark_unusable();
                    return Err(Error::corruption(self.file_id(), parent_id, "siblings of different kinds"));
                }
            };
            if merged.encoded_len() > page_size {
                return Ok(());
            }

            self.write_node(left_id, &merged, txn)?;
            parent.cells.remove(right_idx - 1);
            self.write_node(parent_id, &Node::Internal(parent), txn)?;
            self.store.free_structural(right_id, txn)?;
            debug!(file = self.file_id(), left_id, right_id, "merged nodes");
            page_id = parent_id;
        }
    }
}

/// First index at which the running size passes half the total, kept away
/// from both ends.
fn split_point(sizes: impl Iterator<Item = usize>) -> usize {
    let sizes: Vec<usize> = sizes.collect();
    let total: usize = sizes.iter().sum();
    let mut acc = 0;
    let mut mid = sizes.len() / 2;
    for (i, size) in sizes.iter().enumerate() {
        acc += size;
        if acc * 2 > total {
            mid = i;
            break;
        }
    }
    mid.clamp(1, sizes.len().saturating_sub(1).max(1))
}

/// Writes an empty root leaf at page 1 of a freshly created or truncated file.
fn init_root(pager: &mut Pager) -> Result<()> {
    let page_size = pager.page_size();
    let mut root = Page::new(pager.file_id(), INITIAL_ROOT, page_size);
    Node::Leaf(Leaf::empty()).encode_into(&mut root)?;
    pager.write_page(&root)?;

    let mut header_page = pager.read_page(HEADER_PAGE_ID)?;
    let mut header = header_page.file_header();
    header.root_page = INITIAL_ROOT;
    header.page_count = header.page_count.max(INITIAL_ROOT + 1);
    header_page.write_file_header(&header);
    pager.write_page(&header_page)?;
    pager.flush()
}

// --- redo ---

pub(crate) fn redo_insert(
    cache: &PageCache,
    lsn: Lsn,
    file: FileId,
    page: PageId,
    key: &[u8],
    seq: u64,
    value: &ValueRef,
) -> Result<()> {
    page_store::require_page(cache, lsn, file, page)?;
    page_store::redo_page(cache, lsn, file, page, |p| {
        let Node::Leaf(mut leaf) = Node::decode(p)? else {
            return Err(Error::corruption(file, page, "insert redo target is not a leaf"));
        };
        if let Err(pos) = leaf.position(key, seq) {
            leaf.cells.insert(
                pos,
                LeafCell {
                    key: key.to_vec(),
                    seq,
                    value: value.clone(),
                },
            );
        }
        Node::Leaf(leaf).encode_into(p)
    })?;
    page_store::bump_seq(cache, file, seq)
}

pub(crate) fn redo_remove(
    cache: &PageCache,
    lsn: Lsn,
    file: FileId,
    page: PageId,
    key: &[u8],
    seq: u64,
) -> Result<()> {
    page_store::require_page(cache, lsn, file, page)?;
    page_store::redo_page(cache, lsn, file, page, |p| {
        let Node::Leaf(mut leaf) = Node::decode(p)? else {
            return Err(Error::corruption(file, page, "remove redo target is not a leaf"));
        };
        if let Ok(idx) = leaf.position(key, seq) {
            leaf.cells.remove(idx);
        }
        Node::Leaf(leaf).encode_into(p)
    })?;
    Ok(())
}
