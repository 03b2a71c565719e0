//! Journal records and their redo/undo actions.
//!
//! Each record kind has a stable one-byte tag. Payloads are big-endian and
//! length-prefixed where variable. Structural records (page allocation, page
//! images, root changes) are redo-only: recovery repeats history, and undoing
//! a transaction only reverses its logical changes.
use std::sync::Arc;

use bytes::{Buf, BufMut};

use crate::btree::{self, BTree, ValueRef};
use crate::cache::PageCache;
use crate::error::LogError;
use crate::page_store::{self, PageStore};
use crate::transaction::Txn;
use crate::wal::Lsn;
use crate::{Error, FileId, PageId, Result, TxnId};

pub const TAG_TXN_START: u8 = 0x01;
pub const TAG_TXN_COMMIT: u8 = 0x02;
pub const TAG_TXN_ABORT: u8 = 0x03;
pub const TAG_CHECKPOINT: u8 = 0x04;
pub const TAG_PAGE_ALLOC: u8 = 0x10;
pub const TAG_PAGE_FREE: u8 = 0x11;
pub const TAG_PAGE_WRITE: u8 = 0x12;
pub const TAG_PAGE_IMAGE: u8 = 0x13;
pub const TAG_BTREE_INSERT: u8 = 0x20;
pub const TAG_BTREE_REMOVE: u8 = 0x21;
pub const TAG_ROOT_CHANGE: u8 = 0x22;

const VALUE_INLINE: u8 = 0;
const VALUE_OVERFLOW: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogKind {
    TxnStart,
    TxnCommit,
    TxnAbort,
    Checkpoint {
        /// Where recovery starts reading.
        redo_start: Lsn,
        /// Transactions active at checkpoint time with their first LSN.
        active: Vec<(TxnId, Lsn)>,
    },
    /// Structural allocations belong to a B-tree change that outlives an
    /// abort and are never undone.
    PageAlloc {
        file: FileId,
        page: PageId,
        free_head_before: PageId,
        free_head_after: PageId,
        page_count_before: u32,
        page_count_after: u32,
        structural: bool,
    },
    /// `before` is the page image prior to the free; empty when structural.
    PageFree {
        file: FileId,
        page: PageId,
        free_head_before: PageId,
        structural: bool,
        before: Vec<u8>,
    },
    /// Raw page write with full before and after images.
    PageWrite {
        file: FileId,
        page: PageId,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    /// Full page image written by a structural change.
    PageImage {
        file: FileId,
        page: PageId,
        image: Vec<u8>,
    },
    BtreeInsert {
        file: FileId,
        page: PageId,
        key: Vec<u8>,
        seq: u64,
        value: ValueRef,
    },
    BtreeRemove {
        file: FileId,
        page: PageId,
        key: Vec<u8>,
        seq: u64,
        /// The full removed value, so undo can restore it.
        value: Vec<u8>,
    },
    RootChange {
        file: FileId,
        old_root: PageId,
        new_root: PageId,
    },
}

impl LogKind {
    pub fn tag(&self) -> u8 {
        match self {
            LogKind::TxnStart => TAG_TXN_START,
            LogKind::TxnCommit => TAG_TXN_COMMIT,
            LogKind::TxnAbort => TAG_TXN_ABORT,
            LogKind::Checkpoint { .. } => TAG_CHECKPOINT,
            LogKind::PageAlloc { .. } => TAG_PAGE_ALLOC,
            LogKind::PageFree { .. } => TAG_PAGE_FREE,
            LogKind::PageWrite { .. } => TAG_PAGE_WRITE,
            LogKind::PageImage { .. } => TAG_PAGE_IMAGE,
            LogKind::BtreeInsert { .. } => TAG_BTREE_INSERT,
            LogKind::BtreeRemove { .. } => TAG_BTREE_REMOVE,
            LogKind::RootChange { .. } => TAG_ROOT_CHANGE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LogKind::TxnStart => "txn-start",
            LogKind::TxnCommit => "txn-commit",
            LogKind::TxnAbort => "txn-abort",
            LogKind::Checkpoint { .. } => "checkpoint",
            LogKind::PageAlloc { .. } => "page-alloc",
            LogKind::PageFree { .. } => "page-free",
            LogKind::PageWrite { .. } => "page-write",
            LogKind::PageImage { .. } => "page-image",
            LogKind::BtreeInsert { .. } => "btree-insert",
            LogKind::BtreeRemove { .. } => "btree-remove",
            LogKind::RootChange { .. } => "root-change",
        }
    }

    /// The file a data record touches. `None` for control records.
    pub fn file(&self) -> Option<FileId> {
        match self {
            LogKind::TxnStart
            | LogKind::TxnCommit
            | LogKind::TxnAbort
            | LogKind::Checkpoint { .. } => None,
            LogKind::PageAlloc { file, .. }
            | LogKind::PageFree { file, .. }
            | LogKind::PageWrite { file, .. }
            | LogKind::PageImage { file, .. }
            | LogKind::BtreeInsert { file, .. }
            | LogKind::BtreeRemove { file, .. }
            | LogKind::RootChange { file, .. } => Some(*file),
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            LogKind::TxnStart | LogKind::TxnCommit | LogKind::TxnAbort => {}
            LogKind::Checkpoint { redo_start, active } => {
                put_lsn(&mut buf, *redo_start);
                buf.put_u32(active.len() as u32);
                for (txn, first) in active {
                    buf.put_i64(*txn);
                    put_lsn(&mut buf, *first);
                }
            }
            LogKind::PageAlloc {
                file,
                page,
                free_head_before,
                free_head_after,
                page_count_before,
                page_count_after,
                structural,
            } => {
                buf.put_u16(*file);
                buf.put_u32(*page);
                buf.put_u32(*free_head_before);
                buf.put_u32(*free_head_after);
                buf.put_u32(*page_count_before);
                buf.put_u32(*page_count_after);
                buf.put_u8(u8::from(*structural));
            }
            LogKind::PageFree {
                file,
                page,
                free_head_before,
                structural,
                before,
            } => {
                buf.put_u16(*file);
                buf.put_u32(*page);
                buf.put_u32(*free_head_before);
                buf.put_u8(u8::from(*structural));
                put_bytes(&mut buf, before);
            }
            LogKind::PageWrite {
                file,
                page,
                before,
                after,
            } => {
                buf.put_u16(*file);
                buf.put_u32(*page);
                put_bytes(&mut buf, before);
                put_bytes(&mut buf, after);
            }
            LogKind::PageImage { file, page, image } => {
                buf.put_u16(*file);
                buf.put_u32(*page);
                put_bytes(&mut buf, image);
            }
            LogKind::BtreeInsert {
                file,
                page,
                key,
                seq,
                value,
            } => {
                buf.put_u16(*file);
                buf.put_u32(*page);
                put_bytes(&mut buf, key);
                buf.put_u64(*seq);
                match value {
                    ValueRef::Inline(bytes) => {
                        buf.put_u8(VALUE_INLINE);
                        put_bytes(&mut buf, bytes);
                    }
                    ValueRef::Overflow { first, len } => {
                        buf.put_u8(VALUE_OVERFLOW);
                        buf.put_u32(*first);
                        buf.put_u64(*len);
                    }
                }
            }
            LogKind::BtreeRemove {
                file,
                page,
                key,
                seq,
                value,
            } => {
                buf.put_u16(*file);
                buf.put_u32(*page);
                put_bytes(&mut buf, key);
                buf.put_u64(*seq);
                put_bytes(&mut buf, value);
            }
            LogKind::RootChange {
                file,
                old_root,
                new_root,
            } => {
                buf.put_u16(*file);
                buf.put_u32(*old_root);
                buf.put_u32(*new_root);
            }
        }
        buf
    }

    /// Decodes a payload for the given tag.
    pub fn decode(tag: u8, payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader { buf: payload, tag };
        let kind = match tag {
            TAG_TXN_START => LogKind::TxnStart,
            TAG_TXN_COMMIT => LogKind::TxnCommit,
            TAG_TXN_ABORT => LogKind::TxnAbort,
            TAG_CHECKPOINT => {
                let redo_start = r.lsn()?;
                let n = r.u32()? as usize;
                let mut active = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    active.push((r.i64()?, r.lsn()?));
                }
                LogKind::Checkpoint { redo_start, active }
            }
            TAG_PAGE_ALLOC => LogKind::PageAlloc {
                file: r.u16()?,
                page: r.u32()?,
                free_head_before: r.u32()?,
                free_head_after: r.u32()?,
                page_count_before: r.u32()?,
                page_count_after: r.u32()?,
                structural: r.flag()?,
            },
            TAG_PAGE_FREE => LogKind::PageFree {
                file: r.u16()?,
                page: r.u32()?,
                free_head_before: r.u32()?,
                structural: r.flag()?,
                before: r.bytes()?,
            },
            TAG_PAGE_WRITE => LogKind::PageWrite {
                file: r.u16()?,
                page: r.u32()?,
                before: r.bytes()?,
                after: r.bytes()?,
            },
            TAG_PAGE_IMAGE => LogKind::PageImage {
                file: r.u16()?,
                page: r.u32()?,
                image: r.bytes()?,
            },
            TAG_BTREE_INSERT => {
                let file = r.u16()?;
                let page = r.u32()?;
                let key = r.bytes()?;
                let seq = r.u64()?;
                let value = match r.u8()? {
                    VALUE_INLINE => ValueRef::Inline(r.bytes()?),
                    VALUE_OVERFLOW => ValueRef::Overflow {
                        first: r.u32()?,
                        len: r.u64()?,
                    },
                    _ => return Err(LogError::MalformedPayload { tag }.into()),
                };
                LogKind::BtreeInsert {
                    file,
                    page,
                    key,
                    seq,
                    value,
                }
            }
            TAG_BTREE_REMOVE => LogKind::BtreeRemove {
                file: r.u16()?,
                page: r.u32()?,
                key: r.bytes()?,
                seq: r.u64()?,
                value: r.bytes()?,
            },
            TAG_ROOT_CHANGE => LogKind::RootChange {
                file: r.u16()?,
                old_root: r.u32()?,
                new_root: r.u32()?,
            },
            other => return Err(LogError::UnknownType(other).into()),
        };
        if r.buf.has_remaining() {
            return Err(LogError::MalformedPayload { tag }.into());
        }
        Ok(kind)
    }
}

/// One journal record: the writing transaction, its position once appended,
/// and what it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loggable {
    pub txn_id: TxnId,
    pub lsn: Option<Lsn>,
    pub kind: LogKind,
}

impl Loggable {
    pub fn new(txn_id: TxnId, kind: LogKind) -> Self {
        Self {
            txn_id,
            lsn: None,
            kind,
        }
    }

    fn require_lsn(&self) -> Result<Lsn> {
        self.lsn.ok_or_else(|| {
            Error::InvalidState(format!("{} record has not been appended", self.kind.name()))
        })
    }

    /// Reapplies this record to the pages it touches. A page whose LSN is
    /// already at or past this record is left alone, so redo is idempotent.
    pub fn redo(&self, cache: &Arc<PageCache>) -> Result<()> {
        let lsn = self.require_lsn()?;
        match &self.kind {
            LogKind::TxnStart
            | LogKind::TxnCommit
            | LogKind::TxnAbort
            | LogKind::Checkpoint { .. } => Ok(()),
            LogKind::PageAlloc {
                file,
                page,
                free_head_after,
                page_count_after,
                ..
            } => page_store::redo_alloc(cache, lsn, *file, *page, *free_head_after, *page_count_after),
            LogKind::PageFree {
                file,
                page,
                free_head_before,
                ..
            } => page_store::redo_free(cache, lsn, *file, *page, *free_head_before),
            LogKind::PageWrite {
                file, page, after, ..
            } => page_store::redo_image(cache, lsn, *file, *page, after),
            LogKind::PageImage { file, page, image } => {
                page_store::redo_image(cache, lsn, *file, *page, image)
            }
            LogKind::BtreeInsert {
                file,
                page,
                key,
                seq,
                value,
            } => btree::redo_insert(cache, lsn, *file, *page, key, *seq, value),
            LogKind::BtreeRemove {
                file,
                page,
                key,
                seq,
                ..
            } => btree::redo_remove(cache, lsn, *file, *page, key, *seq),
            LogKind::RootChange { file, new_root, .. } => {
                page_store::redo_root(cache, lsn, *file, *new_root)
            }
        }
    }

    /// Reverses this record on behalf of `txn`, logging the compensation
    /// through `txn`. Structural records have no undo.
    pub fn undo(&self, cache: &Arc<PageCache>, txn: &mut Txn) -> Result<()> {
        match &self.kind {
            LogKind::PageAlloc {
                file,
                page,
                structural: false,
                ..
            } => {
                let store = PageStore::new(Arc::clone(cache), *file)?;
                store.undo_alloc(*page, txn)
            }
            LogKind::PageFree {
                file,
                page,
                structural: false,
                before,
                ..
            } => {
                let store = PageStore::new(Arc::clone(cache), *file)?;
                store.undo_free(*page, before, txn)
            }
            LogKind::PageWrite {
                file, page, before, ..
            } => {
                let store = PageStore::new(Arc::clone(cache), *file)?;
                store.write_image(*page, before, txn).map(|_| ())
            }
            LogKind::BtreeInsert { file, key, seq, .. } => {
                let tree = BTree::attach(Arc::clone(cache), *file)?;
                tree.remove_exact(key, *seq, txn).map(|_| ())
            }
            LogKind::BtreeRemove {
                file,
                key,
                seq,
                value,
                ..
            } => {
                let tree = BTree::attach(Arc::clone(cache), *file)?;
                tree.insert_with_seq(key, *seq, value, txn).map(|_| ())
            }
            _ => Ok(()),
        }
    }
}

fn put_lsn(buf: &mut Vec<u8>, lsn: Lsn) {
    buf.put_u32(lsn.file);
    buf.put_u64(lsn.offset);
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

struct PayloadReader<'a> {
    buf: &'a [u8],
    tag: u8,
}

impl PayloadReader<'_> {
    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(LogError::MalformedPayload { tag: self.tag }.into());
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn flag(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(LogError::MalformedPayload { tag: self.tag }.into()),
        }
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn lsn(&mut self) -> Result<Lsn> {
        Ok(Lsn::new(self.u32()?, self.u64()?))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let out = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn lsn() -> impl Strategy<Value = Lsn> {
        (any::<u32>(), any::<u64>()).prop_map(|(file, offset)| Lsn::new(file, offset))
    }

    fn bytes(max: usize) -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..max)
    }

    fn value_ref() -> impl Strategy<Value = ValueRef> {
        prop_oneof![
            bytes(300).prop_map(ValueRef::Inline),
            (any::<u32>(), any::<u64>()).prop_map(|(first, len)| ValueRef::Overflow { first, len }),
        ]
    }

    fn control_kind() -> impl Strategy<Value = LogKind> {
        prop_oneof![
            Just(LogKind::TxnStart),
            Just(LogKind::TxnCommit),
            Just(LogKind::TxnAbort),
            (lsn(), prop::collection::vec((any::<i64>(), lsn()), 0..8))
                .prop_map(|(redo_start, active)| LogKind::Checkpoint { redo_start, active }),
        ]
    }

    fn page_kind() -> impl Strategy<Value = LogKind> {
        prop_oneof![
            (any::<u16>(), any::<u32>(), any::<u32>(), any::<u32>(), any::<u32>(), any::<u32>(), any::<bool>())
                .prop_map(|(file, page, head_before, head_after, count_before, count_after, structural)| {
                    LogKind::PageAlloc {
                        file,
                        page,
                        free_head_before: head_before,
                        free_head_after: head_after,
                        page_count_before: count_before,
                        page_count_after: count_after,
                        structural,
                    }
                }),
            (any::<u16>(), any::<u32>(), any::<u32>(), any::<bool>(), bytes(128)).prop_map(
                |(file, page, free_head_before, structural, before)| LogKind::PageFree {
                    file,
                    page,
                    free_head_before,
                    structural,
                    before,
                }
            ),
            (any::<u16>(), any::<u32>(), bytes(128), bytes(128))
                .prop_map(|(file, page, before, after)| LogKind::PageWrite { file, page, before, after }),
            (any::<u16>(), any::<u32>(), bytes(128))
                .prop_map(|(file, page, image)| LogKind::PageImage { file, page, image }),
        ]
    }

    fn tree_kind() -> impl Strategy<Value = LogKind> {
        prop_oneof![
            (any::<u16>(), any::<u32>(), bytes(64), any::<u64>(), value_ref()).prop_map(
                |(file, page, key, seq, value)| LogKind::BtreeInsert { file, page, key, seq, value }
            ),
            (any::<u16>(), any::<u32>(), bytes(64), any::<u64>(), bytes(300)).prop_map(
                |(file, page, key, seq, value)| LogKind::BtreeRemove { file, page, key, seq, value }
            ),
            (any::<u16>(), any::<u32>(), any::<u32>()).prop_map(|(file, old_root, new_root)| {
                LogKind::RootChange { file, old_root, new_root }
            }),
        ]
    }

    fn any_kind() -> impl Strategy<Value = LogKind> {
        prop_oneof![control_kind(), page_kind(), tree_kind()]
    }

    proptest! {
        #[test]
        fn test_payloads_decode_to_the_same_record(kind in any_kind()) {
            let payload = kind.encode_payload();
            let back = LogKind::decode(kind.tag(), &payload).unwrap();
            prop_assert_eq!(back, kind);
        }

        #[test]
        fn test_truncated_payloads_are_rejected(kind in any_kind(), cut in any::<prop::sample::Index>()) {
            let payload = kind.encode_payload();
            prop_assume!(!payload.is_empty());
            let len = cut.index(payload.len());
            prop_assert!(LogKind::decode(kind.tag(), &payload[..len]).is_err());
        }
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert!(matches!(
            LogKind::decode(0x7f, &[]),
            Err(Error::Log(LogError::UnknownType(0x7f)))
        ));
    }

    #[test]
    fn test_short_and_long_payloads_are_malformed() {
        let mut payload = LogKind::RootChange {
            file: 1,
            old_root: 2,
            new_root: 3,
        }
        .encode_payload();
        assert!(matches!(
            LogKind::decode(TAG_ROOT_CHANGE, &payload[..5]),
            Err(Error::Log(LogError::MalformedPayload { tag: TAG_ROOT_CHANGE }))
        ));
        payload.push(0);
        assert!(LogKind::decode(TAG_ROOT_CHANGE, &payload).is_err());
    }

    #[test]
    fn test_data_records_name_their_file() {
        assert_eq!(LogKind::TxnCommit.file(), None);
        let alloc = LogKind::PageAlloc {
            file: 6,
            page: 1,
            free_head_before: 0,
            free_head_after: 0,
            page_count_before: 1,
            page_count_after: 2,
            structural: false,
        };
        assert_eq!(alloc.file(), Some(6));
        assert_eq!(alloc.name(), "page-alloc");
    }
}
