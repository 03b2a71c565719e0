//! On-page layout of B+tree nodes.
//!
//! ```text
//! leaf:     [page header][count:u16][next_leaf:u32] cells...
//!           cell = [key_len:u16][key][seq:u64][0][value_len:u32][value]
//!                | [key_len:u16][key][seq:u64][1][first_page:u32][total_len:u64]
//! internal: [page header][count:u16][first_child:u32] cells...
//!           cell = [key_len:u16][key][seq:u64][child:u32]
//! ```
//!
//! An internal cell is the lower bound of the subtree under its child: every
//! entry under `cells[i].child` is `>= (cells[i].key, cells[i].seq)` and below
//! the next separator. Entries below the first separator live under
//! `first_child`.
use std::cmp::Ordering;

use bytes::{Buf, BufMut};

use crate::page::{Page, PageType, PAGE_HEADER_SIZE};
use crate::{Error, FileId, PageId, Result};

pub(crate) const NODE_HEADER_SIZE: usize = 2 + 4;

const VALUE_INLINE: u8 = 0;
const VALUE_OVERFLOW: u8 = 1;

/// Where an entry's value lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueRef {
    Inline(Vec<u8>),
    /// Spilled to a chain of overflow pages.
    Overflow { first: PageId, len: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeafCell {
    pub key: Vec<u8>,
    pub seq: u64,
    pub value: ValueRef,
}

impl LeafCell {
    pub fn encoded_len(&self) -> usize {
        let value = match &self.value {
            ValueRef::Inline(v) => 4 + v.len(),
            ValueRef::Overflow { .. } => 4 + 8,
        };
        2 + self.key.len() + 8 + 1 + value
    }

    pub fn cmp_pos(&self, key: &[u8], seq: u64) -> Ordering {
        cmp_entry(&self.key, self.seq, key, seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InternalCell {
    pub key: Vec<u8>,
    pub seq: u64,
    pub child: PageId,
}

impl InternalCell {
    pub fn encoded_len(&self) -> usize {
        2 + self.key.len() + 8 + 4
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Leaf {
    pub next: PageId,
    pub cells: Vec<LeafCell>,
}

impl Leaf {
    pub fn empty() -> Self {
        Self {
            next: crate::INVALID_PAGE_ID,
            cells: Vec::new(),
        }
    }

    /// `Ok(i)` when `(key, seq)` is at `i`, else `Err(insertion point)`.
    pub fn position(&self, key: &[u8], seq: u64) -> std::result::Result<usize, usize> {
        self.cells.binary_search_by(|c| c.cmp_pos(key, seq))
    }

    pub fn encoded_len(&self) -> usize {
        PAGE_HEADER_SIZE + NODE_HEADER_SIZE + self.cells.iter().map(LeafCell::encoded_len).sum::<usize>()
    }

    /// Index of the first cell `>= (key, seq)`.
    pub fn lower_bound(&self, key: &[u8], seq: u64) -> usize {
        self.cells
            .partition_point(|c| c.cmp_pos(key, seq) == Ordering::Less)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Internal {
    pub first_child: PageId,
    pub cells: Vec<InternalCell>,
}

impl Internal {
    pub fn encoded_len(&self) -> usize {
        PAGE_HEADER_SIZE
            + NODE_HEADER_SIZE
            + self.cells.iter().map(InternalCell::encoded_len).sum::<usize>()
    }

    pub fn children(&self) -> usize {
        self.cells.len() + 1
    }

    pub fn child(&self, idx: usize) -> PageId {
        if idx == 0 {
            self.first_child
        } else {
            self.cells[idx - 1].child
        }
    }

    /// Index of the child whose range holds `(key, seq)`.
    pub fn route(&self, key: &[u8], seq: u64) -> usize {
        self.cells
            .partition_point(|c| cmp_entry(&c.key, c.seq, key, seq) != Ordering::Greater)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Leaf(Leaf),
    Internal(Internal),
}

impl Node {
    pub fn encoded_len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.encoded_len(),
            Node::Internal(node) => node.encoded_len(),
        }
    }

    pub fn decode(page: &Page) -> Result<Node> {
        let mut r = NodeReader {
            buf: page.body(),
            file: page.file,
            page: page.id,
        };
        match page.page_type() {
            Some(PageType::Leaf) => {
                let count = r.u16()? as usize;
                let next = r.u32()?;
                let mut cells = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = r.bytes16()?;
                    let seq = r.u64()?;
                    let value = match r.u8()? {
                        VALUE_INLINE => {
                            let len = r.u32()? as usize;
                            ValueRef::Inline(r.take(len)?)
                        }
                        VALUE_OVERFLOW => ValueRef::Overflow {
                            first: r.u32()?,
                            len: r.u64()?,
                        },
                        other => return Err(r.corrupt(format!("unknown value tag {other}"))),
                    };
                    cells.push(LeafCell { key, seq, value });
                }
                let leaf = Leaf { next, cells };
                if !leaf
                    .cells
                    .windows(2)
                    .all(|w| cmp_entry(&w[0].key, w[0].seq, &w[1].key, w[1].seq) == Ordering::Less)
                {
                    return Err(r.corrupt("leaf cells out of order"));
                }
                Ok(Node::Leaf(leaf))
            }
            Some(PageType::Internal) => {
                let count = r.u16()? as usize;
                let first_child = r.u32()?;
                let mut cells = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = r.bytes16()?;
                    let seq = r.u64()?;
                    let child = r.u32()?;
                    cells.push(InternalCell { key, seq, child });
                }
                if first_child == crate::INVALID_PAGE_ID
                    || cells.iter().any(|c| c.child == crate::INVALID_PAGE_ID)
                {
                    return Err(r.corrupt("internal node points at the header page"));
                }
                Ok(Node::Internal(Internal { first_child, cells }))
            }
            other => Err(r.corrupt(format!("expected a b-tree node, found {other:?}"))),
        }
    }

    /// Serialises the node into `page`, keeping the page LSN.
    pub fn encode_into(&self, page: &mut Page) -> Result<()> {
        let len = self.encoded_len();
        if len > page.size() {
            return Err(Error::InvalidState(format!(
                "node of {len} bytes does not fit page {} ({} bytes)",
                page.id,
                page.size()
            )));
        }
        let mut buf = Vec::with_capacity(len - PAGE_HEADER_SIZE);
        let page_type = match self {
            Node::Leaf(leaf) => {
                buf.put_u16(leaf.cells.len() as u16);
                buf.put_u32(leaf.next);
                for cell in &leaf.cells {
                    buf.put_u16(cell.key.len() as u16);
                    buf.put_slice(&cell.key);
                    buf.put_u64(cell.seq);
                    match &cell.value {
                        ValueRef::Inline(v) => {
                            buf.put_u8(VALUE_INLINE);
                            buf.put_u32(v.len() as u32);
                            buf.put_slice(v);
                        }
                        ValueRef::Overflow { first, len } => {
                            buf.put_u8(VALUE_OVERFLOW);
                            buf.put_u32(*first);
                            buf.put_u64(*len);
                        }
                    }
                }
                PageType::Leaf
            }
            Node::Internal(node) => {
                buf.put_u16(node.cells.len() as u16);
                buf.put_u32(node.first_child);
                for cell in &node.cells {
                    buf.put_u16(cell.key.len() as u16);
                    buf.put_slice(&cell.key);
                    buf.put_u64(cell.seq);
                    buf.put_u32(cell.child);
                }
                PageType::Internal
            }
        };
        page.reset(page_type);
        page.body_mut()[..buf.len()].copy_from_slice(&buf);
        Ok(())
    }
}

pub(crate) fn cmp_entry(a_key: &[u8], a_seq: u64, b_key: &[u8], b_seq: u64) -> Ordering {
    a_key.cmp(b_key).then(a_seq.cmp(&b_seq))
}

struct NodeReader<'a> {
    buf: &'a [u8],
    file: FileId,
    page: PageId,
}

impl NodeReader<'_> {
    fn corrupt(&self, reason: impl Into<String>) -> Error {
        Error::corruption(self.file, self.page, reason)
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(self.corrupt("cell runs past the end of the page"));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
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

    fn take(&mut self, len: usize) -> Result<Vec<u8>> {
        self.need(len)?;
        let out = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(out)
    }

    fn bytes16(&mut self) -> Result<Vec<u8>> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}
