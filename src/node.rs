//! Serialized B+Tree node layout
//!
//! A node is a self-contained byte string that fits one page once written:
//!
//! ```text
//! 0..2    type tag (u16 LE): PageFlags::BRANCH or PageFlags::LEAF
//! 2..4    key count (u16 LE)
//! 4..8    reserved, zero            -- keeps the child array 8-aligned
//! branch: child pointers (u64 LE x nkeys), then the offset table
//! leaf:   offset table directly after the header
//! then:   packed entry area
//! ```
//!
//! `offsets[i]` is the *end* position of entry `i` relative to the entry
//! area, so an entry's span is `offsets[i] - offsets[i-1]`. A leaf entry is
//! `klen u16 | vlen u16 | key | val`; a branch entry is `klen u16 | key`
//! with the child pointer in the parallel array. Keys are unique and sorted
//! lexicographically.
//!
//! During mutation a node may temporarily exceed [`PAGE_SIZE`]; it must be
//! split before it is written out.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, PageId, Result};
use crate::page::{PageBuf, PageFlags, PAGE_SIZE};

/// Node header bytes (tag, key count, reserved)
pub const NODE_HEADER_SIZE: usize = 8;

/// Maximum key length accepted by the tree
pub const MAX_KEY_SIZE: usize = 1024;

/// Maximum value length accepted by the tree
pub const MAX_VALUE_SIZE: usize = 2048;

/// A decoded (but still serialized) B+Tree node
#[derive(Clone)]
pub struct Node {
    buf: Vec<u8>,
    leaf: bool,
    nkeys: usize,
}

/// Footprint of a leaf entry including its offset-table slot
pub fn leaf_entry_size(key: &[u8], val: &[u8]) -> usize {
    2 + 4 + key.len() + val.len()
}

/// Footprint of a branch entry including its offset slot and child pointer
pub fn branch_entry_size(key: &[u8]) -> usize {
    2 + 8 + 2 + key.len()
}

impl Node {
    /// Build a leaf from sorted, unique entries
    pub fn build_leaf(entries: &[(&[u8], &[u8])]) -> Node {
        let n = entries.len();
        let area: usize = entries.iter().map(|(k, v)| 4 + k.len() + v.len()).sum();
        let mut buf = vec![0u8; NODE_HEADER_SIZE + 2 * n + area];
        LittleEndian::write_u16(&mut buf[0..2], PageFlags::LEAF.bits());
        LittleEndian::write_u16(&mut buf[2..4], n as u16);
        let area_start = NODE_HEADER_SIZE + 2 * n;
        let mut end = 0usize;
        for (i, (k, v)) in entries.iter().enumerate() {
            let start = area_start + end;
            LittleEndian::write_u16(&mut buf[start..start + 2], k.len() as u16);
            LittleEndian::write_u16(&mut buf[start + 2..start + 4], v.len() as u16);
            buf[start + 4..start + 4 + k.len()].copy_from_slice(k);
            buf[start + 4 + k.len()..start + 4 + k.len() + v.len()].copy_from_slice(v);
            end += 4 + k.len() + v.len();
            let off_pos = NODE_HEADER_SIZE + 2 * i;
            LittleEndian::write_u16(&mut buf[off_pos..off_pos + 2], end as u16);
        }
        Node { buf, leaf: true, nkeys: n }
    }

    /// Build a branch from sorted, unique separator keys and their children
    pub fn build_branch(items: &[(&[u8], PageId)]) -> Node {
        let n = items.len();
        let area: usize = items.iter().map(|(k, _)| 2 + k.len()).sum();
        let mut buf = vec![0u8; NODE_HEADER_SIZE + 8 * n + 2 * n + area];
        LittleEndian::write_u16(&mut buf[0..2], PageFlags::BRANCH.bits());
        LittleEndian::write_u16(&mut buf[2..4], n as u16);
        let offs_start = NODE_HEADER_SIZE + 8 * n;
        let area_start = offs_start + 2 * n;
        let mut end = 0usize;
        for (i, (k, child)) in items.iter().enumerate() {
            let child_pos = NODE_HEADER_SIZE + 8 * i;
            LittleEndian::write_u64(&mut buf[child_pos..child_pos + 8], child.0);
            let start = area_start + end;
            LittleEndian::write_u16(&mut buf[start..start + 2], k.len() as u16);
            buf[start + 2..start + 2 + k.len()].copy_from_slice(k);
            end += 2 + k.len();
            let off_pos = offs_start + 2 * i;
            LittleEndian::write_u16(&mut buf[off_pos..off_pos + 2], end as u16);
        }
        Node { buf, leaf: false, nkeys: n }
    }

    /// Parse and validate a node read from a page
    pub fn parse(page: &PageBuf, ptr: PageId) -> Result<Node> {
        Self::parse_bytes(page.as_slice(), Some(ptr))
    }

    fn parse_bytes(buf: &[u8], ptr: Option<PageId>) -> Result<Node> {
        let corrupt = |details: &str| Error::Corruption {
            details: details.to_string(),
            page_id: ptr,
        };
        if buf.len() < NODE_HEADER_SIZE {
            return Err(corrupt("node shorter than header"));
        }
        let tag = LittleEndian::read_u16(&buf[0..2]);
        let leaf = if tag == PageFlags::LEAF.bits() {
            true
        } else if tag == PageFlags::BRANCH.bits() {
            false
        } else {
            return Err(corrupt("unknown node type tag"));
        };
        let nkeys = LittleEndian::read_u16(&buf[2..4]) as usize;
        let offs_start = NODE_HEADER_SIZE + if leaf { 0 } else { 8 * nkeys };
        let area_start = offs_start + 2 * nkeys;
        if area_start > buf.len() {
            return Err(corrupt("node tables exceed page"));
        }

        let mut prev = 0usize;
        for i in 0..nkeys {
            let off_pos = offs_start + 2 * i;
            let end = LittleEndian::read_u16(&buf[off_pos..off_pos + 2]) as usize;
            if end <= prev {
                return Err(corrupt("node offsets not increasing"));
            }
            if area_start + end > buf.len() {
                return Err(corrupt("node entry exceeds page"));
            }
            let span = end - prev;
            let start = area_start + prev;
            if leaf {
                if span < 4 {
                    return Err(corrupt("leaf entry shorter than its header"));
                }
                let klen = LittleEndian::read_u16(&buf[start..start + 2]) as usize;
                let vlen = LittleEndian::read_u16(&buf[start + 2..start + 4]) as usize;
                if 4 + klen + vlen != span {
                    return Err(corrupt("leaf entry length mismatch"));
                }
            } else {
                if span < 2 {
                    return Err(corrupt("branch entry shorter than its header"));
                }
                let klen = LittleEndian::read_u16(&buf[start..start + 2]) as usize;
                if 2 + klen != span {
                    return Err(corrupt("branch entry length mismatch"));
                }
                let child_pos = NODE_HEADER_SIZE + 8 * i;
                if LittleEndian::read_u64(&buf[child_pos..child_pos + 8]) == 0 {
                    return Err(corrupt("branch child pointer is zero"));
                }
            }
            prev = end;
        }

        let total = area_start + prev;
        Ok(Node { buf: buf[..total].to_vec(), leaf, nkeys })
    }

    /// Whether this is a leaf node
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    /// Number of keys in the node
    #[inline]
    pub fn nkeys(&self) -> usize {
        self.nkeys
    }

    /// Serialized size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Whether the node fits one page as-is
    #[inline]
    pub fn fits(&self) -> bool {
        self.buf.len() <= PAGE_SIZE
    }

    fn offs_start(&self) -> usize {
        NODE_HEADER_SIZE + if self.leaf { 0 } else { 8 * self.nkeys }
    }

    fn area_start(&self) -> usize {
        self.offs_start() + 2 * self.nkeys
    }

    fn entry_span(&self, i: usize) -> (usize, usize) {
        debug_assert!(i < self.nkeys);
        let offs = self.offs_start();
        let start = if i == 0 {
            0
        } else {
            LittleEndian::read_u16(&self.buf[offs + 2 * (i - 1)..offs + 2 * i]) as usize
        };
        let end = LittleEndian::read_u16(&self.buf[offs + 2 * i..offs + 2 * i + 2]) as usize;
        (self.area_start() + start, self.area_start() + end)
    }

    /// Key at index `i`
    pub fn key(&self, i: usize) -> &[u8] {
        let (start, _) = self.entry_span(i);
        let klen = LittleEndian::read_u16(&self.buf[start..start + 2]) as usize;
        let kstart = start + if self.leaf { 4 } else { 2 };
        &self.buf[kstart..kstart + klen]
    }

    /// Value at index `i` (leaf nodes only)
    pub fn value(&self, i: usize) -> &[u8] {
        debug_assert!(self.leaf);
        let (start, end) = self.entry_span(i);
        let klen = LittleEndian::read_u16(&self.buf[start..start + 2]) as usize;
        &self.buf[start + 4 + klen..end]
    }

    /// Child pointer at index `i` (branch nodes only)
    pub fn child(&self, i: usize) -> PageId {
        debug_assert!(!self.leaf);
        debug_assert!(i < self.nkeys);
        let pos = NODE_HEADER_SIZE + 8 * i;
        PageId(LittleEndian::read_u64(&self.buf[pos..pos + 8]))
    }

    /// First key of the node; the separator it is filed under
    pub fn first_key(&self) -> &[u8] {
        self.key(0)
    }

    /// Index of the greatest key `<= target`, or `None` when every key is
    /// greater
    pub fn lookup_le(&self, target: &[u8]) -> Option<usize> {
        let mut lo = 0usize;
        let mut hi = self.nkeys;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key(mid) <= target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo.checked_sub(1)
    }

    /// Leaf entries as borrowed (key, value) pairs
    pub fn leaf_entries(&self) -> Vec<(&[u8], &[u8])> {
        debug_assert!(self.leaf);
        (0..self.nkeys).map(|i| (self.key(i), self.value(i))).collect()
    }

    /// Branch items as borrowed (separator, child) pairs
    pub fn branch_items(&self) -> Vec<(&[u8], PageId)> {
        debug_assert!(!self.leaf);
        (0..self.nkeys).map(|i| (self.key(i), self.child(i))).collect()
    }

    /// Split an oversized node into consecutive parts that each fit a page.
    ///
    /// Entries are packed greedily left to right; with the entry size caps
    /// this yields two parts, three in the worst case.
    pub fn split(&self) -> Vec<Node> {
        let mut parts = Vec::new();
        if self.leaf {
            let entries = self.leaf_entries();
            let mut cur: Vec<(&[u8], &[u8])> = Vec::new();
            let mut cur_size = NODE_HEADER_SIZE;
            for &(k, v) in &entries {
                let es = leaf_entry_size(k, v);
                if !cur.is_empty() && cur_size + es > PAGE_SIZE {
                    parts.push(Node::build_leaf(&cur));
                    cur.clear();
                    cur_size = NODE_HEADER_SIZE;
                }
                cur.push((k, v));
                cur_size += es;
            }
            if !cur.is_empty() {
                parts.push(Node::build_leaf(&cur));
            }
        } else {
            let items = self.branch_items();
            let mut cur: Vec<(&[u8], PageId)> = Vec::new();
            let mut cur_size = NODE_HEADER_SIZE;
            for &(k, child) in &items {
                let es = branch_entry_size(k);
                if !cur.is_empty() && cur_size + es > PAGE_SIZE {
                    parts.push(Node::build_branch(&cur));
                    cur.clear();
                    cur_size = NODE_HEADER_SIZE;
                }
                cur.push((k, child));
                cur_size += es;
            }
            if !cur.is_empty() {
                parts.push(Node::build_branch(&cur));
            }
        }
        debug_assert!(parts.iter().all(Node::fits));
        debug_assert!(parts.len() <= 3);
        parts
    }

    /// Merge two sibling nodes of the same kind; `left` keys precede
    /// `right` keys.
    pub fn merge(left: &Node, right: &Node) -> Node {
        debug_assert_eq!(left.leaf, right.leaf);
        if left.leaf {
            let mut entries = left.leaf_entries();
            entries.extend(right.leaf_entries());
            Node::build_leaf(&entries)
        } else {
            let mut items = left.branch_items();
            items.extend(right.branch_items());
            Node::build_branch(&items)
        }
    }

    /// Serialize into a page buffer; the node must fit
    pub fn to_page(&self) -> Result<PageBuf> {
        PageBuf::from_bytes(&self.buf)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Node {{ kind: {}, nkeys: {}, size: {} }}",
            if self.leaf { "leaf" } else { "branch" },
            self.nkeys,
            self.buf.len()
        )
    }
}
