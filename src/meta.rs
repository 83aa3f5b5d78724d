//! Meta page serialization
//!
//! The meta page lives at page 0. Rewriting it (and fsyncing) is the atomic
//! commit point of a transaction: the root pointer, the flushed page count
//! and the free-list state only advance together.
//!
//! Layout:
//!
//! ```text
//! 0..16   ASCII signature "TreeStore01" + 5 NUL bytes
//! 16..24  B+Tree root pointer (LE u64, 0 = empty tree)
//! 24..32  flushed page count (LE u64)
//! 32..72  free list state (5 x LE u64: head page, head seq,
//!         tail page, tail seq, max seq)
//! 72..80  reserved
//! ```

use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert;

use crate::error::{Error, PageId, Result};
use crate::freelist::FreeList;
use crate::page::PAGE_SIZE;

/// Signature identifying a treestore data file
pub const META_SIG: [u8; 16] = *b"TreeStore01\0\0\0\0\0";

/// Serialized size of the meta record; the rest of page 0 is reserved
pub const META_SIZE: usize = 80;

const_assert!(META_SIZE <= PAGE_SIZE);

/// In-memory copy of the meta page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    /// Root of the B+Tree (0 when the tree is empty)
    pub root: PageId,
    /// Number of pages durably flushed to the data file
    pub flushed: u64,
    /// Free-list cursors and reuse barrier
    pub freelist: FreeList,
}

impl Meta {
    /// Serialize into the fixed meta record
    pub fn encode(&self) -> [u8; META_SIZE] {
        let mut buf = [0u8; META_SIZE];
        buf[..16].copy_from_slice(&META_SIG);
        LittleEndian::write_u64(&mut buf[16..24], self.root.0);
        LittleEndian::write_u64(&mut buf[24..32], self.flushed);
        LittleEndian::write_u64(&mut buf[32..40], self.freelist.head_page.0);
        LittleEndian::write_u64(&mut buf[40..48], self.freelist.head_seq);
        LittleEndian::write_u64(&mut buf[48..56], self.freelist.tail_page.0);
        LittleEndian::write_u64(&mut buf[56..64], self.freelist.tail_seq);
        LittleEndian::write_u64(&mut buf[64..72], self.freelist.max_seq);
        buf
    }

    /// Parse and validate a meta record read from page 0
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_SIZE {
            return Err(Error::Corruption {
                details: format!("meta page truncated to {} bytes", buf.len()),
                page_id: Some(PageId(0)),
            });
        }
        if buf[..16] != META_SIG {
            return Err(Error::Corruption {
                details: "invalid meta page signature".into(),
                page_id: Some(PageId(0)),
            });
        }
        Ok(Self {
            root: PageId(LittleEndian::read_u64(&buf[16..24])),
            flushed: LittleEndian::read_u64(&buf[24..32]),
            freelist: FreeList {
                head_page: PageId(LittleEndian::read_u64(&buf[32..40])),
                head_seq: LittleEndian::read_u64(&buf[40..48]),
                tail_page: PageId(LittleEndian::read_u64(&buf[48..56])),
                tail_seq: LittleEndian::read_u64(&buf[56..64]),
                max_seq: LittleEndian::read_u64(&buf[64..72]),
            },
        })
    }
}
