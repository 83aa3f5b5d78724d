//! Free page recycling
//!
//! Freed pages are kept in an unrolled linked list persisted in ordinary
//! pages. Each list node holds a `next` pointer and [`LNODE_CAP`] page
//! pointers; the meta page records head/tail cursors as (page, sequence)
//! pairs. Sequence numbers index slots globally: slot `seq % LNODE_CAP` of
//! the node covering that sequence range.
//!
//! `max_seq` is the reuse barrier: it freezes at the tail sequence when a
//! transaction begins, so pages freed inside the transaction cannot be
//! handed back to that same transaction. It advances only after the freeing
//! commit is durable.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, PageId, Result};
use crate::page::{PageBuf, PAGE_SIZE};
use crate::pager::Pager;

/// Freed-page pointers per list node
pub const LNODE_CAP: u64 = ((PAGE_SIZE - 8) / 8) as u64;

/// Free-list cursors, persisted in the meta page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreeList {
    /// Node containing the next pointer to pop
    pub head_page: PageId,
    /// Next sequence to pop
    pub head_seq: u64,
    /// Node receiving pushes
    pub tail_page: PageId,
    /// Next sequence to push
    pub tail_seq: u64,
    /// Pushes at or past this sequence are invisible to the open transaction
    pub max_seq: u64,
}

fn lnode_next(node: &PageBuf) -> PageId {
    PageId(LittleEndian::read_u64(&node.as_slice()[..8]))
}

fn lnode_set_next(node: &mut PageBuf, next: PageId) {
    LittleEndian::write_u64(&mut node.as_mut_slice()[..8], next.0);
}

fn lnode_slot(node: &PageBuf, idx: u64) -> PageId {
    let off = 8 + idx as usize * 8;
    PageId(LittleEndian::read_u64(&node.as_slice()[off..off + 8]))
}

fn lnode_set_slot(node: &mut PageBuf, idx: u64, ptr: PageId) {
    let off = 8 + idx as usize * 8;
    LittleEndian::write_u64(&mut node.as_mut_slice()[off..off + 8], ptr.0);
}

impl FreeList {
    /// Cursors for a fresh database whose initial (empty) list node lives at
    /// `node`
    pub fn new(node: PageId) -> Self {
        Self {
            head_page: node,
            head_seq: 0,
            tail_page: node,
            tail_seq: 0,
            max_seq: 0,
        }
    }

    /// Total pointers currently in the list, including ones not yet visible
    pub fn available(&self) -> u64 {
        self.tail_seq - self.head_seq
    }

    /// Freeze the reuse barrier at the current tail; called when a
    /// transaction begins and again after its commit is durable.
    pub fn set_max_seq(&mut self) {
        self.max_seq = self.tail_seq;
    }

    /// Pop the oldest reusable page pointer, or `None` when the list is
    /// empty or every remaining entry was pushed by the open transaction.
    pub fn pop_head(&mut self, pager: &mut Pager) -> Result<Option<PageId>> {
        if self.head_seq == self.tail_seq {
            return Ok(None);
        }
        if self.max_seq < self.tail_seq && self.head_seq >= self.max_seq {
            return Ok(None);
        }

        let node = pager.read(self.head_page)?;
        let ptr = lnode_slot(&node, self.head_seq % LNODE_CAP);
        if ptr.0 == 0 {
            return Err(Error::Invariant("empty free-list slot"));
        }
        self.head_seq += 1;

        // Crossing a node boundary drains the head node; the node itself
        // becomes a free page and is recycled through the tail.
        if self.head_seq % LNODE_CAP == 0 {
            let drained = self.head_page;
            let next = lnode_next(&node);
            if next.0 == 0 {
                return Err(Error::Invariant("free-list head has no successor"));
            }
            self.head_page = next;
            self.push_tail(pager, drained)?;
        }
        Ok(Some(ptr))
    }

    /// Append a freed page pointer at the tail, allocating a fresh list node
    /// through the page manager when the tail node fills up.
    pub fn push_tail(&mut self, pager: &mut Pager, ptr: PageId) -> Result<()> {
        let mut node = pager.read(self.tail_page)?;
        lnode_set_slot(&mut node, self.tail_seq % LNODE_CAP, ptr);
        self.tail_seq += 1;

        if self.tail_seq % LNODE_CAP == 0 {
            let new_tail = pager.append(PageBuf::zeroed());
            lnode_set_next(&mut node, new_tail);
            pager.update(self.tail_page, node)?;
            self.tail_page = new_tail;
        } else {
            pager.update(self.tail_page, node)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Pager, FreeList) {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pager =
            Pager::open(dir.path().join("t.db"), PAGE_SIZE as u64 * 4).unwrap();
        pager.flushed = 1; // pretend page 0 (meta) is durable
        let node = pager.append(PageBuf::zeroed());
        let fl = FreeList::new(node);
        (dir, pager, fl)
    }

    #[test]
    fn test_same_transaction_pushes_are_gated() {
        let (_dir, mut pager, mut fl) = setup();
        fl.set_max_seq();
        fl.push_tail(&mut pager, PageId(42)).unwrap();
        // Freed during the "open transaction": not reusable yet.
        assert_eq!(fl.pop_head(&mut pager).unwrap(), None);

        // The commit advances the barrier; now it pops.
        fl.set_max_seq();
        assert_eq!(fl.pop_head(&mut pager).unwrap(), Some(PageId(42)));
        assert_eq!(fl.pop_head(&mut pager).unwrap(), None);
    }

    #[test]
    fn test_fifo_order() {
        let (_dir, mut pager, mut fl) = setup();
        for i in 10..20 {
            fl.push_tail(&mut pager, PageId(i)).unwrap();
        }
        fl.set_max_seq();
        for i in 10..20 {
            assert_eq!(fl.pop_head(&mut pager).unwrap(), Some(PageId(i)));
        }
        assert_eq!(fl.pop_head(&mut pager).unwrap(), None);
    }

    #[test]
    fn test_tail_overflow_links_new_node() {
        let (_dir, mut pager, mut fl) = setup();
        let first_tail = fl.tail_page;
        for i in 0..LNODE_CAP {
            fl.push_tail(&mut pager, PageId(1000 + i)).unwrap();
        }
        assert_ne!(fl.tail_page, first_tail);
        assert_eq!(fl.available(), LNODE_CAP);
    }

    #[test]
    fn test_drained_head_recycles_itself() {
        let (_dir, mut pager, mut fl) = setup();
        let first_node = fl.head_page;
        for i in 0..LNODE_CAP {
            fl.push_tail(&mut pager, PageId(1000 + i)).unwrap();
        }
        fl.set_max_seq();
        for i in 0..LNODE_CAP {
            assert_eq!(fl.pop_head(&mut pager).unwrap(), Some(PageId(1000 + i)));
        }
        // The drained node went back onto the tail as a free page.
        assert_ne!(fl.head_page, first_node);
        assert_eq!(fl.available(), 1);
        assert_eq!(fl.pop_head(&mut pager).unwrap(), None); // gated
        fl.set_max_seq();
        assert_eq!(fl.pop_head(&mut pager).unwrap(), Some(first_node));
    }
}
