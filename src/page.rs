//! Fixed-size page buffers
//!
//! Pages are the fundamental unit of storage. Every page is exactly
//! [`PAGE_SIZE`] bytes; a 64-bit page pointer is the page's index in the
//! data file. Page 0 is the meta page, every other page is either a B+Tree
//! node or a free-list node.

use crate::error::{Error, PageId, Result};
use bitflags::bitflags;
use static_assertions::const_assert;

/// The page size (4KB, fixed)
pub const PAGE_SIZE: usize = 4096;

const_assert!(PAGE_SIZE >= 512);
const_assert!(PAGE_SIZE.is_power_of_two());

bitflags! {
    /// Flags describing what a page holds
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        /// Branch page (internal B+Tree node)
        const BRANCH = 0x01;
        /// Leaf page (contains key/value entries)
        const LEAF = 0x02;
        /// Free-list node
        const FREELIST = 0x04;
        /// Meta page (database metadata)
        const META = 0x08;
    }
}

/// An owned page buffer, exactly one page long
#[derive(Clone)]
pub struct PageBuf {
    data: Box<[u8; PAGE_SIZE]>,
}

impl PageBuf {
    /// Create a zeroed page
    pub fn zeroed() -> Self {
        Self { data: Box::new([0u8; PAGE_SIZE]) }
    }

    /// Create a page from serialized bytes, padding with zeros
    ///
    /// Fails when the input exceeds one page.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > PAGE_SIZE {
            return Err(Error::Invariant("serialized page exceeds page size"));
        }
        let mut page = Self::zeroed();
        page.data[..bytes.len()].copy_from_slice(bytes);
        Ok(page)
    }

    /// Copy a page out of a mapped region
    pub fn copy_from(src: &[u8], page_id: PageId) -> Result<Self> {
        if src.len() != PAGE_SIZE {
            return Err(Error::Corruption {
                details: format!("page slice is {} bytes", src.len()),
                page_id: Some(page_id),
            });
        }
        let mut page = Self::zeroed();
        page.data.copy_from_slice(src);
        Ok(page)
    }

    /// The page content
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..]
    }

    /// The page content, mutable
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }
}

impl std::fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PageBuf({} bytes)", PAGE_SIZE)
    }
}
