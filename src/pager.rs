//! Page manager: mmap-backed page I/O with transactional staging
//!
//! The pager owns the data file and its memory mappings. Reads resolve in
//! staging order: the in-place `updates` map first, then the `temp` append
//! buffer, then the mapped file. Nothing reaches the file until
//! [`Pager::write_back`] runs during commit; positional writes plus explicit
//! fsync barriers carry the durability, the mapping is only ever read.
//!
//! The mapping grows in chunks: each new chunk doubles the mapped size, with
//! a configurable minimum (64 MiB). Chunks are never remapped or moved; a
//! page pointer is located by a linear scan over chunk bounds.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};

use crate::error::{Error, PageId, Result};
use crate::meta::{Meta, META_SIZE};
use crate::page::{PageBuf, PAGE_SIZE};

/// Minimum mmap chunk size (64 MiB)
pub const DEFAULT_MMAP_CHUNK_MIN: u64 = 64 * 1024 * 1024;

/// The narrow page capability set consumed by the B+Tree and the cursor:
/// read a page, allocate a new one, release one for recycling.
pub trait PageIo {
    /// Read the current visible content of a page
    fn read_page(&self, ptr: PageId) -> Result<PageBuf>;
    /// Allocate a page for `page`, reusing a freed page when possible
    fn alloc_page(&mut self, page: PageBuf) -> Result<PageId>;
    /// Release a page for recycling once the freeing transaction commits
    fn free_page(&mut self, ptr: PageId) -> Result<()>;
}

struct Chunk {
    start: u64,
    len: u64,
    map: Mmap,
}

/// Owns the data file, its mmap chunks and the per-transaction staging
/// buffers
pub struct Pager {
    file: File,
    path: PathBuf,
    chunks: Vec<Chunk>,
    /// Total mapped bytes
    mapped: u64,
    /// Allocated file length in bytes (may exceed the used pages)
    file_len: u64,
    chunk_min: u64,
    /// Number of pages durably flushed to disk
    pub(crate) flushed: u64,
    /// Pages appended by the open transaction, keyed by `flushed + index`
    temp: Vec<PageBuf>,
    /// In-place page rewrites staged by the open transaction
    updates: HashMap<u64, PageBuf>,
}

impl Pager {
    /// Open or create the data file at `path`
    pub fn open(path: impl AsRef<Path>, chunk_min: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Io(format!("open {}: {}", path.display(), e)))?;
        let file_len = file.metadata().map_err(|e| Error::Io(e.to_string()))?.len();

        let mut pager = Self {
            file,
            path,
            chunks: Vec::new(),
            mapped: 0,
            file_len,
            chunk_min: chunk_min.max(PAGE_SIZE as u64),
            flushed: 0,
            temp: Vec::new(),
            updates: HashMap::new(),
        };
        if file_len > 0 {
            let pages = file_len.div_ceil(PAGE_SIZE as u64);
            pager.extend_mmap(pages)?;
        }
        Ok(pager)
    }

    /// Whether the file was empty at open (a fresh database)
    pub fn is_new(&self) -> bool {
        self.file_len == 0 && self.flushed == 0
    }

    /// Path of the data file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of pages visible to the open transaction
    pub fn num_allocated(&self) -> u64 {
        self.flushed + self.temp.len() as u64
    }

    /// Read the current visible content of `ptr`: staged in-place updates
    /// first, then the transaction's append buffer, then the mapped file.
    pub fn read(&self, ptr: PageId) -> Result<PageBuf> {
        if ptr.0 == 0 {
            return Err(Error::Invariant("page 0 is the meta page"));
        }
        if let Some(page) = self.updates.get(&ptr.0) {
            return Ok(page.clone());
        }
        if ptr.0 >= self.flushed {
            let idx = (ptr.0 - self.flushed) as usize;
            return self
                .temp
                .get(idx)
                .cloned()
                .ok_or(Error::Invariant("read of unallocated page"));
        }
        self.read_mapped(ptr)
    }

    fn read_mapped(&self, ptr: PageId) -> Result<PageBuf> {
        let off = ptr.to_offset(PAGE_SIZE);
        let chunk = self
            .chunks
            .iter()
            .find(|c| off >= c.start && off + PAGE_SIZE as u64 <= c.start + c.len)
            .ok_or(Error::Invariant("page pointer outside mapped region"))?;
        let rel = (off - chunk.start) as usize;
        PageBuf::copy_from(&chunk.map[rel..rel + PAGE_SIZE], ptr)
    }

    /// Stage a fresh page in the append buffer; the returned pointer becomes
    /// durable only when the transaction commits.
    pub fn append(&mut self, page: PageBuf) -> PageId {
        self.temp.push(page);
        PageId(self.flushed + self.temp.len() as u64 - 1)
    }

    /// Stage an in-place rewrite of an existing page, effective on commit
    pub fn update(&mut self, ptr: PageId, page: PageBuf) -> Result<()> {
        if ptr.0 == 0 {
            return Err(Error::Invariant("page 0 is the meta page"));
        }
        if ptr.0 >= self.flushed {
            let idx = (ptr.0 - self.flushed) as usize;
            match self.temp.get_mut(idx) {
                Some(slot) => *slot = page,
                None => return Err(Error::Invariant("update of unallocated page")),
            }
            return Ok(());
        }
        self.updates.insert(ptr.0, page);
        Ok(())
    }

    /// Commit phase 2: write all staged pages to the file and fsync.
    ///
    /// In-place updates land first, then the appended pages past `flushed`.
    /// The file and mapping are extended beforehand so every written page is
    /// also readable through the mmap.
    pub fn write_back(&mut self) -> Result<()> {
        let target = self.flushed + self.temp.len() as u64;
        self.extend_mmap(target)?;
        for (&ptr, page) in &self.updates {
            self.file
                .write_all_at(page.as_slice(), ptr * PAGE_SIZE as u64)
                .map_err(|e| Error::Io(format!("page write: {}", e)))?;
        }
        for (i, page) in self.temp.iter().enumerate() {
            let ptr = self.flushed + i as u64;
            self.file
                .write_all_at(page.as_slice(), ptr * PAGE_SIZE as u64)
                .map_err(|e| Error::Io(format!("page write: {}", e)))?;
        }
        self.file
            .sync_all()
            .map_err(|e| Error::Io(format!("data fsync: {}", e)))?;
        Ok(())
    }

    /// Commit phase 3: rewrite the meta record at page 0 and fsync
    pub fn write_meta(&mut self, meta: &Meta) -> Result<()> {
        self.extend_mmap(1)?;
        let buf = meta.encode();
        self.file
            .write_all_at(&buf, 0)
            .map_err(|e| Error::Io(format!("meta write: {}", e)))?;
        self.file
            .sync_all()
            .map_err(|e| Error::Io(format!("meta fsync: {}", e)))?;
        Ok(())
    }

    /// Read and validate the meta record through the mapping
    pub fn read_meta(&self) -> Result<Meta> {
        let chunk = self
            .chunks
            .first()
            .ok_or(Error::Invariant("meta read on unmapped file"))?;
        Meta::decode(&chunk.map[..META_SIZE])
    }

    /// Absorb the staged pages after a successful commit
    pub fn commit_apply(&mut self) {
        self.flushed += self.temp.len() as u64;
        self.temp.clear();
        self.updates.clear();
    }

    /// Discard all staged pages and restore the durable page count
    pub fn revert(&mut self, flushed: u64) {
        self.temp.clear();
        self.updates.clear();
        self.flushed = flushed;
    }

    /// Ensure the mapping (and the file) covers at least `npages` pages.
    ///
    /// Each new chunk doubles the mapped size, never below the configured
    /// minimum. The file is extended to the chunk boundary first so the
    /// mapping never extends past EOF.
    fn extend_mmap(&mut self, npages: u64) -> Result<()> {
        let needed = npages * PAGE_SIZE as u64;
        while self.mapped < needed {
            let chunk_len = self.chunk_min.max(self.mapped);
            let new_end = self.mapped + chunk_len;
            if self.file_len < new_end {
                self.file
                    .set_len(new_end)
                    .map_err(|e| Error::Io(format!("file grow: {}", e)))?;
                self.file_len = new_end;
            }
            // Safety: the mapping is read-only and the file is only written
            // through write_all_at on this same handle; pages are copied out
            // of the map before being handed to callers.
            let map = unsafe {
                MmapOptions::new()
                    .offset(self.mapped)
                    .len(chunk_len as usize)
                    .map(&self.file)
                    .map_err(|e| Error::Io(format!("mmap: {}", e)))?
            };
            self.chunks.push(Chunk { start: self.mapped, len: chunk_len, map });
            self.mapped = new_end;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freelist::FreeList;

    fn temp_pager() -> (tempfile::TempDir, Pager) {
        let dir = tempfile::TempDir::new().unwrap();
        let pager = Pager::open(dir.path().join("t.db"), PAGE_SIZE as u64 * 4).unwrap();
        (dir, pager)
    }

    fn page_of(byte: u8) -> PageBuf {
        let mut p = PageBuf::zeroed();
        p.as_mut_slice()[0] = byte;
        p
    }

    #[test]
    fn test_append_then_read_from_temp() {
        let (_dir, mut pager) = temp_pager();
        pager.flushed = 1;
        let ptr = pager.append(page_of(0xAA));
        assert_eq!(ptr, PageId(1));
        assert_eq!(pager.read(ptr).unwrap().as_slice()[0], 0xAA);
    }

    #[test]
    fn test_update_prefers_staged_content() {
        let (_dir, mut pager) = temp_pager();
        pager.flushed = 1;
        let ptr = pager.append(page_of(1));
        pager.write_back().unwrap();
        pager.commit_apply();

        assert_eq!(pager.read(ptr).unwrap().as_slice()[0], 1);
        pager.update(ptr, page_of(2)).unwrap();
        assert_eq!(pager.read(ptr).unwrap().as_slice()[0], 2);
    }

    #[test]
    fn test_write_back_persists_through_mmap() {
        let (_dir, mut pager) = temp_pager();
        pager.flushed = 1;
        let a = pager.append(page_of(7));
        let b = pager.append(page_of(8));
        pager.write_back().unwrap();
        pager.commit_apply();
        assert_eq!(pager.flushed, 3);
        assert_eq!(pager.read(a).unwrap().as_slice()[0], 7);
        assert_eq!(pager.read(b).unwrap().as_slice()[0], 8);
    }

    #[test]
    fn test_revert_discards_staging() {
        let (_dir, mut pager) = temp_pager();
        pager.flushed = 1;
        let ptr = pager.append(page_of(9));
        pager.revert(1);
        assert!(pager.read(ptr).is_err());
        assert_eq!(pager.num_allocated(), 1);
    }

    #[test]
    fn test_meta_roundtrip_through_file() {
        let (_dir, mut pager) = temp_pager();
        let meta = Meta {
            root: PageId(3),
            flushed: 5,
            freelist: FreeList::default(),
        };
        pager.write_meta(&meta).unwrap();
        assert_eq!(pager.read_meta().unwrap(), meta);
    }

    #[test]
    fn test_read_unallocated_is_invariant_error() {
        let (_dir, pager) = temp_pager();
        assert!(matches!(pager.read(PageId(99)), Err(Error::Invariant(_))));
    }
}
