//! Database handle and single-writer transactions
//!
//! A [`Database`] owns the page manager, the free list, the B+Tree root and
//! the write-ahead log. Opening runs WAL recovery before any client traffic;
//! closing (or dropping) stops the background checkpointer and releases the
//! mappings.
//!
//! Exactly one transaction can be open at a time: [`Database::begin`] hands
//! out a [`Tx`] that mutably borrows the handle, so the single-writer
//! contract is enforced at compile time. Reads inside a transaction observe
//! its own uncommitted writes; point reads on the handle observe the last
//! committed state.
//!
//! Commit is two-phase durable: the logical operations and a commit marker
//! are appended to the WAL and fsynced, then the staged pages are written
//! and fsynced, then the meta page is rewritten and fsynced. A failure at
//! any step reverts the in-memory state and flags the engine; the next
//! commit first rewrites the last-known-good meta page to heal a possibly
//! torn write.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::btree;
use crate::cursor::{self, Cursor};
use crate::error::{Error, PageId, Result};
use crate::freelist::FreeList;
use crate::meta::Meta;
use crate::node::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::page::PageBuf;
use crate::pager::{PageIo, Pager, DEFAULT_MMAP_CHUNK_MIN};
use crate::recovery::{self, Checkpointer, RecoveryStats, DEFAULT_CHECKPOINT_INTERVAL};
use crate::wal::{Wal, WalOp, DEFAULT_WAL_MAX_FILE_SIZE, DEFAULT_WAL_RETAINED_FILES};

/// Tunable knobs for opening a database
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    wal_max_file_size: u64,
    wal_retained_files: usize,
    checkpoint_interval: Duration,
    mmap_chunk_min: u64,
    background_checkpointer: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseOptions {
    /// Defaults: 100 MiB WAL segments, 3 retained, 10 minute checkpoints,
    /// 64 MiB mmap chunks, background checkpointer on
    pub fn new() -> Self {
        Self {
            wal_max_file_size: DEFAULT_WAL_MAX_FILE_SIZE,
            wal_retained_files: DEFAULT_WAL_RETAINED_FILES,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            mmap_chunk_min: DEFAULT_MMAP_CHUNK_MIN,
            background_checkpointer: true,
        }
    }

    /// Segment size that triggers WAL rotation
    pub fn wal_max_file_size(mut self, bytes: u64) -> Self {
        self.wal_max_file_size = bytes;
        self
    }

    /// Number of WAL segments kept by rotation and checkpoints
    pub fn wal_retained_files(mut self, count: usize) -> Self {
        self.wal_retained_files = count;
        self
    }

    /// Interval between periodic checkpoints
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Minimum mmap chunk size; growth doubles from here
    pub fn mmap_chunk_min(mut self, bytes: u64) -> Self {
        self.mmap_chunk_min = bytes;
        self
    }

    /// Whether to run the periodic checkpointer thread
    pub fn background_checkpointer(mut self, enabled: bool) -> Self {
        self.background_checkpointer = enabled;
        self
    }

    /// Open the database at `path` with these options
    pub fn open(self, path: impl AsRef<Path>) -> Result<Database> {
        Database::open_with(path, self)
    }
}

/// The pager, free list and root pointer bound together: the allocation
/// path consults the free list before growing the file, the free path
/// queues durable pages for recycling.
pub(crate) struct Engine {
    pager: Pager,
    freelist: FreeList,
    root: PageId,
    failed: bool,
}

impl PageIo for Engine {
    fn read_page(&self, ptr: PageId) -> Result<PageBuf> {
        self.pager.read(ptr)
    }

    fn alloc_page(&mut self, page: PageBuf) -> Result<PageId> {
        if let Some(ptr) = self.freelist.pop_head(&mut self.pager)? {
            self.pager.update(ptr, page)?;
            return Ok(ptr);
        }
        Ok(self.pager.append(page))
    }

    fn free_page(&mut self, ptr: PageId) -> Result<()> {
        // Pages not yet flushed were never durable; they are dropped
        // silently because no committed state can reference them.
        if ptr.0 < self.pager.flushed {
            self.freelist.push_tail(&mut self.pager, ptr)?;
        }
        Ok(())
    }
}

impl Engine {
    fn meta(&self) -> Meta {
        Meta { root: self.root, flushed: self.pager.flushed, freelist: self.freelist }
    }

    fn restore(&mut self, meta: &Meta) {
        self.root = meta.root;
        self.freelist = meta.freelist;
        self.pager.revert(meta.flushed);
    }

    /// Commit phases 2 and 3: page write-back, then the meta rewrite.
    /// Both carry their own fsync barrier.
    fn commit_durable(&mut self) -> Result<()> {
        self.pager.write_back()?;
        let meta = Meta {
            root: self.root,
            flushed: self.pager.num_allocated(),
            freelist: self.freelist,
        };
        self.pager.write_meta(&meta)?;
        self.pager.commit_apply();
        self.freelist.set_max_seq();
        Ok(())
    }
}

/// An embedded, persistent, transactional key/value store
pub struct Database {
    engine: Engine,
    wal: Arc<Wal>,
    next_txn_id: u64,
    checkpointer: Option<Checkpointer>,
    stats: RecoveryStats,
}

impl Database {
    /// Open or create the database at `path` with default options
    pub fn open(path: impl AsRef<Path>) -> Result<Database> {
        DatabaseOptions::new().open(path)
    }

    fn open_with(path: impl AsRef<Path>, opts: DatabaseOptions) -> Result<Database> {
        let path = path.as_ref();
        let mut pager = Pager::open(path, opts.mmap_chunk_min)?;

        let meta = if pager.is_new() {
            // Page 0 is the meta page, page 1 the initial free-list node.
            pager.flushed = 1;
            let lnode = pager.append(PageBuf::zeroed());
            let freelist = FreeList::new(lnode);
            pager.write_back()?;
            let meta = Meta { root: PageId(0), flushed: pager.num_allocated(), freelist };
            pager.write_meta(&meta)?;
            pager.commit_apply();
            info!(path = %path.display(), "created new database");
            meta
        } else {
            let meta = pager.read_meta()?;
            pager.flushed = meta.flushed;
            debug!(
                path = %path.display(),
                root = %meta.root,
                flushed = meta.flushed,
                "opened existing database"
            );
            meta
        };

        let mut engine = Engine {
            pager,
            freelist: meta.freelist,
            root: meta.root,
            failed: false,
        };
        engine.freelist.set_max_seq();

        let wal = Arc::new(Wal::open(path, opts.wal_max_file_size, opts.wal_retained_files)?);
        let entries = wal.read_entries()?;
        // Transaction ids keep rising across sessions so recovery never
        // merges records from different lives of the database.
        let next_txn_id = entries.iter().map(|e| e.txn_id).max().unwrap_or(0) + 1;
        let stats = recovery::replay(&entries, &mut |op, key, value| {
            apply_redo(&mut engine, op, key, value)
        })?;

        let checkpointer = if opts.background_checkpointer {
            Some(Checkpointer::start(
                Arc::clone(&wal),
                opts.checkpoint_interval,
                Box::new(|| Ok(())),
            )?)
        } else {
            None
        };

        Ok(Database { engine, wal, next_txn_id, checkpointer, stats })
    }

    /// Point read of the last committed state
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return Ok(None);
        }
        btree::get(&self.engine, self.engine.root, key)
    }

    /// Insert or update one key in its own committed transaction
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut tx = self.begin();
        tx.set(key, value)?;
        tx.commit()
    }

    /// Delete one key in its own committed transaction; returns whether the
    /// key existed
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        let mut tx = self.begin();
        let deleted = tx.del(key)?;
        tx.commit()?;
        Ok(deleted)
    }

    /// Visit every key `>= start` in ascending byte order until the visitor
    /// returns `false`
    pub fn scan<F>(&self, start: &[u8], mut visitor: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        cursor::scan(&self.engine, self.engine.root, start, &mut visitor)
    }

    /// Start a transaction. The borrow makes it the only one.
    pub fn begin(&mut self) -> Tx<'_> {
        let snapshot = self.engine.meta();
        // Entries freed by this transaction stay invisible to it.
        self.engine.freelist.set_max_seq();
        Tx { db: self, snapshot, ops: Vec::new(), finished: false }
    }

    /// Run a checkpoint now: log the marker, fsync, evict stale segments
    pub fn checkpoint(&self) -> Result<()> {
        recovery::run_checkpoint(&self.wal, &|| Ok(())).map(|_| ())
    }

    /// What recovery found and replayed at open
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.stats
    }

    /// Path of the data file
    pub fn path(&self) -> &Path {
        self.engine.pager.path()
    }

    /// Number of pages durably flushed to the data file
    pub fn flushed_pages(&self) -> u64 {
        self.engine.pager.flushed
    }

    /// Close the database, stopping the checkpointer and unmapping the file
    pub fn close(self) {}

    fn commit_tx(&mut self, snapshot: &Meta, ops: &[(WalOp, Vec<u8>, Vec<u8>)]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        // Heal a possibly torn meta write left by a previous failed commit
        // before trusting the two-phase sequence again.
        if self.engine.failed {
            warn!("rewriting last-known-good meta page after failed commit");
            self.engine.pager.write_meta(snapshot)?;
            self.engine.failed = false;
        }

        let txn_id = self.next_txn_id;
        self.next_txn_id += 1;

        let outcome = (|| -> Result<()> {
            for (op, key, value) in ops {
                self.wal.append(txn_id, *op, key, value)?;
            }
            self.wal.append(txn_id, WalOp::Commit, b"", b"")?;
            self.wal.fsync()?;
            self.engine.commit_durable()
        })();

        match outcome {
            Ok(()) => {
                debug!(txn_id, ops = ops.len(), "transaction committed");
                Ok(())
            }
            Err(e) => {
                warn!(txn_id, error = %e, "commit failed, reverting");
                self.engine.restore(snapshot);
                self.engine.failed = true;
                Err(e)
            }
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Stop the periodic checkpointer, then bound the next open's replay
        // with a final checkpoint. Best effort: the durable root already
        // holds every committed operation.
        self.checkpointer.take();
        if let Err(e) = recovery::run_checkpoint(&self.wal, &|| Ok(())) {
            warn!(error = %e, "final checkpoint failed");
        }
    }
}

fn apply_redo(engine: &mut Engine, op: WalOp, key: &[u8], value: &[u8]) -> Result<()> {
    let snapshot = engine.meta();
    engine.freelist.set_max_seq();
    let outcome = (|| -> Result<()> {
        let root = engine.root;
        match op {
            WalOp::Insert => engine.root = btree::insert(engine, root, key, value)?,
            WalOp::Delete => engine.root = btree::delete(engine, root, key)?.0,
            WalOp::Commit | WalOp::Checkpoint => return Ok(()),
        }
        engine.commit_durable()
    })();
    if let Err(e) = outcome {
        engine.restore(&snapshot);
        engine.failed = true;
        return Err(e);
    }
    Ok(())
}

/// A single-writer transaction
///
/// Dropping an unfinished transaction aborts it.
pub struct Tx<'db> {
    db: &'db mut Database,
    snapshot: Meta,
    ops: Vec<(WalOp, Vec<u8>, Vec<u8>)>,
    finished: bool,
}

impl Tx<'_> {
    /// Read a key, observing this transaction's own writes
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return Ok(None);
        }
        btree::get(&self.db.engine, self.db.engine.root, key)
    }

    /// Insert or update a key
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidParameter("key must not be empty"));
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::InvalidParameter("key exceeds maximum size"));
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::InvalidParameter("value exceeds maximum size"));
        }
        let root = self.db.engine.root;
        self.db.engine.root = btree::insert(&mut self.db.engine, root, key, value)?;
        self.ops.push((WalOp::Insert, key.to_vec(), value.to_vec()));
        Ok(())
    }

    /// Delete a key; returns whether it existed
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        let root = self.db.engine.root;
        let (new_root, deleted) = btree::delete(&mut self.db.engine, root, key)?;
        self.db.engine.root = new_root;
        if deleted {
            self.ops.push((WalOp::Delete, key.to_vec(), Vec::new()));
        }
        Ok(deleted)
    }

    /// Visit every key `>= start`, including this transaction's own writes
    pub fn scan<F>(&self, start: &[u8], mut visitor: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        cursor::scan(&self.db.engine, self.db.engine.root, start, &mut visitor)
    }

    /// An unpositioned forward iterator over this transaction's view.
    /// Position it with [`Cursor::seek_le`]; it must not outlive further
    /// mutations, which the borrow rules enforce.
    pub fn iter(&self) -> Cursor<'_, impl PageIo> {
        Cursor::new(&self.db.engine, self.db.engine.root)
    }

    /// Durably commit every operation of this transaction
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let snapshot = self.snapshot;
        let ops = std::mem::take(&mut self.ops);
        self.db.commit_tx(&snapshot, &ops)
    }

    /// Discard every operation of this transaction
    pub fn abort(mut self) {
        self.finished = true;
        self.db.engine.restore(&self.snapshot);
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.db.engine.restore(&self.snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_commit_set_get() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = DatabaseOptions::new()
            .mmap_chunk_min(PAGE_CHUNK)
            .background_checkpointer(false)
            .open(dir.path().join("t.db"))
            .unwrap();
        db.set(b"k", b"v").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(db.get(b"missing").unwrap(), None);
    }

    #[test]
    fn test_empty_key_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = DatabaseOptions::new()
            .mmap_chunk_min(PAGE_CHUNK)
            .background_checkpointer(false)
            .open(dir.path().join("t.db"))
            .unwrap();
        assert!(db.set(b"", b"v").is_err());
        assert_eq!(db.get(b"").unwrap(), None);
        assert!(!db.del(b"").unwrap());
    }

    #[test]
    fn test_oversized_entries_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = DatabaseOptions::new()
            .mmap_chunk_min(PAGE_CHUNK)
            .background_checkpointer(false)
            .open(dir.path().join("t.db"))
            .unwrap();
        let big_key = vec![b'k'; MAX_KEY_SIZE + 1];
        let big_val = vec![b'v'; MAX_VALUE_SIZE + 1];
        assert!(db.set(&big_key, b"v").is_err());
        assert!(db.set(b"k", &big_val).is_err());
    }

    /// Small chunks keep unit-test databases small
    const PAGE_CHUNK: u64 = 64 * 1024;
}
