//! Embedded copy-on-write B+Tree key/value store
//!
//! This crate provides a persistent, single-node, transactional key/value
//! store over arbitrary byte keys: an on-disk B+Tree of fixed-size pages
//! backed by a memory-mapped file, a free-page recycler, single-writer
//! transactions with a two-phase durable commit, and a write-ahead log
//! providing crash recovery through redo replay and periodic checkpointing.
//! An order-preserving composite-key codec lets higher layers express typed
//! range queries over the raw byte API.

#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod btree;
pub mod codec;
pub mod cursor;
pub mod db;
pub mod error;
pub mod freelist;
pub mod meta;
pub mod node;
pub mod page;
pub mod pager;
pub mod recovery;
pub mod wal;

// Re-exports
pub use codec::{Cmp, Datum};
pub use cursor::Cursor;
pub use db::{Database, DatabaseOptions, Tx};
pub use error::{Error, Lsn, PageId, Result, TxnId};
pub use recovery::RecoveryStats;
pub use wal::{WalEntry, WalOp};

/// The fixed page size (4KB)
pub use page::PAGE_SIZE;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
