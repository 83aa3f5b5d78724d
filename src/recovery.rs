//! Crash recovery and checkpointing
//!
//! Recovery runs at open, before any client traffic: decoded WAL entries are
//! grouped by transaction, a transaction counts as committed only when its
//! commit marker made it to disk, and every committed operation newer than
//! the last checkpoint is redone in LSN order through a caller-supplied
//! callback. Uncommitted tails are discarded; their effects never reached
//! the durable root.
//!
//! Checkpointing runs periodically in a background thread and on demand: it
//! invokes the caller's flush hook, appends a checkpoint marker, fsyncs and
//! evicts stale segments. The thread stops cleanly through a shutdown
//! channel and is joined on drop.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::error::{Error, Lsn, Result, TxnId};
use crate::wal::{Wal, WalEntry, WalOp};

/// Default interval between periodic checkpoints (10 minutes)
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(600);

/// What recovery found and did, for observability
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    /// Records decoded across all segments
    pub total_entries: usize,
    /// Distinct transactions with a commit marker
    pub committed_txns: usize,
    /// Distinct transactions without one (discarded)
    pub uncommitted_txns: usize,
    /// Insert/delete operations redone
    pub replayed_ops: usize,
    /// LSN of the newest checkpoint marker, when present
    pub last_checkpoint_lsn: Option<Lsn>,
}

/// Redo every committed operation past the last checkpoint.
///
/// `entries` must be in log order (as returned by [`Wal::read_entries`]).
/// The callback receives `(op, key, value)` and typically applies the
/// operation to the tree inside its own durable commit.
pub fn replay(
    entries: &[WalEntry],
    redo: &mut dyn FnMut(WalOp, &[u8], &[u8]) -> Result<()>,
) -> Result<RecoveryStats> {
    let mut stats = RecoveryStats { total_entries: entries.len(), ..Default::default() };

    stats.last_checkpoint_lsn = entries
        .iter()
        .filter(|e| e.op == WalOp::Checkpoint)
        .map(|e| e.lsn)
        .max();

    struct TxnState {
        first_lsn: Lsn,
        committed: bool,
    }
    let mut txns: HashMap<TxnId, TxnState> = HashMap::new();
    for entry in entries {
        if entry.op == WalOp::Checkpoint {
            continue;
        }
        let state = txns
            .entry(entry.txn_id)
            .or_insert(TxnState { first_lsn: entry.lsn, committed: false });
        if entry.op == WalOp::Commit {
            state.committed = true;
        }
    }

    stats.committed_txns = txns.values().filter(|t| t.committed).count();
    stats.uncommitted_txns = txns.len() - stats.committed_txns;

    let checkpoint = stats.last_checkpoint_lsn.unwrap_or(0);
    for entry in entries {
        if !matches!(entry.op, WalOp::Insert | WalOp::Delete) {
            continue;
        }
        let Some(state) = txns.get(&entry.txn_id) else { continue };
        if !state.committed {
            continue;
        }
        // Transactions that began before the checkpoint are already in the
        // durable root.
        if stats.last_checkpoint_lsn.is_some() && state.first_lsn < checkpoint {
            continue;
        }
        redo(entry.op, &entry.key, &entry.value)?;
        stats.replayed_ops += 1;
    }

    if stats.replayed_ops > 0 || stats.uncommitted_txns > 0 {
        info!(
            total = stats.total_entries,
            committed = stats.committed_txns,
            uncommitted = stats.uncommitted_txns,
            replayed = stats.replayed_ops,
            "wal recovery replayed committed operations"
        );
    } else {
        debug!(total = stats.total_entries, "wal recovery found nothing to redo");
    }
    Ok(stats)
}

/// Flush hook invoked before a checkpoint marker is logged
pub type FlushFn = Box<dyn Fn() -> Result<()> + Send + 'static>;

/// Run one checkpoint: flush, log the marker, fsync, evict stale segments.
/// Returns the marker's LSN.
pub fn run_checkpoint(wal: &Wal, flush: &dyn Fn() -> Result<()>) -> Result<Lsn> {
    flush()?;
    let lsn = wal.append(0, WalOp::Checkpoint, b"", b"")?;
    wal.fsync()?;
    wal.truncate_old()?;
    info!(lsn, "checkpoint complete");
    Ok(lsn)
}

/// Background task appending periodic checkpoint markers
pub struct Checkpointer {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Checkpointer {
    /// Spawn the checkpoint thread, ticking every `interval`
    pub fn start(wal: Arc<Wal>, interval: Duration, flush: FlushFn) -> Result<Checkpointer> {
        let (shutdown, ticker) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("treestore-checkpoint".into())
            .spawn(move || loop {
                match ticker.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = run_checkpoint(&wal, flush.as_ref()) {
                            warn!(error = %e, "periodic checkpoint failed");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| Error::Io(format!("spawn checkpointer: {}", e)))?;
        Ok(Checkpointer { shutdown, handle: Some(handle) })
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
