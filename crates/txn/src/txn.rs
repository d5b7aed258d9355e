//! Per-session transactions.
//!
//! A `TxnSession` owns one slot in the global state array and runs one
//! transaction at a time. Readers may run without an id; writers take
//! one lazily at their first update. Each update logs an operation
//! into the transaction's mod list; commit packs the list into a
//! single log record and hands it to the WAL, rollback marks every
//! update aborted and never fails.

use crate::global::{TxnGlobal, TXN_ABORTED, TXN_NONE};
use crate::snapshot::SnapshotData;
use shale_core::{Error, Isolation, Result};
use shale_wal::{LogRecord, SyncLevel, TxnOp, WalWriter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Observer notified when transactions resolve.
pub trait TxnNotify: Send + Sync {
    /// Called once per resolved transaction with its id and outcome.
    fn notify(&self, txnid: u64, committed: bool);
}

/// The transaction id attached to one update.
///
/// Updates in the data store share this cell with the transaction's
/// mod list. Rollback does not chase updates through the store; it
/// stores the aborted sentinel here and readers discover it lazily
/// through their visibility checks.
#[derive(Debug)]
pub struct UpdateCell(AtomicU64);

impl UpdateCell {
    /// Create a cell for an update by `txnid`.
    pub fn new(txnid: u64) -> Arc<Self> {
        Arc::new(UpdateCell(AtomicU64::new(txnid)))
    }

    /// The owning transaction id, or the aborted sentinel.
    pub fn txnid(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Mark the update rolled back.
    pub fn abort(&self) {
        self.0.store(TXN_ABORTED, Ordering::Release);
    }
}

/// One entry in a transaction's mod list.
#[derive(Debug)]
struct TxnMod {
    op: TxnOp,
    cell: Option<Arc<UpdateCell>>,
}

/// A session's transaction state.
pub struct TxnSession {
    global: Arc<TxnGlobal>,
    slot: usize,
    isolation: Isolation,
    running: bool,
    id: u64,
    snapshot: Option<SnapshotData>,
    sync: SyncLevel,
    mods: Vec<TxnMod>,
    notify: Option<Arc<dyn TxnNotify>>,
}

impl TxnSession {
    /// Open a session against the global state.
    pub fn new(global: Arc<TxnGlobal>) -> Result<Self> {
        let slot = global
            .register_session()
            .ok_or(Error::Busy("session slots exhausted"))?;
        Ok(TxnSession {
            global,
            slot,
            isolation: Isolation::default(),
            running: false,
            id: TXN_NONE,
            snapshot: None,
            sync: SyncLevel::default(),
            mods: Vec::new(),
            notify: None,
        })
    }

    /// The session's slot in the global state array.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The shared global state.
    pub fn global(&self) -> &Arc<TxnGlobal> {
        &self.global
    }

    /// Whether a transaction is running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The running transaction's isolation level.
    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// The transaction id, `TXN_NONE` until the first write.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the transaction has made updates.
    pub fn has_mods(&self) -> bool {
        !self.mods.is_empty()
    }

    /// Register a resolve observer.
    pub fn set_notify(&mut self, notify: Arc<dyn TxnNotify>) {
        self.notify = Some(notify);
    }

    /// Begin a transaction.
    pub fn begin(&mut self, isolation: Isolation, sync: SyncLevel) -> Result<()> {
        if self.running {
            return Err(Error::InvalidArgument(
                "transaction already running".to_string(),
            ));
        }
        self.isolation = isolation;
        self.sync = sync;
        self.running = true;
        self.id = TXN_NONE;
        self.snapshot = None;
        self.mods.clear();

        if isolation == Isolation::Snapshot {
            self.refresh_snapshot();
        }
        tracing::trace!(target: "shale::txn", slot = self.slot, ?isolation, "begin");
        Ok(())
    }

    /// Prepare for a cursor operation: read-committed refreshes its
    /// snapshot per operation, snapshot isolation pins the one taken
    /// at begin.
    pub fn cursor_op(&mut self) {
        match self.isolation {
            Isolation::ReadCommitted => self.refresh_snapshot(),
            Isolation::Snapshot | Isolation::SnapshotNamed => {
                if self.snapshot.is_none() {
                    self.refresh_snapshot();
                }
            }
            Isolation::ReadUncommitted => {}
        }
    }

    fn refresh_snapshot(&mut self) {
        self.snapshot = Some(self.global.build_snapshot(self.slot));
    }

    /// Seed the transaction's snapshot from a named snapshot's saved
    /// view.
    pub(crate) fn set_named_snapshot(&mut self, snapshot: SnapshotData) {
        self.global
            .state(self.slot)
            .snap_min
            .store(snapshot.snap_min, Ordering::Release);
        self.snapshot = Some(snapshot);
        self.isolation = Isolation::SnapshotNamed;
    }

    /// The transaction's current snapshot, if one has been taken.
    pub fn snapshot(&self) -> Option<&SnapshotData> {
        self.snapshot.as_ref()
    }

    /// Allocate the transaction's id if it doesn't have one yet.
    ///
    /// Writers call this on their first update; readers never do.
    pub fn id_check(&mut self) -> Result<u64> {
        if !self.running {
            return Err(Error::InvalidArgument(
                "no transaction is running".to_string(),
            ));
        }
        if self.id == TXN_NONE {
            self.id = self.global.alloc_id(self.slot);
            tracing::trace!(target: "shale::txn", slot = self.slot, id = self.id, "id allocated");
        }
        Ok(self.id)
    }

    /// Whether updates by `txnid` are visible to this transaction.
    pub fn visible(&self, txnid: u64) -> bool {
        if txnid == TXN_NONE {
            return true;
        }
        if txnid == TXN_ABORTED {
            return false;
        }
        // A transaction sees its own updates.
        if self.id != TXN_NONE && txnid == self.id {
            return true;
        }
        match self.isolation {
            Isolation::ReadUncommitted => true,
            Isolation::ReadCommitted | Isolation::Snapshot | Isolation::SnapshotNamed => {
                match &self.snapshot {
                    Some(snapshot) => snapshot.visible(txnid),
                    // No snapshot yet: fall back to resolved-only.
                    None => self.global.visible_all(txnid),
                }
            }
        }
    }

    /// Whether updates by `txnid` are visible to every session.
    pub fn visible_all(&self, txnid: u64) -> bool {
        self.global.visible_all(txnid)
    }

    /// Record an operation in the transaction's mod list.
    ///
    /// `cell` links the data-store update so rollback can mark it
    /// aborted.
    pub fn log_op(&mut self, op: TxnOp, cell: Option<Arc<UpdateCell>>) -> Result<()> {
        if !self.running || self.id == TXN_NONE {
            return Err(Error::InvalidArgument(
                "operation logged outside a write transaction".to_string(),
            ));
        }
        self.mods.push(TxnMod { op, cell });
        Ok(())
    }

    /// Commit the transaction.
    ///
    /// Packs the mod list into one commit record, appends it to the
    /// WAL at the transaction's sync level, notifies observers and
    /// releases the transaction. If the WAL append fails the
    /// transaction is rolled back and the error returned.
    pub fn commit(&mut self, wal: Option<&WalWriter>) -> Result<()> {
        if !self.running {
            return Err(Error::InvalidArgument(
                "commit without a running transaction".to_string(),
            ));
        }

        if let (Some(wal), false) = (wal, self.mods.is_empty()) {
            let ops: Vec<TxnOp> = self.mods.iter().map(|m| m.op.clone()).collect();
            let record = LogRecord::Commit {
                txnid: self.id,
                ops: TxnOp::pack_list(&ops),
            };
            if let Err(e) = wal.append(&record, self.sync) {
                tracing::warn!(target: "shale::txn", id = self.id, error = %e, "commit log failed");
                self.rollback();
                return Err(e);
            }
        }

        let id = self.id;
        tracing::trace!(target: "shale::txn", slot = self.slot, id, mods = self.mods.len(), "commit");
        if let Some(notify) = &self.notify {
            notify.notify(id, true);
        }
        self.release();
        Ok(())
    }

    /// Roll the transaction back. Never fails; calling without a
    /// running transaction is a no-op.
    pub fn rollback(&mut self) {
        if !self.running {
            return;
        }
        for m in &self.mods {
            if let Some(cell) = &m.cell {
                cell.abort();
            }
        }
        let id = self.id;
        tracing::trace!(target: "shale::txn", slot = self.slot, id, "rollback");
        if let Some(notify) = &self.notify {
            notify.notify(id, false);
        }
        self.release();
    }

    fn release(&mut self) {
        self.global.state(self.slot).clear();
        self.running = false;
        self.id = TXN_NONE;
        self.snapshot = None;
        self.mods.clear();
        // Resolving a transaction is the natural point to let the
        // oldest-id watermark catch up.
        self.global.update_oldest(false);
    }
}

impl Drop for TxnSession {
    fn drop(&mut self) {
        self.rollback();
        self.global.release_session(self.slot);
    }
}
