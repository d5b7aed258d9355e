//! Global transaction state.
//!
//! One `TxnGlobal` per connection: the id counter, a per-session state
//! array published for lock-free snapshot scans, and the oldest-id
//! bookkeeping that decides when old updates are globally visible.
//!
//! Snapshot builders coexist by incrementing `scan_count`; the
//! exclusive oldest-id advance waits for the count to reach zero and
//! parks it at -1 while it walks the array.

use crate::snapshot::SnapshotData;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};

/// No transaction is running in a session.
pub const TXN_NONE: u64 = 0;
/// The first transaction id a connection allocates.
pub const TXN_FIRST: u64 = 1;
/// The update was rolled back; no snapshot ever sees it.
pub const TXN_ABORTED: u64 = u64::MAX;

/// Sentinel for "no session" in the checkpoint-slot register.
const NO_SLOT: usize = usize::MAX;

/// Per-session transaction state, published for other sessions' scans.
#[derive(Debug)]
pub struct TxnState {
    /// The session's transaction id, `TXN_NONE` when it has none
    pub id: AtomicU64,
    /// The session's published snapshot minimum
    pub snap_min: AtomicU64,
}

impl TxnState {
    fn new() -> Self {
        TxnState {
            id: AtomicU64::new(TXN_NONE),
            snap_min: AtomicU64::new(TXN_NONE),
        }
    }

    /// Clear both fields.
    pub fn clear(&self) {
        self.id.store(TXN_NONE, Ordering::Release);
        self.snap_min.store(TXN_NONE, Ordering::Release);
    }
}

/// Connection-wide transaction state.
#[derive(Debug)]
pub struct TxnGlobal {
    /// Serializes id allocation
    id_lock: Mutex<()>,
    /// Last allocated transaction id
    current: AtomicU64,
    /// Oldest id that was running at the last oldest-id scan
    last_running: AtomicU64,
    /// Updates by ids below this are visible to every session
    oldest_id: AtomicU64,
    /// Count of snapshot scans in flight, or -1 for an exclusive scan
    scan_count: AtomicI32,
    /// Session slot running a checkpoint, `NO_SLOT` when none
    checkpoint_slot: AtomicUsize,
    /// Snapshot minimum pinned by the running checkpoint
    checkpoint_pinned: AtomicU64,
    /// Oldest named snapshot's minimum, `TXN_NONE` when none
    nsnap_oldest: AtomicU64,
    /// Per-session states
    states: Vec<TxnState>,
    /// Session slot allocation
    slots: Mutex<Vec<bool>>,
}

impl TxnGlobal {
    /// Create global state for up to `session_max` sessions.
    pub fn new(session_max: usize) -> Self {
        TxnGlobal {
            id_lock: Mutex::new(()),
            current: AtomicU64::new(TXN_NONE),
            last_running: AtomicU64::new(TXN_FIRST),
            oldest_id: AtomicU64::new(TXN_FIRST),
            scan_count: AtomicI32::new(0),
            checkpoint_slot: AtomicUsize::new(NO_SLOT),
            checkpoint_pinned: AtomicU64::new(TXN_NONE),
            nsnap_oldest: AtomicU64::new(TXN_NONE),
            states: (0..session_max).map(|_| TxnState::new()).collect(),
            slots: Mutex::new(vec![false; session_max]),
        }
    }

    /// Claim a session slot.
    pub fn register_session(&self) -> Option<usize> {
        let mut slots = self.slots.lock();
        let slot = slots.iter().position(|used| !used)?;
        slots[slot] = true;
        self.states[slot].clear();
        Some(slot)
    }

    /// Release a session slot.
    pub fn release_session(&self, slot: usize) {
        self.states[slot].clear();
        self.slots.lock()[slot] = false;
    }

    /// The published state for a slot.
    pub fn state(&self, slot: usize) -> &TxnState {
        &self.states[slot]
    }

    /// Last allocated transaction id.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Seed the id counter above ids recovered from the log.
    pub fn set_recovered_id(&self, max_seen: u64) {
        let _lock = self.id_lock.lock();
        let cur = self.current.load(Ordering::Acquire);
        if max_seen > cur {
            self.current.store(max_seen, Ordering::Release);
        }
    }

    /// Allocate the next transaction id and publish it to the slot.
    ///
    /// Ids are strictly increasing and never reused within a process
    /// lifetime; wrap would take centuries at any plausible rate and
    /// the design forbids it within a run.
    pub fn alloc_id(&self, slot: usize) -> u64 {
        let _lock = self.id_lock.lock();
        let id = self
            .current
            .load(Ordering::Acquire)
            .checked_add(1)
            .expect("transaction id space exhausted");
        self.states[slot].id.store(id, Ordering::Release);
        self.current.store(id, Ordering::Release);
        id
    }

    /// Allocate an id not tied to any session.
    ///
    /// Sealing an LSM chunk consumes an id this way: the switch id
    /// orders the chunk against transactions without a session of its
    /// own running anything.
    pub fn new_id(&self) -> u64 {
        let _lock = self.id_lock.lock();
        let id = self
            .current
            .load(Ordering::Acquire)
            .checked_add(1)
            .expect("transaction id space exhausted");
        self.current.store(id, Ordering::Release);
        id
    }

    /// Build a snapshot for the session in `slot`.
    ///
    /// Runs under a shared scan: concurrent builders coexist, the
    /// exclusive oldest-id advance is held off while any are inside.
    pub fn build_snapshot(&self, slot: usize) -> SnapshotData {
        self.scan_enter();

        // Everything at or above max is invisible by construction.
        let max = self.current.load(Ordering::Acquire) + 1;
        let mut min = max;
        let mut ids: SmallVec<[u64; 8]> = SmallVec::new();

        let ckpt_slot = self.checkpoint_slot.load(Ordering::Acquire);
        for (i, state) in self.states.iter().enumerate() {
            if i == slot {
                continue;
            }
            // The checkpoint's transaction can run for a long time and
            // is tracked through its own pin, not through every
            // snapshot in the system.
            if i == ckpt_slot {
                continue;
            }
            let id = state.id.load(Ordering::Acquire);
            if id != TXN_NONE && id < max {
                ids.push(id);
                min = min.min(id);
            }
        }

        self.states[slot].snap_min.store(min, Ordering::Release);
        self.scan_exit();

        ids.sort_unstable();
        SnapshotData::new(min, max, ids)
    }

    fn scan_enter(&self) {
        loop {
            let count = self.scan_count.load(Ordering::Acquire);
            if count < 0 {
                std::thread::yield_now();
                continue;
            }
            if self
                .scan_count
                .compare_exchange_weak(count, count + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn scan_exit(&self) {
        self.scan_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Advance the oldest-id watermark.
    ///
    /// Needs the scan count at zero; gives up after a bounded spin
    /// unless `force` is set, since the watermark is advisory and the
    /// next caller will try again.
    pub fn update_oldest(&self, force: bool) {
        let mut spins = 0u32;
        loop {
            if self
                .scan_count
                .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            spins += 1;
            if !force && spins > 100 {
                return;
            }
            std::thread::yield_now();
        }

        let mut oldest = self.current.load(Ordering::Acquire) + 1;
        let mut running = oldest;
        for state in &self.states {
            let id = state.id.load(Ordering::Acquire);
            if id != TXN_NONE {
                oldest = oldest.min(id);
                running = running.min(id);
            }
            let snap_min = state.snap_min.load(Ordering::Acquire);
            if snap_min != TXN_NONE {
                oldest = oldest.min(snap_min);
            }
        }
        let nsnap = self.nsnap_oldest.load(Ordering::Acquire);
        if nsnap != TXN_NONE {
            oldest = oldest.min(nsnap);
        }
        let pinned = self.checkpoint_pinned.load(Ordering::Acquire);
        if pinned != TXN_NONE {
            oldest = oldest.min(pinned);
        }

        // The watermark only moves forward.
        if oldest > self.oldest_id.load(Ordering::Acquire) {
            self.oldest_id.store(oldest, Ordering::Release);
        }
        if running > self.last_running.load(Ordering::Acquire) {
            self.last_running.store(running, Ordering::Release);
        }

        self.scan_count.store(0, Ordering::Release);
    }

    /// The current oldest-id watermark.
    pub fn oldest_id(&self) -> u64 {
        self.oldest_id.load(Ordering::Acquire)
    }

    /// The oldest id that was running at the last scan.
    pub fn last_running(&self) -> u64 {
        self.last_running.load(Ordering::Acquire)
    }

    /// Whether updates by `id` are visible to every session.
    pub fn visible_all(&self, id: u64) -> bool {
        id != TXN_ABORTED && id < self.oldest_id()
    }

    /// Mark `slot` as the checkpoint session and pin its snapshot
    /// minimum out of regular visibility scans.
    pub fn checkpoint_begin(&self, slot: usize, snap_min: u64) {
        self.checkpoint_pinned.store(snap_min, Ordering::Release);
        self.checkpoint_slot.store(slot, Ordering::Release);
    }

    /// Clear the checkpoint registration.
    pub fn checkpoint_end(&self) {
        self.checkpoint_slot.store(NO_SLOT, Ordering::Release);
        self.checkpoint_pinned.store(TXN_NONE, Ordering::Release);
    }

    /// Publish the oldest named snapshot's minimum.
    pub(crate) fn set_nsnap_oldest(&self, id: u64) {
        self.nsnap_oldest.store(id, Ordering::Release);
    }

    /// The oldest named snapshot's minimum, `TXN_NONE` when none exist.
    pub fn nsnap_oldest(&self) -> u64 {
        self.nsnap_oldest.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ids_strictly_increase() {
        let global = TxnGlobal::new(4);
        let a = global.register_session().unwrap();
        let b = global.register_session().unwrap();
        assert_eq!(global.alloc_id(a), TXN_FIRST);
        assert_eq!(global.alloc_id(b), 2);
        assert_eq!(global.alloc_id(a), 3);
        assert_eq!(global.current(), 3);
    }

    #[test]
    fn test_slot_exhaustion_and_reuse() {
        let global = TxnGlobal::new(2);
        let a = global.register_session().unwrap();
        let _b = global.register_session().unwrap();
        assert!(global.register_session().is_none());
        global.release_session(a);
        assert_eq!(global.register_session(), Some(a));
    }

    #[test]
    fn test_snapshot_sees_concurrent_ids() {
        let global = TxnGlobal::new(4);
        let a = global.register_session().unwrap();
        let b = global.register_session().unwrap();

        let id_a = global.alloc_id(a);
        let snap = global.build_snapshot(b);
        assert_eq!(snap.snap_min, id_a);
        assert_eq!(snap.snap_max, id_a + 1);
        assert!(snap.contains(id_a));
    }

    #[test]
    fn test_snapshot_with_no_concurrents() {
        let global = TxnGlobal::new(4);
        let a = global.register_session().unwrap();
        let b = global.register_session().unwrap();
        let id_a = global.alloc_id(a);
        global.state(a).clear();

        let snap = global.build_snapshot(b);
        assert_eq!(snap.snap_min, id_a + 1);
        assert_eq!(snap.snap_max, id_a + 1);
        assert!(snap.is_empty());
    }

    #[test]
    fn test_oldest_id_monotone() {
        let global = TxnGlobal::new(4);
        let a = global.register_session().unwrap();

        let id = global.alloc_id(a);
        global.update_oldest(true);
        assert_eq!(global.oldest_id(), id);
        assert!(!global.visible_all(id));

        global.state(a).clear();
        global.update_oldest(true);
        assert_eq!(global.oldest_id(), id + 1);
        assert!(global.visible_all(id));
        assert!(!global.visible_all(TXN_ABORTED));
    }

    #[test]
    fn test_oldest_respects_published_snap_min() {
        let global = TxnGlobal::new(4);
        let a = global.register_session().unwrap();
        let b = global.register_session().unwrap();

        let id_a = global.alloc_id(a);
        // Session b has no id but holds a snapshot pinned at id_a.
        let _snap = global.build_snapshot(b);
        global.state(a).clear();

        global.update_oldest(true);
        assert_eq!(global.oldest_id(), id_a, "b's snapshot pins the watermark");
    }

    #[test]
    fn test_checkpoint_pin_respected() {
        let global = TxnGlobal::new(4);
        let ckpt = global.register_session().unwrap();
        let user = global.register_session().unwrap();

        let pinned = global.alloc_id(ckpt);
        global.checkpoint_begin(ckpt, pinned);

        // Regular snapshots don't carry the checkpoint's id.
        let snap = global.build_snapshot(user);
        assert!(snap.is_empty());

        // But the oldest-id watermark is held back by the pin.
        global.state(ckpt).clear();
        global.update_oldest(true);
        assert_eq!(global.oldest_id(), pinned);

        global.checkpoint_end();
        global.update_oldest(true);
        assert!(global.oldest_id() > pinned);
    }

    #[test]
    fn test_concurrent_snapshot_builders() {
        let global = Arc::new(TxnGlobal::new(16));
        let writer_slot = global.register_session().unwrap();
        global.alloc_id(writer_slot);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let global = Arc::clone(&global);
                std::thread::spawn(move || {
                    let slot = global.register_session().unwrap();
                    for _ in 0..100 {
                        let snap = global.build_snapshot(slot);
                        assert!(snap.snap_min <= snap.snap_max);
                        global.update_oldest(false);
                    }
                    global.release_session(slot);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
