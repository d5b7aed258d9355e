//! The async work queue and worker pool.
//!
//! Pending operations travel through a bounded multi-producer,
//! multi-consumer ring of op references. Two pairs of ever-increasing
//! sequence counters run the ring without locks:
//!
//! - `alloc_head`: next sequence a producer claims
//! - `head`: last sequence published to consumers; a producer waits
//!   its turn so slots become visible in order
//! - `alloc_tail`: last sequence a consumer claimed
//! - `tail_slot`: slot of the last *completed* consumption; producers
//!   about to wrap wait for it, and completions publish it in order
//!
//! The ring holds `ops_max + 2` slots: one spare so head and tail
//! never become ambiguous, one for the distinguished flush op.

use crate::op::{
    AsyncCallback, AsyncOp, AsyncOpType, OP_ENQUEUED, OP_FREE, OP_INVALID_ID, OP_READY,
    OP_WORKING,
};
use parking_lot::{Condvar, Mutex};
use shale_core::{AsyncConfig, Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// No flush in progress.
const FLUSH_NONE: u32 = 0;
/// The flush has drained the queue; wake the caller.
const FLUSH_COMPLETE: u32 = 1;
/// A flush owner exists; other callers convoy behind it.
const FLUSH_IN_PROGRESS: u32 = 2;
/// Workers have seen the flush op.
const FLUSH_FLUSHING: u32 = 3;

/// Maximum worker yields before sleeping.
const MAX_ASYNC_YIELD: u32 = 200;
/// Maximum worker sleep waiting for work.
const MAX_ASYNC_SLEEP: Duration = Duration::from_micros(100_000);

/// Ring slot encoding: empty.
const SLOT_EMPTY: u64 = 0;
/// Ring slot encoding: the flush op.
const SLOT_FLUSH: u64 = 1;

/// Where async workers apply operations.
pub trait AsyncSink: Send + Sync {
    /// Point lookup.
    fn search(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    /// Insert a key/value pair.
    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()>;
    /// Update a key.
    fn update(&self, key: &[u8], value: &[u8]) -> Result<()>;
    /// Remove a key.
    fn remove(&self, key: &[u8]) -> Result<()>;
    /// Compact the underlying object.
    fn compact(&self) -> Result<()>;
}

/// The async subsystem: op slab, ring, flush machinery, workers.
pub struct AsyncSystem {
    cfg: AsyncConfig,
    sink: Arc<dyn AsyncSink>,

    ops: Vec<Arc<AsyncOp>>,
    /// Where the next allocation scan starts; frees are roughly FIFO
    /// so a free handle is usually right here
    ops_index: AtomicU32,
    op_id: AtomicU64,

    queue: Vec<AtomicU64>,
    alloc_head: AtomicU64,
    head: AtomicU64,
    alloc_tail: AtomicU64,
    tail_slot: AtomicU64,

    flush_state: AtomicU32,
    flush_op: Arc<AsyncOp>,
    flush_lock: Mutex<()>,
    flush_cond: Condvar,

    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// An application's handle on one pending operation.
pub struct AsyncOpHandle {
    system: Arc<AsyncSystem>,
    op: Arc<AsyncOp>,
}

impl AsyncOpHandle {
    /// The wrapped op.
    pub fn op(&self) -> &AsyncOp {
        &self.op
    }

    /// Unique id of this use of the handle.
    pub fn unique_id(&self) -> u64 {
        self.op.unique_id()
    }

    /// Set the operation's key.
    pub fn set_key(&self, key: &[u8]) {
        self.op.set_key(key);
    }

    /// Set the operation's value.
    pub fn set_value(&self, value: &[u8]) {
        self.op.set_value(value);
    }

    fn wrap(&self, optype: AsyncOpType) -> Result<()> {
        self.op.set_optype(optype);
        self.system.enqueue(&self.op)
    }

    /// Post a search.
    pub fn search(&self) -> Result<()> {
        self.wrap(AsyncOpType::Search)
    }

    /// Post an insert.
    pub fn insert(&self) -> Result<()> {
        self.wrap(AsyncOpType::Insert)
    }

    /// Post an update.
    pub fn update(&self) -> Result<()> {
        self.wrap(AsyncOpType::Update)
    }

    /// Post a remove.
    pub fn remove(&self) -> Result<()> {
        self.wrap(AsyncOpType::Remove)
    }

    /// Post a compaction.
    pub fn compact(&self) -> Result<()> {
        self.wrap(AsyncOpType::Compact)
    }
}

impl AsyncSystem {
    /// Start the subsystem: allocate the op slab and ring, spawn the
    /// worker threads.
    pub fn start(cfg: AsyncConfig, sink: Arc<dyn AsyncSink>) -> Result<Arc<Self>> {
        cfg.validate()?;
        let ops_max = cfg.ops_max.max(10);
        // One spare slot plus one for the flush op.
        let qsize = ops_max as usize + 2;

        let system = Arc::new(AsyncSystem {
            cfg: cfg.clone(),
            sink,
            ops: (0..ops_max).map(|i| Arc::new(AsyncOp::new(i))).collect(),
            ops_index: AtomicU32::new(0),
            op_id: AtomicU64::new(0),
            queue: (0..qsize).map(|_| AtomicU64::new(SLOT_EMPTY)).collect(),
            alloc_head: AtomicU64::new(0),
            head: AtomicU64::new(0),
            alloc_tail: AtomicU64::new(0),
            tail_slot: AtomicU64::new(0),
            flush_state: AtomicU32::new(FLUSH_NONE),
            flush_op: Arc::new(AsyncOp::new(OP_INVALID_ID)),
            flush_lock: Mutex::new(()),
            flush_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = system.workers.lock();
        for i in 0..cfg.threads {
            let system = Arc::clone(&system);
            let handle = std::thread::Builder::new()
                .name(format!("shale-async-worker-{i}"))
                .spawn(move || system.worker_loop())
                .map_err(Error::Io)?;
            workers.push(handle);
        }
        drop(workers);
        tracing::debug!(
            target: "shale::async",
            ops_max, threads = cfg.threads,
            "async subsystem started"
        );
        Ok(system)
    }

    /// Allocate an op handle, `Busy` when all are in flight.
    pub fn new_op_on(
        system: Arc<AsyncSystem>,
        callback: Arc<dyn AsyncCallback>,
    ) -> Result<AsyncOpHandle> {
        let size = system.ops.len() as u32;
        let start = system.ops_index.load(Ordering::Acquire) % size;

        // Scan forward from the last allocation point; frees are
        // mostly FIFO so this usually hits immediately.
        for offset in 0..size {
            let i = ((start + offset) % size) as usize;
            let op = &system.ops[i];
            if op.cas_state(OP_FREE, OP_READY) {
                let id = system.op_id.fetch_add(1, Ordering::AcqRel) + 1;
                op.set_unique_id(id);
                op.clear();
                op.set_callback(Some(callback));
                system
                    .ops_index
                    .store((i as u32 + 1) % size, Ordering::Release);
                let op = Arc::clone(op);
                return Ok(AsyncOpHandle { system, op });
            }
        }
        Err(Error::Busy("no free async op handles"))
    }

    fn slot_encode(op: &AsyncOp) -> u64 {
        if op.internal_id() == OP_INVALID_ID {
            SLOT_FLUSH
        } else {
            op.internal_id() as u64 + 2
        }
    }

    fn slot_decode(&self, encoded: u64) -> Arc<AsyncOp> {
        if encoded == SLOT_FLUSH {
            Arc::clone(&self.flush_op)
        } else {
            Arc::clone(&self.ops[(encoded - 2) as usize])
        }
    }

    /// Enqueue an op at the tail of the work queue.
    pub fn enqueue(&self, op: &AsyncOp) -> Result<()> {
        // An application reusing a handle it already posted shows up
        // here with the wrong state.
        if op.state() != OP_READY {
            return Err(Error::InvalidArgument(
                "async op handle already in use".to_string(),
            ));
        }

        let qsize = self.queue.len() as u64;
        let my_alloc = self.alloc_head.fetch_add(1, Ordering::AcqRel) + 1;
        let my_slot = my_alloc % qsize;

        // Don't wrap onto a slot whose previous occupant hasn't been
        // fully consumed.
        while self.tail_slot.load(Ordering::Acquire) == my_slot {
            std::thread::yield_now();
        }

        debug_assert_eq!(self.queue[my_slot as usize].load(Ordering::Acquire), SLOT_EMPTY);
        self.queue[my_slot as usize].store(Self::slot_encode(op), Ordering::Release);
        op.set_state(OP_ENQUEUED);

        // Several producers may be publishing; wait our turn so a
        // consumer never observes a slot whose predecessor is empty.
        while self.head.load(Ordering::Acquire) != my_alloc - 1 {
            std::thread::yield_now();
        }
        self.head.store(my_alloc, Ordering::Release);
        Ok(())
    }

    /// Run one flush to completion: at most one flush owner at a time,
    /// returning once every op enqueued before it has finished.
    pub fn flush(&self) -> Result<()> {
        loop {
            // Convoy behind any flush already running; it may be
            // waiting on ops this caller doesn't care about, but a
            // later call could need ours.
            while self.flush_state.load(Ordering::Acquire) != FLUSH_NONE {
                std::thread::sleep(Duration::from_millis(100));
            }
            if self
                .flush_state
                .compare_exchange(
                    FLUSH_NONE,
                    FLUSH_IN_PROGRESS,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }

        debug_assert_eq!(self.flush_op.state(), OP_FREE);
        self.flush_op.set_state(OP_READY);
        self.enqueue(&self.flush_op)?;

        {
            let mut guard = self.flush_lock.lock();
            while self.flush_state.load(Ordering::Acquire) != FLUSH_COMPLETE {
                self.flush_cond
                    .wait_for(&mut guard, Duration::from_millis(100));
            }
        }

        self.flush_op.set_state(OP_FREE);
        self.flush_state.store(FLUSH_NONE, Ordering::Release);
        Ok(())
    }

    /// Stop the workers, draining pending work first.
    pub fn shutdown(&self) {
        {
            let workers = self.workers.lock();
            if workers.is_empty() {
                return;
            }
        }
        let _ = self.flush();
        self.shutdown.store(true, Ordering::Release);
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------------
    // Workers

    fn worker_loop(&self) {
        let mut yields = 0u32;
        let mut sleep = Duration::from_micros(10);
        loop {
            if let Some(seq) = self.try_claim() {
                self.consume(seq);
                yields = 0;
                sleep = Duration::from_micros(10);
                continue;
            }
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            // Bounded yields, then escalating sleeps.
            if yields < MAX_ASYNC_YIELD {
                yields += 1;
                std::thread::yield_now();
            } else {
                std::thread::sleep(sleep);
                sleep = (sleep * 2).min(MAX_ASYNC_SLEEP);
            }
        }
    }

    fn try_claim(&self) -> Option<u64> {
        loop {
            let tail = self.alloc_tail.load(Ordering::Acquire);
            if tail >= self.head.load(Ordering::Acquire) {
                return None;
            }
            if self
                .alloc_tail
                .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(tail + 1);
            }
        }
    }

    /// Process the op at sequence `seq`: execute it, fire its
    /// callback, then publish the consumption in order.
    fn consume(&self, seq: u64) {
        let qsize = self.queue.len() as u64;
        let my_slot = seq % qsize;
        let encoded = self.queue[my_slot as usize].swap(SLOT_EMPTY, Ordering::AcqRel);
        debug_assert_ne!(encoded, SLOT_EMPTY, "consumed an unpublished slot");
        let op = self.slot_decode(encoded);

        if op.internal_id() == OP_INVALID_ID {
            // The flush barrier: every earlier op has completed once
            // the tail catches up to our predecessor.
            self.flush_state.store(FLUSH_FLUSHING, Ordering::Release);
            self.wait_turn(seq);
            self.tail_slot.store(my_slot, Ordering::Release);
            {
                let _guard = self.flush_lock.lock();
                self.flush_state.store(FLUSH_COMPLETE, Ordering::Release);
            }
            self.flush_cond.notify_all();
            return;
        }

        op.set_state(OP_WORKING);
        let result = self.execute(&op);
        if let Some(callback) = op.callback() {
            callback.on_complete(&op, result);
        } else if let Err(e) = result {
            tracing::error!(target: "shale::async", error = %e, "async op failed");
        }

        // Completions publish in order: the callback has fired by the
        // time a flush or wrapping producer observes the slot free.
        self.wait_turn(seq);
        self.tail_slot.store(my_slot, Ordering::Release);

        op.clear();
        op.set_state(OP_FREE);
    }

    fn wait_turn(&self, seq: u64) {
        let qsize = self.queue.len() as u64;
        let prev_slot = (seq - 1) % qsize;
        while self.tail_slot.load(Ordering::Acquire) != prev_slot {
            std::thread::yield_now();
        }
    }

    fn execute(&self, op: &AsyncOp) -> Result<Option<Vec<u8>>> {
        let key = op.key();
        match op.optype() {
            AsyncOpType::Search => self.sink.search(&key),
            AsyncOpType::Insert => self.sink.insert(&key, &op.value()).map(|()| None),
            AsyncOpType::Update => self.sink.update(&key, &op.value()).map(|()| None),
            AsyncOpType::Remove => self.sink.remove(&key).map(|()| None),
            AsyncOpType::Compact => self.sink.compact().map(|()| None),
            AsyncOpType::None => Err(Error::InvalidArgument(
                "async op enqueued without an operation".to_string(),
            )),
        }
    }

    /// The configured worker count.
    pub fn threads(&self) -> u32 {
        self.cfg.threads
    }

    #[cfg(test)]
    pub(crate) fn test_consume_one(&self) -> bool {
        match self.try_claim() {
            Some(seq) => {
                self.consume(seq);
                true
            }
            None => false,
        }
    }
}

impl Drop for AsyncSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
