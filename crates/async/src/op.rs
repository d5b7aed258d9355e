//! Async operation handles.
//!
//! Op handles live in a fixed slab sized by `async.ops_max`. A handle
//! circulates `FREE → READY → ENQUEUED → WORKING → FREE`: allocation
//! claims a free handle with a compare-and-set, the application fills
//! in key/value and posts it, a worker executes it and fires the
//! callback, and the handle returns to the free pool.

use parking_lot::Mutex;
use shale_core::Result;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Handle placed on the work queue.
pub const OP_ENQUEUED: u32 = 0;
/// Handle available for allocation.
pub const OP_FREE: u32 = 1;
/// Handle allocated, being filled in by the application.
pub const OP_READY: u32 = 2;
/// Handle being executed by a worker.
pub const OP_WORKING: u32 = 3;

/// Slab index marking the distinguished flush op.
pub const OP_INVALID_ID: u32 = u32::MAX;

/// What an async op does when a worker picks it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsyncOpType {
    /// Not yet assigned
    #[default]
    None,
    /// Point lookup
    Search,
    /// Insert a key/value pair
    Insert,
    /// Update a key
    Update,
    /// Remove a key
    Remove,
    /// Compact the underlying object
    Compact,
}

/// Completion callback for one async op.
pub trait AsyncCallback: Send + Sync {
    /// Called by the worker after the operation runs. `value` carries
    /// the result of a search, `None` otherwise.
    fn on_complete(&self, op: &AsyncOp, result: Result<Option<Vec<u8>>>);
}

/// One operation handle.
pub struct AsyncOp {
    /// Slab position; `OP_INVALID_ID` for the flush op
    internal_id: u32,
    /// Unique id assigned at allocation
    unique_id: AtomicU64,
    state: AtomicU32,
    /// Fields owned by whoever holds the handle in its current state
    data: Mutex<OpData>,
}

#[derive(Default)]
struct OpData {
    optype: AsyncOpType,
    key: Vec<u8>,
    value: Vec<u8>,
    callback: Option<Arc<dyn AsyncCallback>>,
}

impl AsyncOp {
    pub(crate) fn new(internal_id: u32) -> Self {
        AsyncOp {
            internal_id,
            unique_id: AtomicU64::new(0),
            state: AtomicU32::new(OP_FREE),
            data: Mutex::new(OpData::default()),
        }
    }

    /// Slab position of this handle.
    pub fn internal_id(&self) -> u32 {
        self.internal_id
    }

    /// Unique id of the current use of this handle.
    pub fn unique_id(&self) -> u64 {
        self.unique_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_unique_id(&self, id: u64) {
        self.unique_id.store(id, Ordering::Release);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: u32) {
        self.state.store(state, Ordering::Release);
    }

    pub(crate) fn cas_state(&self, from: u32, to: u32) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The operation type.
    pub fn optype(&self) -> AsyncOpType {
        self.data.lock().optype
    }

    pub(crate) fn set_optype(&self, optype: AsyncOpType) {
        self.data.lock().optype = optype;
    }

    /// Set the operation's key.
    pub fn set_key(&self, key: &[u8]) {
        let mut data = self.data.lock();
        data.key.clear();
        data.key.extend_from_slice(key);
    }

    /// Set the operation's value.
    pub fn set_value(&self, value: &[u8]) {
        let mut data = self.data.lock();
        data.value.clear();
        data.value.extend_from_slice(value);
    }

    /// The operation's key.
    pub fn key(&self) -> Vec<u8> {
        self.data.lock().key.clone()
    }

    /// The operation's value.
    pub fn value(&self) -> Vec<u8> {
        self.data.lock().value.clone()
    }

    pub(crate) fn set_callback(&self, callback: Option<Arc<dyn AsyncCallback>>) {
        self.data.lock().callback = callback;
    }

    pub(crate) fn callback(&self) -> Option<Arc<dyn AsyncCallback>> {
        self.data.lock().callback.clone()
    }

    /// Reset the handle for reuse.
    pub(crate) fn clear(&self) {
        let mut data = self.data.lock();
        data.optype = AsyncOpType::None;
        data.key.clear();
        data.value.clear();
        data.callback = None;
    }
}
