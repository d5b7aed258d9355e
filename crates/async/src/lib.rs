//! Async operation subsystem for Shale
//!
//! Applications post operations on reusable op handles instead of
//! waiting on each call: a bounded multi-producer/multi-consumer ring
//! feeds a worker pool, completions arrive through callbacks, and a
//! flush barrier waits for everything posted before it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod op;
pub mod queue;

pub use op::{
    AsyncCallback, AsyncOp, AsyncOpType, OP_ENQUEUED, OP_FREE, OP_INVALID_ID, OP_READY, OP_WORKING,
};
pub use queue::{AsyncOpHandle, AsyncSink, AsyncSystem};
