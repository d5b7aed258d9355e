//! Error types for the Shale engine
//!
//! This module defines the engine-wide error taxonomy. Every subsystem
//! converts its local failures into this type at its public boundary.
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! ## Error Categories
//!
//! - **Not Found / Duplicate Key**: cursor-level outcomes, recovered or
//!   reported to the caller
//! - **Rollback / Busy**: contention outcomes, the caller retries
//! - **Corrupt Block / Corrupt File**: checksum, magic or version
//!   mismatch; fatal unless the session opted into quiet corruption
//!   handling (salvage, verify)
//! - **Panic**: an invariant violation detected by the engine; the
//!   connection is poisoned and every later call fails fast

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for Shale operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the Shale engine
#[derive(Debug, Error)]
pub enum Error {
    /// Lookup miss; recovered locally into iterator behavior
    #[error("item not found")]
    NotFound,

    /// Conditional insert found an existing key
    #[error("duplicate key")]
    DuplicateKey,

    /// Snapshot conflict or deadlock; retry the whole transaction
    #[error("conflict with a concurrent transaction")]
    Rollback,

    /// Resource contention; the caller may retry
    #[error("resource busy: {0}")]
    Busy(&'static str),

    /// Block checksum mismatch
    #[error("corrupt block: {0}")]
    CorruptBlock(String),

    /// File magic or version mismatch
    #[error("corrupt file: {0}")]
    CorruptFile(String),

    /// Programmer error; fatal for the call
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not supported by this configuration
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invariant violation; the connection is dead
    #[error("engine panic: {0}")]
    Panic(String),
}

impl Error {
    /// Check if this error is worth retrying from the caller's side.
    ///
    /// Only conflict and contention errors should be retried; everything
    /// else either succeeded somewhere (`NotFound` on a cursor) or is
    /// fatal for the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Rollback | Error::Busy(_))
    }

    /// Check if this error poisons the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Panic(_))
    }

    /// Rank used when several errors compete for a single return slot.
    ///
    /// `Panic` beats everything, cursor outcomes (`NotFound`,
    /// `DuplicateKey`) lose to real failures.
    fn priority(&self) -> u8 {
        match self {
            Error::Panic(_) => 2,
            Error::NotFound | Error::DuplicateKey => 0,
            _ => 1,
        }
    }
}

/// Accumulate errors across a multi-step operation, keeping the most
/// severe one.
///
/// Several block-manager paths free resources on their way out of a
/// failed call; each cleanup step can itself fail. The first error of
/// the highest priority wins: a panic is never masked by a later I/O
/// error, and an I/O error is never masked by a cursor-level
/// `NotFound`/`DuplicateKey`.
#[derive(Debug, Default)]
pub struct ErrorAccumulator {
    err: Option<Error>,
}

impl ErrorAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        ErrorAccumulator { err: None }
    }

    /// Record an error, keeping whichever of the stored and new error
    /// has higher priority. Ties keep the earlier error.
    pub fn set(&mut self, err: Error) {
        match &self.err {
            Some(cur) if cur.priority() >= err.priority() => {}
            _ => self.err = Some(err),
        }
    }

    /// Fold a result into the accumulator, discarding the success value.
    pub fn absorb<T>(&mut self, result: Result<T>) {
        if let Err(e) = result {
            self.set(e);
        }
    }

    /// Convert the accumulator into a result.
    pub fn into_result(self) -> Result<()> {
        match self.err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Connection poison latch.
///
/// A `Panic` error marks the connection dead. The latch is checked at
/// every public entry point; once set, calls return `Panic` without
/// contacting any subsystem. Cloning shares the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct PanicLatch {
    poisoned: Arc<AtomicBool>,
}

impl PanicLatch {
    /// Create a new, un-poisoned latch.
    pub fn new() -> Self {
        PanicLatch::default()
    }

    /// Mark the connection dead and build the panic error.
    pub fn poison(&self, reason: &str) -> Error {
        self.poisoned.store(true, Ordering::Release);
        tracing::error!(target: "shale::core", reason, "connection poisoned");
        Error::Panic(reason.to_string())
    }

    /// Check the latch, failing fast if a previous call panicked.
    pub fn check(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::Panic("connection poisoned by a previous failure".to_string()));
        }
        Ok(())
    }

    /// Whether the connection has been poisoned.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Rollback.is_retryable());
        assert!(Error::Busy("drop").is_retryable());
        assert!(!Error::NotFound.is_retryable());
        assert!(!Error::Panic("bad".into()).is_retryable());
    }

    #[test]
    fn test_accumulator_keeps_first_error() {
        let mut acc = ErrorAccumulator::new();
        acc.set(Error::InvalidArgument("a".into()));
        acc.set(Error::InvalidArgument("b".into()));
        match acc.into_result() {
            Err(Error::InvalidArgument(msg)) => assert_eq!(msg, "a"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_accumulator_panic_wins() {
        let mut acc = ErrorAccumulator::new();
        acc.set(Error::Io(io::Error::new(io::ErrorKind::Other, "disk")));
        acc.set(Error::Panic("invariant".into()));
        acc.set(Error::Io(io::Error::new(io::ErrorKind::Other, "later")));
        assert!(matches!(acc.into_result(), Err(Error::Panic(_))));
    }

    #[test]
    fn test_accumulator_cursor_outcomes_lose() {
        let mut acc = ErrorAccumulator::new();
        acc.set(Error::NotFound);
        acc.set(Error::Rollback);
        assert!(matches!(acc.into_result(), Err(Error::Rollback)));

        let mut acc = ErrorAccumulator::new();
        acc.set(Error::Rollback);
        acc.set(Error::DuplicateKey);
        assert!(matches!(acc.into_result(), Err(Error::Rollback)));
    }

    #[test]
    fn test_accumulator_empty_is_ok() {
        assert!(ErrorAccumulator::new().into_result().is_ok());
    }

    #[test]
    fn test_panic_latch_poisons() {
        let latch = PanicLatch::new();
        assert!(latch.check().is_ok());

        let err = latch.poison("extent overlap");
        assert!(matches!(err, Error::Panic(_)));
        assert!(latch.is_poisoned());
        assert!(matches!(latch.check(), Err(Error::Panic(_))));

        // Clones share the flag.
        let other = latch.clone();
        assert!(other.is_poisoned());
    }
}
