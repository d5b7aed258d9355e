//! Transactions for Shale
//!
//! This crate implements the transaction subsystem:
//! - Monotone id allocation published through a per-session state
//!   array so snapshot scans run without locks
//! - Snapshot construction and the visibility rules
//! - Per-session transactions with lazy write ids, an operation log,
//!   WAL-backed commit and never-failing rollback
//! - Named snapshots: saved views that pin the oldest-id watermark

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod global;
pub mod nsnap;
pub mod snapshot;
pub mod txn;

pub use global::{TxnGlobal, TxnState, TXN_ABORTED, TXN_FIRST, TXN_NONE};
pub use nsnap::{DropSpec, NamedSnapshot, NamedSnapshots};
pub use snapshot::SnapshotData;
pub use txn::{TxnNotify, TxnSession, UpdateCell};
