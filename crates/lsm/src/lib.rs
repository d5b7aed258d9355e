//! LSM layer for Shale
//!
//! An LSM tree is a stack of ordered chunks over one block-managed
//! file: the newest chunk takes writes, older chunks are sealed,
//! flushed through the block manager and eventually merged. This
//! crate provides:
//! - Chunks with versioned entries, tombstone encoding and per-chunk
//!   cursors
//! - Bloom filters for sealed chunks
//! - The tree with its switch/flush/merge machinery and generation
//!   counter
//! - The merge cursor: snapshot-aware lookup, ordered iteration and
//!   update steering into the primary
//! - The background worker pool

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bloom;
pub mod chunk;
pub mod cursor;
pub mod tree;
pub mod worker;

pub use bloom::{Bloom, BloomHash};
pub use chunk::{deleted_decode, deleted_encode, is_deleted, Chunk, ChunkCursor, TOMBSTONE};
pub use cursor::LsmCursor;
pub use tree::LsmTree;
pub use worker::{LsmManager, LsmWorkType};
