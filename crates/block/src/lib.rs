//! Block manager for Shale
//!
//! This crate owns everything about a single data file's space:
//! - Extent lists: ordered disjoint free/allocated ranges with
//!   first-fit/best-fit allocation
//! - Block I/O: checksummed, allocation-aligned reads and writes
//!   addressed by opaque `(offset, size, checksum)` cookies
//! - Two-phase checkpoints: write new extent state, let the caller
//!   persist the cookies, then resolve to release reclaimed space
//! - Compaction heuristics and salvage of damaged files
//! - The bit-exact on-disk formats: descriptor block, 28-byte page
//!   header, block header

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod ckpt;
pub mod compact;
pub mod ext;
pub mod fmt;
pub mod manager;
pub mod salvage;

pub use addr::{Addr, CheckpointCookie, CHECKPOINT_VERSION};
pub use ckpt::CkptEntry;
pub use ext::{reclaim_overlaps, ExtentList};
pub use fmt::{
    BlockHeader, FileDesc, PageHeader, PageType, BLOCK_COMPRESS_SKIP, BLOCK_DATA_CKSUM,
    BLOCK_DATA_OFFSET, BLOCK_HEADER_SIZE, BLOCK_MAGIC, PAGE_HEADER_SIZE,
};
pub use manager::BlockManager;
