//! Core types and support code for the Shale engine
//!
//! This crate defines the pieces every other engine crate builds on:
//! - Error: the engine-wide error taxonomy and connection poison latch
//! - Varint: the order-preserving self-describing integer codec used by
//!   every on-disk structure
//! - Pack streams: incremental pack/unpack cursors over packed buffers
//! - Scratch buffers: the per-session reusable buffer pool
//! - Configuration: typed config structs for block, LSM, async and
//!   checkpoint subsystems
//! - Registry: encryptor/compressor capability traits and the keyed
//!   encryptor registry

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod pack;
pub mod registry;
pub mod scratch;
pub mod varint;

pub use config::{
    AllocPolicy, AsyncConfig, BlockConfig, CheckpointConfig, Isolation, LsmConfig,
    ALLOCATION_SIZE_MAX, ALLOCATION_SIZE_MIN, ASYNC_MAX_WORKERS,
};
pub use error::{Error, ErrorAccumulator, PanicLatch, Result};
pub use pack::{PackStream, UnpackStream};
pub use registry::{Compressor, Encryptor, EncryptorRegistry, NoopEncryptor};
pub use scratch::{ScratchHandle, ScratchPool};
pub use varint::UnpackError;
