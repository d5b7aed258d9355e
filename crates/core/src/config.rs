//! Engine configuration.
//!
//! Each subsystem takes a typed configuration struct with builder-style
//! setters and sensible defaults. String forms accepted by the public
//! API (`"first"`, `"snapshot"`, ...) parse through `FromStr`; invalid
//! values are `InvalidArgument`.

use crate::{Error, Result};
use std::str::FromStr;

/// Block allocation policy for the extent allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocPolicy {
    /// Lowest-offset range of sufficient size
    #[default]
    FirstFit,
    /// Smallest sufficient range, ties broken by lower offset
    BestFit,
}

impl FromStr for AllocPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "first" => Ok(AllocPolicy::FirstFit),
            "best" => Ok(AllocPolicy::BestFit),
            _ => Err(Error::InvalidArgument(format!(
                "unknown block_allocation value: {s:?}"
            ))),
        }
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// See uncommitted updates from concurrent transactions
    ReadUncommitted,
    /// Refresh the snapshot before every operation
    ReadCommitted,
    /// One snapshot for the life of the transaction
    #[default]
    Snapshot,
    /// Snapshot seeded from a named snapshot
    SnapshotNamed,
}

impl FromStr for Isolation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read-uncommitted" => Ok(Isolation::ReadUncommitted),
            "read-committed" => Ok(Isolation::ReadCommitted),
            "snapshot" => Ok(Isolation::Snapshot),
            _ => Err(Error::InvalidArgument(format!(
                "unknown isolation value: {s:?}"
            ))),
        }
    }
}

/// Configuration for one open block-managed file.
#[derive(Debug, Clone)]
pub struct BlockConfig {
    /// Allocation policy (`block_allocation=first|best`)
    pub allocation: AllocPolicy,
    /// Power-of-two allocation unit in bytes (`allocation_size`)
    pub allocation_size: u32,
    /// Advise the OS to drop cached pages after this many bytes read
    /// or written; zero disables (`os_cache_max`)
    pub os_cache_max: u64,
    /// Schedule async writeback after this many dirty bytes; zero
    /// disables (`os_cache_dirty_max`)
    pub os_cache_dirty_max: u64,
    /// File extension granularity in bytes; zero disables extension
    pub extend_len: u64,
    /// Truncate the file on open (`helium_o_truncate`)
    pub pre_truncate: bool,
    /// Open without write access
    pub read_only: bool,
    /// Proceed past a corrupt descriptor block for salvage
    pub forced_salvage: bool,
}

/// Smallest legal allocation unit.
pub const ALLOCATION_SIZE_MIN: u32 = 512;
/// Largest legal allocation unit.
pub const ALLOCATION_SIZE_MAX: u32 = 128 * 1024 * 1024;

impl Default for BlockConfig {
    fn default() -> Self {
        BlockConfig {
            allocation: AllocPolicy::FirstFit,
            allocation_size: 4096,
            os_cache_max: 0,
            os_cache_dirty_max: 0,
            extend_len: 0,
            pre_truncate: false,
            read_only: false,
            forced_salvage: false,
        }
    }
}

impl BlockConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the allocation unit.
    pub fn with_allocation_size(mut self, size: u32) -> Self {
        self.allocation_size = size;
        self
    }

    /// Set the allocation policy.
    pub fn with_allocation(mut self, policy: AllocPolicy) -> Self {
        self.allocation = policy;
        self
    }

    /// Set the file extension granularity.
    pub fn with_extend_len(mut self, len: u64) -> Self {
        self.extend_len = len;
        self
    }

    /// Open read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let size = self.allocation_size;
        if !(ALLOCATION_SIZE_MIN..=ALLOCATION_SIZE_MAX).contains(&size)
            || !size.is_power_of_two()
        {
            return Err(Error::InvalidArgument(format!(
                "allocation_size {size} is not a power of two in \
                 [{ALLOCATION_SIZE_MIN}, {ALLOCATION_SIZE_MAX}]"
            )));
        }
        Ok(())
    }
}

/// Configuration for the async operation subsystem.
#[derive(Debug, Clone)]
pub struct AsyncConfig {
    /// Whether the subsystem runs at all (`async.enabled`)
    pub enabled: bool,
    /// Maximum concurrent op handles (`async.ops_max`, floor 10)
    pub ops_max: u32,
    /// Worker thread count (`async.threads`)
    pub threads: u32,
}

/// Upper bound on async worker threads.
pub const ASYNC_MAX_WORKERS: u32 = 20;

impl Default for AsyncConfig {
    fn default() -> Self {
        AsyncConfig {
            enabled: false,
            ops_max: 1024,
            threads: 2,
        }
    }
}

impl AsyncConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the subsystem.
    pub fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }

    /// Set the op handle count; values below 10 are raised to 10.
    pub fn with_ops_max(mut self, ops_max: u32) -> Self {
        self.ops_max = ops_max.max(10);
        self
    }

    /// Set the worker thread count.
    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    /// Validate the configuration. Zero threads is legal: work can be
    /// queued and drained by an embedding test harness.
    pub fn validate(&self) -> Result<()> {
        if self.threads > ASYNC_MAX_WORKERS {
            return Err(Error::InvalidArgument(format!(
                "async.threads {} exceeds the maximum {ASYNC_MAX_WORKERS}",
                self.threads
            )));
        }
        Ok(())
    }
}

/// Configuration for an LSM tree.
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Soft limit on the primary chunk, in bytes (`chunk_size`)
    pub chunk_size: u64,
    /// Microseconds applications sleep to let merges keep up
    /// (`merge_throttle`)
    pub merge_throttle: u64,
    /// Microseconds applications sleep to let checkpoints keep up
    pub ckpt_throttle: u64,
    /// Whether sealed chunks get Bloom filters
    pub bloom: bool,
    /// Bloom filter bits per key (`bloom_bit_count`)
    pub bloom_bit_count: u32,
    /// Bloom filter probes per lookup (`bloom_hash_count`)
    pub bloom_hash_count: u32,
}

impl Default for LsmConfig {
    fn default() -> Self {
        LsmConfig {
            chunk_size: 10 * 1024 * 1024,
            merge_throttle: 0,
            ckpt_throttle: 0,
            bloom: true,
            bloom_bit_count: 16,
            bloom_hash_count: 8,
        }
    }
}

impl LsmConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the primary chunk soft limit.
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Set the merge throttle.
    pub fn with_merge_throttle(mut self, micros: u64) -> Self {
        self.merge_throttle = micros;
        self
    }

    /// Disable Bloom filters.
    pub fn without_bloom(mut self) -> Self {
        self.bloom = false;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk_size must be non-zero".into()));
        }
        if self.bloom && (self.bloom_bit_count == 0 || self.bloom_hash_count == 0) {
            return Err(Error::InvalidArgument(
                "bloom_bit_count and bloom_hash_count must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Flush files as part of the checkpoint (`checkpoint.sync`)
    pub sync: bool,
    /// Checkpoint when this much log has accumulated; zero disables
    /// (`checkpoint.log_size`)
    pub log_size: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            sync: true,
            log_size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_policy_parse() {
        assert_eq!("first".parse::<AllocPolicy>().unwrap(), AllocPolicy::FirstFit);
        assert_eq!("best".parse::<AllocPolicy>().unwrap(), AllocPolicy::BestFit);
        assert!("worst".parse::<AllocPolicy>().is_err());
    }

    #[test]
    fn test_isolation_parse() {
        assert_eq!(
            "read-committed".parse::<Isolation>().unwrap(),
            Isolation::ReadCommitted
        );
        assert_eq!("snapshot".parse::<Isolation>().unwrap(), Isolation::Snapshot);
        assert!("serializable".parse::<Isolation>().is_err());
    }

    #[test]
    fn test_block_config_validation() {
        assert!(BlockConfig::new().validate().is_ok());
        assert!(BlockConfig::new().with_allocation_size(512).validate().is_ok());
        assert!(BlockConfig::new().with_allocation_size(513).validate().is_err());
        assert!(BlockConfig::new().with_allocation_size(256).validate().is_err());
    }

    #[test]
    fn test_async_ops_max_floor() {
        let cfg = AsyncConfig::new().with_ops_max(3);
        assert_eq!(cfg.ops_max, 10);
        let cfg = AsyncConfig::new().with_ops_max(64);
        assert_eq!(cfg.ops_max, 64);
    }

    #[test]
    fn test_async_thread_bounds() {
        assert!(AsyncConfig::new().with_threads(0).validate().is_ok());
        assert!(AsyncConfig::new().with_threads(21).validate().is_err());
        assert!(AsyncConfig::new().with_threads(20).validate().is_ok());
    }

    #[test]
    fn test_lsm_config_validation() {
        assert!(LsmConfig::new().validate().is_ok());
        assert!(LsmConfig::new().with_chunk_size(0).validate().is_err());
        let mut cfg = LsmConfig::new();
        cfg.bloom_hash_count = 0;
        assert!(cfg.validate().is_err());
        assert!(cfg.clone().without_bloom().validate().is_ok());
    }
}
