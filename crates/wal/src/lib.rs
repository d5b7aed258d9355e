//! Write-ahead log for Shale
//!
//! This crate owns everything that touches the log:
//!
//! - Record framing: length, in-memory length, checksum, compression
//!   flag, alignment padding
//! - Record types: commit, checkpoint, file-sync, message
//! - The transaction operation wire format carried inside commit
//!   records
//! - The writer with per-append sync levels and a background flusher
//! - The scanner and two-pass recovery

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod oplog;
pub mod reader;
pub mod record;
pub mod recovery;
pub mod writer;

pub use oplog::{OpReader, TruncMode, TxnOp};
pub use reader::WalScanner;
pub use record::{
    LogFileHeader, LogRecType, LogRecord, Lsn, LOG_ALIGN, LOG_FILE_HEADER_SIZE, LOG_MAGIC,
    LOG_RECORD_COMPRESSED, LOG_RECORD_HEADER_SIZE, LOG_VERSION,
};
pub use recovery::{run as recover, RecoveryHandler, RecoveryStats};
pub use writer::{log_file_path, parse_log_file_name, SyncLevel, WalConfig, WalWriter};
