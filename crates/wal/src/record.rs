//! Log file and record framing.
//!
//! # File layout
//!
//! Log files are named `wal-NNNNNN.log` with a monotonically increasing
//! file number. Each starts with a 32-byte header (magic, version, file
//! number) followed by records padded to the log alignment. A record
//! whose length field reads zero marks end-of-data within the file.
//!
//! # Record layout
//!
//! ```text
//! ┌──────────┬─────────────┬─────────────┬──────────┬────────────┬─────────┐
//! │ len (4)  │ mem_len (4) │ checksum (4)│ flags (1)│ pad (3)    │ body    │
//! └──────────┴─────────────┴─────────────┴──────────┴────────────┴─────────┘
//! ```
//!
//! `len` counts header plus body before padding; `mem_len` is the body
//! length before compression; the checksum covers the whole unpadded
//! record with its own field zeroed. The body starts with a varint
//! record type.

use byteorder::{ByteOrder, LittleEndian};
use shale_core::{Error, PackStream, Result, UnpackStream};

/// Magic bytes at the start of every log file: "SHWA"
pub const LOG_MAGIC: [u8; 4] = *b"SHWA";
/// Log file format version.
pub const LOG_VERSION: u32 = 1;
/// Size of the log file header.
pub const LOG_FILE_HEADER_SIZE: usize = 32;
/// Records are padded to this alignment.
pub const LOG_ALIGN: usize = 128;
/// Size of the record header.
pub const LOG_RECORD_HEADER_SIZE: usize = 16;

/// Record flag: the body is compressed.
pub const LOG_RECORD_COMPRESSED: u8 = 0x01;

/// A log sequence number: file number plus byte offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Lsn {
    /// Log file number
    pub file: u32,
    /// Byte offset within the file
    pub offset: i64,
}

impl Lsn {
    /// The smallest addressable position in the log.
    pub fn first() -> Self {
        Lsn {
            file: 1,
            offset: LOG_FILE_HEADER_SIZE as i64,
        }
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.file, self.offset)
    }
}

/// Record types; zero is reserved as the end-of-data marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecType {
    /// A committed transaction's operations
    Commit = 1,
    /// Checkpoint bracket with the starting LSN and live snapshot
    Checkpoint = 2,
    /// A file's reconciliation started (start=1) or finished (start=0)
    FileSync = 3,
    /// Free-form text
    Message = 4,
}

/// A decoded log record body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// A committed transaction: id plus its packed operations (see
    /// [`crate::oplog`])
    Commit {
        /// Transaction id
        txnid: u64,
        /// Packed operation stream
        ops: Vec<u8>,
    },
    /// A checkpoint record
    Checkpoint {
        /// LSN at which the checkpoint started; recovery replays from
        /// here
        ckpt_lsn: Lsn,
        /// Transaction ids live when the checkpoint started
        snapshot: Vec<u64>,
    },
    /// File reconciliation bracket
    FileSync {
        /// File id the bracket names
        fileid: u32,
        /// True at the start of reconciliation, false at the end
        start: bool,
    },
    /// Diagnostic message
    Message {
        /// Message text
        text: String,
    },
}

impl LogRecord {
    /// The record's type tag.
    pub fn rectype(&self) -> LogRecType {
        match self {
            LogRecord::Commit { .. } => LogRecType::Commit,
            LogRecord::Checkpoint { .. } => LogRecType::Checkpoint,
            LogRecord::FileSync { .. } => LogRecType::FileSync,
            LogRecord::Message { .. } => LogRecType::Message,
        }
    }

    /// Pack the record body (everything after the frame header).
    pub fn body_to_bytes(&self) -> Vec<u8> {
        let mut pack = PackStream::new();
        pack.put_uint(self.rectype() as u64);
        match self {
            LogRecord::Commit { txnid, ops } => {
                pack.put_uint(*txnid).put_raw(ops);
            }
            LogRecord::Checkpoint { ckpt_lsn, snapshot } => {
                pack.put_uint(ckpt_lsn.file as u64).put_int(ckpt_lsn.offset);
                pack.put_uint(snapshot.len() as u64);
                for id in snapshot {
                    pack.put_uint(*id);
                }
            }
            LogRecord::FileSync { fileid, start } => {
                pack.put_uint(*fileid as u64).put_int(i64::from(*start));
            }
            LogRecord::Message { text } => {
                pack.put_bytes(text.as_bytes());
            }
        }
        pack.into_bytes()
    }

    /// Parse a record body.
    pub fn body_from_bytes(body: &[u8]) -> Result<LogRecord> {
        let mut stream = UnpackStream::new(body);
        let rectype = stream.get_uint().map_err(Error::from)?;
        match rectype {
            t if t == LogRecType::Commit as u64 => {
                let txnid = stream.get_uint().map_err(Error::from)?;
                let ops = stream.get_raw(stream.remaining()).map_err(Error::from)?;
                Ok(LogRecord::Commit {
                    txnid,
                    ops: ops.to_vec(),
                })
            }
            t if t == LogRecType::Checkpoint as u64 => {
                let file = stream.get_uint().map_err(Error::from)? as u32;
                let offset = stream.get_int().map_err(Error::from)?;
                let nsnap = stream.get_uint().map_err(Error::from)?;
                let mut snapshot = Vec::with_capacity(nsnap as usize);
                for _ in 0..nsnap {
                    snapshot.push(stream.get_uint().map_err(Error::from)?);
                }
                Ok(LogRecord::Checkpoint {
                    ckpt_lsn: Lsn { file, offset },
                    snapshot,
                })
            }
            t if t == LogRecType::FileSync as u64 => {
                let fileid = stream.get_uint().map_err(Error::from)? as u32;
                let start = stream.get_int().map_err(Error::from)?;
                Ok(LogRecord::FileSync {
                    fileid,
                    start: start != 0,
                })
            }
            t if t == LogRecType::Message as u64 => {
                let text = stream.get_bytes().map_err(Error::from)?;
                Ok(LogRecord::Message {
                    text: String::from_utf8_lossy(text).into_owned(),
                })
            }
            t => Err(Error::CorruptFile(format!("unknown log record type {t}"))),
        }
    }

    /// Frame a record body: header, checksum, zero-pad to alignment.
    pub fn frame(body: &[u8]) -> Vec<u8> {
        let len = LOG_RECORD_HEADER_SIZE + body.len();
        let padded = (len + LOG_ALIGN - 1) / LOG_ALIGN * LOG_ALIGN;

        let mut rec = vec![0u8; padded];
        LittleEndian::write_u32(&mut rec[0..4], len as u32);
        LittleEndian::write_u32(&mut rec[4..8], body.len() as u32);
        // checksum written below
        rec[12] = 0; // flags
        rec[LOG_RECORD_HEADER_SIZE..len].copy_from_slice(body);

        let cksum = crc32fast::hash(&rec[..len]);
        LittleEndian::write_u32(&mut rec[8..12], cksum);
        rec
    }

    /// Parse a framed record from the start of `buf`.
    ///
    /// Returns the record and the padded length consumed, or `None`
    /// when the length field is zero (end-of-data marker).
    pub fn unframe(buf: &[u8]) -> Result<Option<(LogRecord, usize)>> {
        if buf.len() < LOG_RECORD_HEADER_SIZE {
            return Err(Error::CorruptFile("torn log record header".to_string()));
        }
        let len = LittleEndian::read_u32(&buf[0..4]) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len < LOG_RECORD_HEADER_SIZE || len > buf.len() {
            return Err(Error::CorruptFile(format!(
                "log record length {len} out of bounds"
            )));
        }
        let stored = LittleEndian::read_u32(&buf[8..12]);
        let mut copy = buf[..len].to_vec();
        copy[8..12].fill(0);
        let computed = crc32fast::hash(&copy);
        if stored != computed {
            return Err(Error::CorruptFile(format!(
                "log record checksum {stored:#x} does not match computed {computed:#x}"
            )));
        }

        let record = LogRecord::body_from_bytes(&buf[LOG_RECORD_HEADER_SIZE..len])?;
        let padded = (len + LOG_ALIGN - 1) / LOG_ALIGN * LOG_ALIGN;
        Ok(Some((record, padded)))
    }
}

/// Log file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFileHeader {
    /// Magic bytes
    pub magic: [u8; 4],
    /// Format version
    pub version: u32,
    /// File number
    pub file_number: u32,
}

impl LogFileHeader {
    /// Build the header for a new log file.
    pub fn new(file_number: u32) -> Self {
        LogFileHeader {
            magic: LOG_MAGIC,
            version: LOG_VERSION,
            file_number,
        }
    }

    /// Serialize to the fixed 32-byte header block.
    pub fn to_bytes(&self) -> [u8; LOG_FILE_HEADER_SIZE] {
        let mut bytes = [0u8; LOG_FILE_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        LittleEndian::write_u32(&mut bytes[4..8], self.version);
        LittleEndian::write_u32(&mut bytes[8..12], self.file_number);
        bytes
    }

    /// Parse and verify a header block.
    pub fn from_bytes(bytes: &[u8]) -> Result<LogFileHeader> {
        if bytes.len() < LOG_FILE_HEADER_SIZE {
            return Err(Error::CorruptFile("short log file header".to_string()));
        }
        let hdr = LogFileHeader {
            magic: bytes[0..4].try_into().expect("sliced to length"),
            version: LittleEndian::read_u32(&bytes[4..8]),
            file_number: LittleEndian::read_u32(&bytes[8..12]),
        };
        if hdr.magic != LOG_MAGIC {
            return Err(Error::CorruptFile("bad log file magic".to_string()));
        }
        if hdr.version != LOG_VERSION {
            return Err(Error::CorruptFile(format!(
                "unsupported log version {}",
                hdr.version
            )));
        }
        Ok(hdr)
    }
}
