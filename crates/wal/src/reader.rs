//! Scanning the log.
//!
//! The scanner walks every log file in number order, yielding records
//! with their LSNs. Within a file it stops at the end-of-data marker,
//! a torn record, or a checksum failure; the first two are expected
//! after a crash, and in every case the scan resumes with the next
//! file (the writer starts a fresh file on every open).

use crate::record::{LogFileHeader, LogRecord, Lsn, LOG_FILE_HEADER_SIZE, LOG_RECORD_HEADER_SIZE};
use crate::writer::{log_file_path, parse_log_file_name};
use shale_core::{Error, Result};
use std::path::{Path, PathBuf};

/// A sequential reader over every record in a log directory.
pub struct WalScanner {
    files: Vec<(u32, PathBuf)>,
    next_file: usize,
    current: Option<CurrentFile>,
}

struct CurrentFile {
    number: u32,
    buf: Vec<u8>,
    pos: usize,
}

impl WalScanner {
    /// Open a scanner over `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut files = Vec::new();
        if dir.exists() {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                if let Some(n) = parse_log_file_name(&entry.file_name().to_string_lossy()) {
                    files.push((n, log_file_path(dir, n)));
                }
            }
        }
        files.sort_unstable();
        Ok(WalScanner {
            files,
            next_file: 0,
            current: None,
        })
    }

    /// The next record in LSN order, or `None` at the end of the log.
    pub fn next_record(&mut self) -> Result<Option<(Lsn, LogRecord)>> {
        loop {
            if self.current.is_none() && !self.advance_file()? {
                return Ok(None);
            }

            let cur = self.current.as_mut().expect("file loaded above");
            if cur.pos + LOG_RECORD_HEADER_SIZE > cur.buf.len() {
                // Torn tail; whatever follows was never durable.
                self.current = None;
                continue;
            }

            match LogRecord::unframe(&cur.buf[cur.pos..]) {
                Ok(Some((record, consumed))) => {
                    let lsn = Lsn {
                        file: cur.number,
                        offset: cur.pos as i64,
                    };
                    cur.pos += consumed;
                    return Ok(Some((lsn, record)));
                }
                Ok(None) => {
                    // End-of-data marker.
                    self.current = None;
                }
                Err(e) => {
                    // A torn or corrupt record ends this file's useful
                    // data; later files may still be fine.
                    tracing::warn!(
                        target: "shale::wal",
                        file = cur.number, offset = cur.pos, error = %e,
                        "log scan stopping at damaged record"
                    );
                    self.current = None;
                }
            }
        }
    }

    /// Collect every remaining record.
    pub fn collect_records(mut self) -> Result<Vec<(Lsn, LogRecord)>> {
        let mut records = Vec::new();
        while let Some(item) = self.next_record()? {
            records.push(item);
        }
        Ok(records)
    }

    fn advance_file(&mut self) -> Result<bool> {
        let Some(&(number, ref path)) = self.files.get(self.next_file) else {
            return Ok(false);
        };
        self.next_file += 1;

        let buf = std::fs::read(path)?;
        let hdr = LogFileHeader::from_bytes(&buf)?;
        if hdr.file_number != number {
            return Err(Error::CorruptFile(format!(
                "log file {} carries header number {}",
                number, hdr.file_number
            )));
        }
        self.current = Some(CurrentFile {
            number,
            buf,
            pos: LOG_FILE_HEADER_SIZE,
        });
        Ok(true)
    }
}
