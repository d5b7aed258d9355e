//! Appending to the log.
//!
//! The writer owns the current log file and hands out LSNs. Records
//! are appended in order under a single lock; the sync level decides
//! what happens before `append` returns:
//!
//! - `None`: nothing, the OS flushes eventually
//! - `Background`: wake the log flush thread, don't wait
//! - `Fsync`: flush file data and metadata before returning
//! - `Dsync`: flush file data before returning

use crate::record::{LogFileHeader, LogRecord, Lsn, LOG_FILE_HEADER_SIZE};
use parking_lot::{Condvar, Mutex};
use shale_core::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How durable an append must be before it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncLevel {
    /// No flush
    None,
    /// Wake the background flusher, don't wait
    #[default]
    Background,
    /// Flush data and metadata
    Fsync,
    /// Flush data only
    Dsync,
}

/// Log writer configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Rotate to a new log file past this size
    pub file_max: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            file_max: 100 * 1024 * 1024,
        }
    }
}

impl WalConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rotation size.
    pub fn with_file_max(mut self, bytes: u64) -> Self {
        self.file_max = bytes;
        self
    }

    /// A small rotation size for tests.
    pub fn for_testing() -> Self {
        WalConfig { file_max: 16 * 1024 }
    }
}

/// Name of log file `number` inside the log directory.
pub fn log_file_path(dir: &Path, number: u32) -> PathBuf {
    dir.join(format!("wal-{number:06}.log"))
}

/// Parse a log file name back into its number.
pub fn parse_log_file_name(name: &str) -> Option<u32> {
    name.strip_prefix("wal-")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

struct LogState {
    file: File,
    number: u32,
    offset: i64,
    /// LSN through which data is known flushed
    sync_lsn: Lsn,
}

struct FlushState {
    requested: bool,
    shutdown: bool,
}

struct Inner {
    state: Mutex<LogState>,
    flush_lock: Mutex<FlushState>,
    flush_cond: Condvar,
}

/// The write-ahead log writer.
///
/// Appends are serialized; a background thread services
/// `SyncLevel::Background` flush requests.
pub struct WalWriter {
    dir: PathBuf,
    cfg: WalConfig,
    inner: Arc<Inner>,
    flusher: Option<JoinHandle<()>>,
}

impl WalWriter {
    /// Open the log in `dir`, creating the directory if needed.
    ///
    /// A fresh log file is always started: earlier files may end in a
    /// torn record, and recovery knows how to read across files.
    pub fn open(dir: impl AsRef<Path>, cfg: WalConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let number = Self::latest_file_number(&dir)?.map_or(1, |n| n + 1);
        let file = Self::create_file(&dir, number)?;
        tracing::debug!(target: "shale::wal", dir = %dir.display(), file = number, "log open");

        let inner = Arc::new(Inner {
            state: Mutex::new(LogState {
                file,
                number,
                offset: LOG_FILE_HEADER_SIZE as i64,
                sync_lsn: Lsn {
                    file: number,
                    offset: LOG_FILE_HEADER_SIZE as i64,
                },
            }),
            flush_lock: Mutex::new(FlushState {
                requested: false,
                shutdown: false,
            }),
            flush_cond: Condvar::new(),
        });

        let flusher = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("shale-wal-flush".to_string())
                .spawn(move || Self::flush_thread(&inner))
                .map_err(Error::Io)?
        };

        Ok(WalWriter {
            dir,
            cfg,
            inner,
            flusher: Some(flusher),
        })
    }

    /// Largest existing log file number, if any.
    pub fn latest_file_number(dir: &Path) -> Result<Option<u32>> {
        let mut max = None;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(n) = parse_log_file_name(&entry.file_name().to_string_lossy()) {
                max = Some(max.map_or(n, |m: u32| m.max(n)));
            }
        }
        Ok(max)
    }

    fn create_file(dir: &Path, number: u32) -> Result<File> {
        let path = log_file_path(dir, number);
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.write_all_at(&LogFileHeader::new(number).to_bytes(), 0)?;
        Ok(file)
    }

    /// The log directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a record at the configured durability, returning its LSN.
    pub fn append(&self, record: &LogRecord, sync: SyncLevel) -> Result<Lsn> {
        let body = record.body_to_bytes();
        let framed = LogRecord::frame(&body);

        let lsn = {
            let mut state = self.inner.state.lock();

            // Rotate once the current file is past the limit.
            if state.offset as u64 + framed.len() as u64 > self.cfg.file_max
                && state.offset > LOG_FILE_HEADER_SIZE as i64
            {
                state.file.sync_all()?;
                let number = state.number + 1;
                tracing::debug!(target: "shale::wal", file = number, "log rotate");
                state.file = Self::create_file(&self.dir, number)?;
                state.number = number;
                state.offset = LOG_FILE_HEADER_SIZE as i64;
            }

            let lsn = Lsn {
                file: state.number,
                offset: state.offset,
            };
            state.file.write_all_at(&framed, state.offset as u64)?;
            state.offset += framed.len() as i64;

            match sync {
                SyncLevel::None | SyncLevel::Background => {}
                SyncLevel::Fsync => {
                    state.file.sync_all()?;
                    state.sync_lsn = Lsn {
                        file: state.number,
                        offset: state.offset,
                    };
                }
                SyncLevel::Dsync => {
                    state.file.sync_data()?;
                    state.sync_lsn = Lsn {
                        file: state.number,
                        offset: state.offset,
                    };
                }
            }
            lsn
        };

        if sync == SyncLevel::Background {
            let mut flush = self.inner.flush_lock.lock();
            flush.requested = true;
            self.inner.flush_cond.notify_one();
        }

        tracing::trace!(target: "shale::wal", %lsn, rectype = ?record.rectype(), "append");
        Ok(lsn)
    }

    /// Flush everything appended so far.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.file.sync_all()?;
        state.sync_lsn = Lsn {
            file: state.number,
            offset: state.offset,
        };
        Ok(())
    }

    /// The LSN the next append will receive.
    pub fn current_lsn(&self) -> Lsn {
        let state = self.inner.state.lock();
        Lsn {
            file: state.number,
            offset: state.offset,
        }
    }

    /// The LSN through which the log is known durable.
    pub fn sync_lsn(&self) -> Lsn {
        self.inner.state.lock().sync_lsn
    }

    fn flush_thread(inner: &Inner) {
        loop {
            let requested = {
                let mut flush = inner.flush_lock.lock();
                while !flush.requested && !flush.shutdown {
                    // Wake periodically so nothing stays unflushed long
                    // even if a notification is missed.
                    inner
                        .flush_cond
                        .wait_for(&mut flush, Duration::from_millis(100));
                }
                if flush.shutdown && !flush.requested {
                    return;
                }
                flush.requested = false;
                true
            };

            if requested {
                let mut state = inner.state.lock();
                if let Err(e) = state.file.sync_data() {
                    tracing::error!(target: "shale::wal", error = %e, "background flush failed");
                } else {
                    state.sync_lsn = Lsn {
                        file: state.number,
                        offset: state.offset,
                    };
                }
            }
        }
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        {
            let mut flush = self.inner.flush_lock.lock();
            flush.shutdown = true;
            self.inner.flush_cond.notify_one();
        }
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
        let state = self.inner.state.lock();
        let _ = state.file.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn message(text: &str) -> LogRecord {
        LogRecord::Message {
            text: text.to_string(),
        }
    }

    #[test]
    fn test_append_returns_increasing_lsns() {
        let dir = tempdir().unwrap();
        let wal = WalWriter::open(dir.path(), WalConfig::new()).unwrap();

        let a = wal.append(&message("one"), SyncLevel::None).unwrap();
        let b = wal.append(&message("two"), SyncLevel::None).unwrap();
        assert!(a < b);
        assert_eq!(a.file, b.file);
    }

    #[test]
    fn test_fsync_advances_sync_lsn() {
        let dir = tempdir().unwrap();
        let wal = WalWriter::open(dir.path(), WalConfig::new()).unwrap();

        wal.append(&message("durable"), SyncLevel::Fsync).unwrap();
        assert_eq!(wal.sync_lsn(), wal.current_lsn());
    }

    #[test]
    fn test_rotation_at_file_max() {
        let dir = tempdir().unwrap();
        let wal = WalWriter::open(dir.path(), WalConfig::for_testing()).unwrap();

        let first = wal.append(&message("a"), SyncLevel::None).unwrap();
        for _ in 0..200 {
            wal.append(&message("padding to force rotation"), SyncLevel::None)
                .unwrap();
        }
        let last = wal.current_lsn();
        assert!(last.file > first.file, "log should have rotated");

        // Every file has a valid header.
        for n in first.file..=last.file {
            let bytes = std::fs::read(log_file_path(dir.path(), n)).unwrap();
            LogFileHeader::from_bytes(&bytes).unwrap();
        }
    }

    #[test]
    fn test_reopen_starts_new_file() {
        let dir = tempdir().unwrap();
        let first = {
            let wal = WalWriter::open(dir.path(), WalConfig::new()).unwrap();
            wal.append(&message("before restart"), SyncLevel::Fsync).unwrap()
        };

        let wal = WalWriter::open(dir.path(), WalConfig::new()).unwrap();
        let next = wal.append(&message("after restart"), SyncLevel::None).unwrap();
        assert_eq!(next.file, first.file + 1);
    }

    #[test]
    fn test_background_sync_does_not_block() {
        let dir = tempdir().unwrap();
        let wal = WalWriter::open(dir.path(), WalConfig::new()).unwrap();

        wal.append(&message("bg"), SyncLevel::Background).unwrap();
        // Give the flusher a moment, then verify it advanced.
        for _ in 0..100 {
            if wal.sync_lsn() == wal.current_lsn() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("background flush never ran");
    }
}
