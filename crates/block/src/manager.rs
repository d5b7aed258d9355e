//! The block manager: page-aligned allocation, reads and writes on a
//! single file.
//!
//! One `BlockManager` serves one open file. Space accounting lives in
//! the live checkpoint's extent lists behind `live_lock`; reads verify
//! checksums against the address cookie; writes allocate from the avail
//! list (appending at end-of-file when nothing fits), extend the file
//! in chunks, and hand back `(offset, size, checksum)` cookies.

use crate::addr::Addr;
use crate::ext::ExtentList;
use crate::fmt::{
    BlockHeader, FileDesc, PageHeader, PageType, BLOCK_COMPRESS_SKIP, BLOCK_DATA_CKSUM,
    BLOCK_DATA_OFFSET, BTREE_PAGE_SIZE_MAX,
};
use parking_lot::{Mutex, MutexGuard};
use shale_core::{AllocPolicy, BlockConfig, Encryptor, Error, PanicLatch, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Per-checkpoint extent list state.
///
/// The live system owns one of these; loading a read-only checkpoint or
/// processing a checkpoint delete builds transient ones.
#[derive(Debug)]
pub(crate) struct BlockCkpt {
    /// Root page location, if any
    pub root: Option<Addr>,
    /// Ranges allocated since the previous checkpoint
    pub alloc: ExtentList,
    /// Ranges available for allocation
    pub avail: ExtentList,
    /// Ranges freed but possibly referenced by earlier checkpoints
    pub discard: ExtentList,
    /// Ranges freed during the in-progress checkpoint; allocatable only
    /// after the checkpoint resolves
    pub ckpt_avail: ExtentList,
    /// Alloc list saved at checkpoint for deferred release
    pub ckpt_alloc: ExtentList,
    /// Discard list saved at checkpoint for deferred release
    pub ckpt_discard: ExtentList,
    /// File size recorded in the checkpoint
    pub file_size: u64,
    /// Accumulated checkpoint size
    pub ckpt_size: u64,
}

impl BlockCkpt {
    pub(crate) fn new(prefix: &str) -> Self {
        BlockCkpt {
            root: None,
            alloc: ExtentList::new(format!("{prefix}.alloc"), false),
            avail: ExtentList::new(format!("{prefix}.avail"), true),
            discard: ExtentList::new(format!("{prefix}.discard"), false),
            ckpt_avail: ExtentList::new(format!("{prefix}.ckpt_avail"), true),
            ckpt_alloc: ExtentList::new(format!("{prefix}.ckpt_alloc"), false),
            ckpt_discard: ExtentList::new(format!("{prefix}.ckpt_discard"), false),
            file_size: 0,
            ckpt_size: 0,
        }
    }
}

/// State guarded by the live lock.
#[derive(Debug)]
pub(crate) struct LiveState {
    /// The live checkpoint's extent lists
    pub ckpt: BlockCkpt,
    /// Current file size
    pub file_size: u64,
    /// File extension high-water mark
    pub extend_size: u64,
    /// A checkpoint has been written but not resolved
    pub ckpt_inprogress: bool,
    /// The live checkpoint is loaded (double-open guard)
    pub live_open: bool,
    /// Compaction target: rewrite blocks in the last N tenths
    pub compact_pct_tenths: u64,
    /// Salvage scan position
    pub slvg_off: u64,
}

/// Block manager for a single file.
pub struct BlockManager {
    name: String,
    path: PathBuf,
    file: File,
    allocsize: u32,
    cfg: BlockConfig,
    latch: PanicLatch,
    /// Forced first-fit depth; checkpoints and compaction both force
    /// first-fit and may overlap, so this is a counter, not a flag.
    allocfirst: AtomicU32,
    /// Bytes read/written since the last cache-advise
    os_cache: AtomicU64,
    /// Dirty bytes since the last scheduled writeback
    os_cache_dirty: AtomicU64,
    /// Payload transform applied before checksum-and-write and after
    /// read-and-verify
    encryptor: Option<Arc<dyn Encryptor>>,
    live: Mutex<LiveState>,
}

impl BlockManager {
    /// Create a new file: write the descriptor block and flush both the
    /// file and its directory before returning.
    pub fn create(path: impl AsRef<Path>, cfg: &BlockConfig) -> Result<()> {
        cfg.validate()?;
        let path = path.as_ref();

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        let desc = FileDesc::new().to_block(cfg.allocation_size);
        file.write_all_at(&desc, 0)?;
        file.sync_all()?;

        // A create isn't durable until the directory entry is.
        if let Some(dir) = path.parent() {
            File::open(if dir.as_os_str().is_empty() {
                Path::new(".")
            } else {
                dir
            })?
            .sync_all()?;
        }

        tracing::debug!(target: "shale::block", path = %path.display(), "created file");
        Ok(())
    }

    /// Open an existing file and verify its descriptor block.
    ///
    /// With `forced_salvage` set the descriptor is not examined at all;
    /// salvage rebuilds it.
    pub fn open(path: impl AsRef<Path>, cfg: BlockConfig, latch: PanicLatch) -> Result<Self> {
        cfg.validate()?;
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        tracing::debug!(target: "shale::block", file = %name, "open");

        let file = OpenOptions::new()
            .read(true)
            .write(!cfg.read_only)
            .open(&path)?;

        if cfg.pre_truncate && !cfg.read_only {
            file.set_len(cfg.allocation_size as u64)?;
        }

        let allocsize = cfg.allocation_size;
        if !cfg.forced_salvage {
            let mut desc = vec![0u8; allocsize as usize];
            file.read_exact_at(&mut desc, 0)
                .map_err(|e| Error::CorruptFile(format!("{name}: short descriptor read: {e}")))?;
            FileDesc::from_block(&desc)?;
        }

        let file_size = file.metadata()?.len();
        Ok(BlockManager {
            name,
            path,
            file,
            allocsize,
            cfg,
            latch,
            allocfirst: AtomicU32::new(0),
            os_cache: AtomicU64::new(0),
            os_cache_dirty: AtomicU64::new(0),
            encryptor: None,
            live: Mutex::new(LiveState {
                ckpt: BlockCkpt::new("live"),
                file_size,
                extend_size: file_size,
                ckpt_inprogress: false,
                live_open: false,
                compact_pct_tenths: 0,
                slvg_off: 0,
            }),
        })
    }

    /// Install a payload encryptor, usually looked up from the keyed
    /// registry by table configuration. Blocks written from here on
    /// have everything past the header prefix transformed; the
    /// encryptor must be length-preserving so blocks stay aligned.
    pub fn with_encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    /// Transform the payload region in place through the encryptor.
    fn transform_payload(&self, buf: &mut [u8], encrypt: bool) -> Result<()> {
        let Some(encryptor) = &self.encryptor else {
            return Ok(());
        };
        let skip = BLOCK_COMPRESS_SKIP.min(buf.len());
        let mut out = Vec::with_capacity(buf.len() - skip);
        if encrypt {
            encryptor.encrypt(&buf[skip..], &mut out)?;
        } else {
            encryptor.decrypt(&buf[skip..], &mut out)?;
        }
        if out.len() != buf.len() - skip {
            return Err(Error::Unsupported(
                "block encryptors must be length-preserving".to_string(),
            ));
        }
        buf[skip..].copy_from_slice(&out);
        Ok(())
    }

    /// The file name this manager serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The file path this manager serves.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The configured allocation unit.
    pub fn allocsize(&self) -> u32 {
        self.allocsize
    }

    /// Current file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.live.lock().file_size
    }

    pub(crate) fn live(&self) -> MutexGuard<'_, LiveState> {
        self.live.lock()
    }

    pub(crate) fn latch(&self) -> &PanicLatch {
        &self.latch
    }

    pub(crate) fn file_ref(&self) -> &File {
        &self.file
    }

    pub(crate) fn config(&self) -> &BlockConfig {
        &self.cfg
    }

    /// Force (or stop forcing) first-fit allocation.
    ///
    /// Checkpoints and compaction both want new blocks written toward
    /// the start of the file; the counter keeps first-fit in force as
    /// long as any caller wants it.
    pub(crate) fn configure_first_fit(&self, on: bool) {
        if on {
            self.allocfirst.fetch_add(1, Ordering::AcqRel);
        } else {
            self.allocfirst.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn alloc_policy(&self) -> AllocPolicy {
        if self.allocfirst.load(Ordering::Acquire) > 0 {
            AllocPolicy::FirstFit
        } else {
            self.cfg.allocation
        }
    }

    /// Round `len` up to the allocation unit.
    pub fn align(&self, len: usize) -> u64 {
        let unit = self.allocsize as u64;
        (len as u64 + unit - 1) / unit * unit
    }

    /// The buffer size a write of `payload_len` bytes will occupy on
    /// disk. The size is stored in a 32-bit header field; leave room
    /// for mode bits.
    pub fn write_size(&self, payload_len: usize) -> Result<u64> {
        let size = self.align(payload_len);
        if size > u32::MAX as u64 - 1024 {
            return Err(Error::InvalidArgument(format!(
                "{}: write of {payload_len} bytes exceeds the maximum block size",
                self.name
            )));
        }
        Ok(size)
    }

    /// Whether `(offset, size)` cannot possibly be a valid block.
    pub(crate) fn offset_invalid(&self, live: &LiveState, offset: u64, size: u32) -> bool {
        size == 0
            || size % self.allocsize != 0
            || size as usize > BTREE_PAGE_SIZE_MAX
            || offset % self.allocsize as u64 != 0
            || offset + size as u64 > live.file_size
    }

    // ------------------------------------------------------------------
    // Reads

    /// Read the block at `addr`, verifying its checksum.
    ///
    /// A checksum failure on an ordinary read poisons the connection:
    /// the cookie came from engine metadata, so a mismatch means state
    /// is corrupt beyond this one call.
    pub fn read(&self, addr: &Addr) -> Result<Vec<u8>> {
        self.latch.check()?;
        match self.read_inner(addr, false) {
            Err(Error::CorruptBlock(msg)) => Err(self.latch.poison(&msg)),
            other => other,
        }
    }

    /// Read the block at `addr`, reporting corruption without poisoning
    /// the connection. Salvage and verification use this path.
    pub fn read_quiet(&self, addr: &Addr) -> Result<Vec<u8>> {
        self.read_inner(addr, true)
    }

    fn read_inner(&self, addr: &Addr, quiet: bool) -> Result<Vec<u8>> {
        tracing::trace!(
            target: "shale::block",
            file = %self.name, off = addr.off, size = addr.size, cksum = addr.cksum,
            "read"
        );

        #[cfg(debug_assertions)]
        self.check_misplaced(addr);

        let mut buf = vec![0u8; addr.size as usize];
        self.file.read_exact_at(&mut buf, addr.off)?;

        let blk = BlockHeader::read_from(&buf)?;
        if blk.cksum != addr.cksum {
            return Err(self.corrupt_read(addr, blk.cksum, quiet));
        }
        BlockHeader::zero_cksum(&mut buf);
        let len = if blk.flags & BLOCK_DATA_CKSUM != 0 {
            buf.len()
        } else {
            BLOCK_COMPRESS_SKIP.min(buf.len())
        };
        let computed = crc32fast::hash(&buf[..len]);
        if computed != addr.cksum {
            return Err(self.corrupt_read(addr, computed, quiet));
        }

        // Restore the stored checksum so a re-written block is
        // byte-identical to what was read.
        let hdr = BlockHeader {
            cksum: addr.cksum,
            ..blk
        };
        hdr.write_to(&mut buf);

        self.transform_payload(&mut buf, false)?;

        self.cache_advise_read(addr.size as u64);
        Ok(buf)
    }

    fn corrupt_read(&self, addr: &Addr, computed: u32, quiet: bool) -> Error {
        let msg = format!(
            "{}: read checksum error for {}B block at offset {}: calculated {:#x} doesn't \
             match expected {:#x}",
            self.name, addr.size, addr.off, computed, addr.cksum
        );
        if !quiet {
            tracing::error!(target: "shale::block", "{msg}");
        }
        Error::CorruptBlock(msg)
    }

    /// In diagnostic builds, verify a block about to be read is not on
    /// the avail or discard lists. Reads can run with or without the
    /// live lock held, so skip the check rather than block on it.
    #[cfg(debug_assertions)]
    fn check_misplaced(&self, addr: &Addr) {
        let live = match self.live.try_lock() {
            Some(live) => live,
            None => return,
        };
        if !live.live_open {
            return;
        }
        debug_assert!(
            !live.ckpt.avail.intersects(addr.off, addr.size as u64),
            "{}: reading a block on the avail list",
            self.name
        );
        debug_assert!(
            !live.ckpt.discard.intersects(addr.off, addr.size as u64),
            "{}: reading a block on the discard list",
            self.name
        );
    }

    fn cache_advise_read(&self, bytes: u64) {
        if self.cfg.os_cache_max == 0 {
            return;
        }
        if self.os_cache.fetch_add(bytes, Ordering::AcqRel) + bytes > self.cfg.os_cache_max {
            self.os_cache.store(0, Ordering::Release);
            // Hook point for posix_fadvise(DONTNEED); dropping clean
            // pages is advisory, so accounting alone is correct.
            tracing::trace!(target: "shale::block", file = %self.name, "advising cache drop");
        }
    }

    // ------------------------------------------------------------------
    // Writes

    /// Write a block image, returning its address cookie.
    ///
    /// `buf` must begin with a page header; the block header after it
    /// is owned by this call. The buffer is padded to the allocation
    /// unit in place. With `data_cksum` the checksum covers the whole
    /// aligned block; without it, only the leading compress-skip bytes
    /// (callers with compression enabled rely on decompression failure
    /// to catch corruption in the body).
    pub fn write(&self, buf: &mut Vec<u8>, data_cksum: bool) -> Result<Addr> {
        self.latch.check()?;
        let (align_size, cksum) = self.prepare_buf(buf, data_cksum)?;

        let offset = {
            let mut live = self.live.lock();
            self.alloc_off(&mut live, align_size as u64)?
        };

        if let Err(e) = self.file.write_all_at(buf, offset) {
            // The write failed; don't leak the extent.
            let mut live = self.live.lock();
            self.off_free(&mut live, offset, align_size as u64)?;
            return Err(e.into());
        }

        self.cache_advise_write(align_size as u64)?;

        tracing::trace!(
            target: "shale::block",
            file = %self.name, off = offset, size = align_size, cksum,
            "write"
        );
        Ok(Addr::new(offset, align_size, cksum))
    }

    /// Write a block image with the live lock already held. Checkpoint
    /// processing writes extent lists while holding the lock.
    pub(crate) fn write_locked(
        &self,
        live: &mut LiveState,
        buf: &mut Vec<u8>,
        data_cksum: bool,
    ) -> Result<Addr> {
        let (align_size, cksum) = self.prepare_buf(buf, data_cksum)?;
        let offset = self.alloc_off(live, align_size as u64)?;
        if let Err(e) = self.file.write_all_at(buf, offset) {
            self.off_free(live, offset, align_size as u64)?;
            return Err(e.into());
        }
        Ok(Addr::new(offset, align_size, cksum))
    }

    /// Pad the buffer to the allocation unit and fill in the block
    /// header: disk size, flags, and the checksum computed with its
    /// own field zeroed.
    fn prepare_buf(&self, buf: &mut Vec<u8>, data_cksum: bool) -> Result<(u32, u32)> {
        if buf.len() < BLOCK_DATA_OFFSET {
            return Err(Error::InvalidArgument(format!(
                "{}: write buffer smaller than the block headers",
                self.name
            )));
        }
        let align_size = self.write_size(buf.len())?;
        buf.resize(align_size as usize, 0);
        let align_size = align_size as u32;

        self.transform_payload(buf, true)?;

        let mut hdr = BlockHeader {
            disk_size: align_size,
            cksum: 0,
            flags: if data_cksum { BLOCK_DATA_CKSUM } else { 0 },
        };
        hdr.write_to(buf);

        let len = if data_cksum {
            buf.len()
        } else {
            BLOCK_COMPRESS_SKIP.min(buf.len())
        };
        let cksum = crc32fast::hash(&buf[..len]);
        hdr.cksum = cksum;
        hdr.write_to(buf);
        Ok((align_size, cksum))
    }

    /// Allocate file space, preferring the avail list and appending at
    /// end-of-file otherwise. The allocated range joins the live alloc
    /// list; the file is extended in chunks when the write crosses the
    /// extension boundary.
    fn alloc_off(&self, live: &mut LiveState, size: u64) -> Result<u64> {
        let policy = self.alloc_policy();
        let offset = match live.ckpt.avail.alloc(size, policy) {
            Some(off) => off,
            None => {
                let off = live.file_size;
                live.file_size += size;
                off
            }
        };
        live.ckpt.alloc.insert(offset, size).map_err(|e| self.escalate(e))?;
        self.extend_file(live, offset, size)?;
        Ok(offset)
    }

    /// Extend the file past the write in `extend_len`-sized chunks.
    ///
    /// The thread whose write crosses the boundary performs the
    /// extension; a write that ends exactly at the boundary does not.
    fn extend_file(&self, live: &mut LiveState, offset: u64, size: u64) -> Result<()> {
        if self.cfg.extend_len == 0 || offset + size <= live.extend_size {
            return Ok(());
        }
        live.extend_size = live.file_size + self.cfg.extend_len * 2;
        tracing::trace!(
            target: "shale::block",
            file = %self.name, extend_size = live.extend_size,
            "extending file"
        );
        self.file.set_len(live.extend_size)?;
        Ok(())
    }

    fn cache_advise_write(&self, bytes: u64) -> Result<()> {
        if self.cfg.os_cache_dirty_max != 0
            && self.os_cache_dirty.fetch_add(bytes, Ordering::AcqRel) + bytes
                > self.cfg.os_cache_dirty_max
        {
            self.os_cache_dirty.store(0, Ordering::Release);
            // Schedule writeback without waiting for it.
            self.file.sync_data()?;
        }
        if self.cfg.os_cache_max != 0 {
            self.cache_advise_read(bytes);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Frees

    /// Return a block to the manager.
    pub fn free(&self, addr: &Addr) -> Result<()> {
        self.latch.check()?;
        tracing::trace!(
            target: "shale::block",
            file = %self.name, off = addr.off, size = addr.size,
            "free"
        );
        let mut live = self.live.lock();
        self.off_free(&mut live, addr.off, addr.size as u64)
    }

    /// Free a range.
    ///
    /// A block allocated since the last checkpoint is nobody else's
    /// business: pull it off the alloc list and make it immediately
    /// available (into `ckpt_avail` while a checkpoint is in progress,
    /// since the in-flight cookie may reference the span). Anything
    /// older might be referenced by an existing checkpoint, so it goes
    /// to the discard list for checkpoint-time accounting.
    pub(crate) fn off_free(&self, live: &mut LiveState, off: u64, size: u64) -> Result<()> {
        let result = if live.ckpt.alloc.intersects(off, size) {
            live.ckpt.alloc.remove_span(off, size).and_then(|()| {
                if live.ckpt_inprogress {
                    live.ckpt.ckpt_avail.insert(off, size)
                } else {
                    live.ckpt.avail.insert(off, size)
                }
            })
        } else {
            live.ckpt.discard.insert(off, size)
        };
        result.map_err(|e| self.escalate(e))
    }

    /// Escalate an invariant violation into a connection panic.
    pub(crate) fn escalate(&self, err: Error) -> Error {
        if err.is_fatal() {
            self.latch.poison(&err.to_string())
        } else {
            err
        }
    }

    // ------------------------------------------------------------------
    // File size management

    /// Truncate the file, resetting the extension boundary.
    pub(crate) fn truncate_file(&self, live: &mut LiveState, len: u64) -> Result<()> {
        tracing::debug!(target: "shale::block", file = %self.name, len, "truncate");
        self.file.set_len(len)?;
        live.file_size = len;
        live.extend_size = len;
        Ok(())
    }

    /// Flush the file to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub(crate) fn read_extlist(
        &self,
        name: &str,
        track_size: bool,
        addr: Option<Addr>,
        file_size: u64,
    ) -> Result<ExtentList> {
        let mut list = match addr {
            None => ExtentList::new(name, track_size),
            Some(addr) => {
                let block = self.read_inner(&addr, false).map_err(|e| self.escalate(e))?;
                ExtentList::from_bytes(name, track_size, &block[BLOCK_DATA_OFFSET..], file_size)?
            }
        };
        list.set_addr(addr);
        Ok(list)
    }

    /// Serialize an extent list and write it as a block, removing the
    /// block itself from the live alloc list: checkpoint extent blocks
    /// never appear on any extent list.
    pub(crate) fn write_extlist_block(
        &self,
        live: &mut LiveState,
        bytes: &[u8],
        entries: usize,
    ) -> Result<Option<Addr>> {
        if entries == 0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; BLOCK_DATA_OFFSET];
        PageHeader::new(
            PageType::BlockManager,
            0,
            0,
            (BLOCK_DATA_OFFSET + bytes.len()) as u32,
            entries as u32,
        )
        .write_to(&mut buf);
        buf.extend_from_slice(bytes);

        let addr = self.write_locked(live, &mut buf, true)?;
        live.ckpt
            .alloc
            .remove_span(addr.off, addr.size as u64)
            .map_err(|e| self.escalate(e))?;
        Ok(Some(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmt::PAGE_HEADER_SIZE;
    use tempfile::tempdir;

    pub(crate) fn page_buf(payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_DATA_OFFSET];
        PageHeader::new(
            PageType::RowLeaf,
            0,
            1,
            (BLOCK_DATA_OFFSET + payload.len()) as u32,
            1,
        )
        .write_to(&mut buf);
        buf.extend_from_slice(payload);
        buf
    }

    fn open_manager(dir: &Path, allocsize: u32) -> BlockManager {
        let path = dir.join("test.shale");
        let cfg = BlockConfig::new().with_allocation_size(allocsize);
        BlockManager::create(&path, &cfg).unwrap();
        let bm = BlockManager::open(&path, cfg, PanicLatch::new()).unwrap();
        bm.checkpoint_load(None, false).unwrap();
        bm
    }

    #[test]
    fn test_create_writes_descriptor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("desc.shale");
        let cfg = BlockConfig::new().with_allocation_size(512);
        BlockManager::create(&path, &cfg).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 512);
        let desc = FileDesc::from_block(&bytes).unwrap();
        assert_eq!(desc.magic, crate::fmt::BLOCK_MAGIC);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dup.shale");
        let cfg = BlockConfig::new().with_allocation_size(512);
        BlockManager::create(&path, &cfg).unwrap();
        assert!(BlockManager::create(&path, &cfg).is_err());
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.shale");
        std::fs::write(&path, vec![0xaa; 4096]).unwrap();
        let cfg = BlockConfig::new();
        assert!(matches!(
            BlockManager::open(&path, cfg, PanicLatch::new()),
            Err(Error::CorruptFile(_))
        ));
    }

    #[test]
    fn test_forced_salvage_skips_descriptor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("forced.shale");
        std::fs::write(&path, vec![0xaa; 4096]).unwrap();
        let mut cfg = BlockConfig::new();
        cfg.forced_salvage = true;
        assert!(BlockManager::open(&path, cfg, PanicLatch::new()).is_ok());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let bm = open_manager(dir.path(), 512);

        let mut buf = page_buf(b"hello block manager");
        let addr = bm.write(&mut buf, true).unwrap();
        assert_eq!(addr.off % 512, 0);
        assert_eq!(addr.size % 512, 0);

        let read = bm.read(&addr).unwrap();
        assert_eq!(read, buf);
        assert_eq!(&read[BLOCK_DATA_OFFSET..BLOCK_DATA_OFFSET + 19], b"hello block manager");
    }

    #[test]
    fn test_header_only_checksum_roundtrip() {
        let dir = tempdir().unwrap();
        let bm = open_manager(dir.path(), 512);

        let mut buf = page_buf(&vec![7u8; 700]);
        let addr = bm.write(&mut buf, false).unwrap();
        let read = bm.read(&addr).unwrap();
        assert_eq!(read, buf);
    }

    #[test]
    fn test_checksum_detects_single_byte_mutation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mut.shale");
        let cfg = BlockConfig::new().with_allocation_size(512);
        BlockManager::create(&path, &cfg).unwrap();
        let bm = BlockManager::open(&path, cfg.clone(), PanicLatch::new()).unwrap();
        bm.checkpoint_load(None, false).unwrap();

        let mut buf = page_buf(b"sensitive");
        let addr = bm.write(&mut buf, true).unwrap();

        // Flip one byte in the middle of the stored block.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let mut byte = [0u8; 1];
        let target = addr.off + PAGE_HEADER_SIZE as u64 + 20;
        bm.file.read_exact_at(&mut byte, target).unwrap();
        byte[0] ^= 0x01;
        file.write_all_at(&byte, target).unwrap();

        assert!(matches!(bm.read_quiet(&addr), Err(Error::CorruptBlock(_))));
        // The strict path poisons the connection.
        assert!(matches!(bm.read(&addr), Err(Error::Panic(_))));
        assert!(bm.latch().is_poisoned());
    }

    #[test]
    fn test_free_and_reuse_first_fit() {
        let dir = tempdir().unwrap();
        let bm = open_manager(dir.path(), 512);

        // File starts with just the 512B descriptor.
        let a = bm.write(&mut page_buf(b"A"), true).unwrap();
        let b = bm.write(&mut page_buf(b"B"), true).unwrap();
        assert_eq!(a.off, 512);
        assert_eq!(b.off, 1024);

        bm.free(&a).unwrap();
        let c = bm.write(&mut page_buf(b"C"), true).unwrap();
        assert_eq!(c.off, 512, "freed space is reused first-fit");

        let read = bm.read(&c).unwrap();
        assert_eq!(&read[BLOCK_DATA_OFFSET..BLOCK_DATA_OFFSET + 1], b"C");
    }

    #[test]
    fn test_best_fit_matches_first_fit_single_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("best.shale");
        let cfg = BlockConfig::new()
            .with_allocation_size(512)
            .with_allocation(AllocPolicy::BestFit);
        BlockManager::create(&path, &cfg).unwrap();
        let bm = BlockManager::open(&path, cfg, PanicLatch::new()).unwrap();
        bm.checkpoint_load(None, false).unwrap();

        let a = bm.write(&mut page_buf(b"A"), true).unwrap();
        let _b = bm.write(&mut page_buf(b"B"), true).unwrap();
        bm.free(&a).unwrap();
        let c = bm.write(&mut page_buf(b"C"), true).unwrap();
        assert_eq!(c.off, 512);
    }

    #[test]
    fn test_extension_boundary_exact_fit_does_not_extend() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("extend.shale");
        let cfg = BlockConfig::new()
            .with_allocation_size(512)
            .with_extend_len(1024);
        BlockManager::create(&path, &cfg).unwrap();
        let bm = BlockManager::open(&path, cfg, PanicLatch::new()).unwrap();
        bm.checkpoint_load(None, false).unwrap();

        // extend_size starts at the 512-byte file size: the first write
        // crosses it and extends to file_size + 2 * extend_len.
        bm.write(&mut page_buf(b"x"), true).unwrap();
        {
            let live = bm.live();
            assert_eq!(live.extend_size, 1024 + 2048);
        }

        // Writes that end exactly at the boundary leave it alone.
        let mut big = page_buf(&vec![0u8; 2048 - BLOCK_DATA_OFFSET - 1]);
        bm.write(&mut big, true).unwrap();
        {
            let live = bm.live();
            assert_eq!(live.file_size, 3072);
            assert_eq!(live.extend_size, 3072, "exact fit must not extend");
        }
    }

    #[test]
    fn test_write_size_limit() {
        let dir = tempdir().unwrap();
        let bm = open_manager(dir.path(), 512);
        assert!(bm.write_size(1024).is_ok());
        assert!(bm.write_size(u32::MAX as usize).is_err());
    }

    #[test]
    fn test_encrypted_write_read_roundtrip() {
        struct XorEncryptor(u8);
        impl Encryptor for XorEncryptor {
            fn encrypt(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
                dst.extend(src.iter().map(|b| b ^ self.0));
                Ok(())
            }
            fn decrypt(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
                self.encrypt(src, dst)
            }
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("enc.shale");
        let cfg = BlockConfig::new().with_allocation_size(512);
        BlockManager::create(&path, &cfg).unwrap();
        let bm = BlockManager::open(&path, cfg, PanicLatch::new())
            .unwrap()
            .with_encryptor(Arc::new(XorEncryptor(0x5a)));
        bm.checkpoint_load(None, false).unwrap();

        let mut buf = page_buf(&vec![0x11u8; 200]);
        let plain = buf.clone();
        let addr = bm.write(&mut buf, true).unwrap();

        // The payload on disk is not the plaintext.
        let mut raw = vec![0u8; addr.size as usize];
        bm.file.read_exact_at(&mut raw, addr.off).unwrap();
        assert_ne!(
            &raw[BLOCK_COMPRESS_SKIP..BLOCK_COMPRESS_SKIP + 100],
            &plain[BLOCK_COMPRESS_SKIP..BLOCK_COMPRESS_SKIP + 100]
        );

        // Reads hand back the plaintext payload.
        let read = bm.read(&addr).unwrap();
        assert_eq!(
            &read[BLOCK_DATA_OFFSET..plain.len()],
            &plain[BLOCK_DATA_OFFSET..]
        );
    }

    #[test]
    fn test_poisoned_latch_rejects_calls() {
        let dir = tempdir().unwrap();
        let bm = open_manager(dir.path(), 512);
        bm.latch().poison("test poison");
        assert!(matches!(bm.write(&mut page_buf(b"x"), true), Err(Error::Panic(_))));
        let addr = Addr::new(512, 512, 0);
        assert!(matches!(bm.read(&addr), Err(Error::Panic(_))));
        assert!(matches!(bm.free(&addr), Err(Error::Panic(_))));
    }
}
