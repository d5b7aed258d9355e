//! LSM chunks and per-chunk cursors.
//!
//! A chunk is one ordered key-value store in the tree's stack. The
//! newest chunk (the primary) takes writes; older chunks are sealed at
//! a switch transaction id and eventually written out through the
//! block manager as a single content block plus an optional Bloom
//! filter block.
//!
//! Deletes are recorded as tombstones: the two-byte value `0x14 0x14`.
//! A user value that happens to begin with those bytes grows a trailing
//! escape byte on the way in and loses it on the way out; merge-level
//! readers see tombstones and escapes raw.

use crate::bloom::Bloom;
use parking_lot::{Mutex, RwLock};
use shale_block::{Addr, BlockManager, PageHeader, PageType, BLOCK_DATA_OFFSET};
use shale_core::{Error, LsmConfig, PackStream, Result, UnpackStream};
use shale_txn::{UpdateCell, TXN_ABORTED, TXN_NONE};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// The tombstone marker: two DC4 bytes, chosen to make collision with
/// application encodings unlikely.
pub const TOMBSTONE: &[u8] = b"\x14\x14";

/// Whether a stored value is a tombstone.
pub fn is_deleted(value: &[u8]) -> bool {
    value == TOMBSTONE
}

/// Encode a user value for storage, escaping values that begin with
/// the tombstone bytes.
pub fn deleted_encode(value: &[u8]) -> Vec<u8> {
    if value.starts_with(TOMBSTONE) {
        let mut escaped = Vec::with_capacity(value.len() + 1);
        escaped.extend_from_slice(value);
        escaped.push(TOMBSTONE[0]);
        escaped
    } else {
        value.to_vec()
    }
}

/// Undo [`deleted_encode`] on a value read back for a user.
pub fn deleted_decode(value: &mut Vec<u8>) {
    if value.len() > TOMBSTONE.len() && value.starts_with(TOMBSTONE) {
        value.pop();
    }
}

/// Visibility predicate over update transaction ids.
pub type VisFn<'a> = dyn Fn(u64) -> bool + 'a;

#[derive(Debug, Clone)]
struct Version {
    cell: Arc<UpdateCell>,
    value: Vec<u8>,
}

/// Newest-first update chain for one key.
type VersionChain = Vec<Version>;

fn newest_live(chain: &VersionChain) -> Option<&Version> {
    chain.iter().find(|v| v.cell.txnid() != TXN_ABORTED)
}

fn first_visible<'a>(chain: &'a VersionChain, vis: &VisFn<'_>) -> Option<&'a Version> {
    chain
        .iter()
        .find(|v| v.cell.txnid() != TXN_ABORTED && vis(v.cell.txnid()))
}

/// One chunk in an LSM tree.
#[derive(Debug)]
pub struct Chunk {
    id: u32,
    uri: String,
    /// Id at which the chunk was frozen; `TXN_NONE` while primary
    switch_txn: AtomicU64,
    /// Approximate record count
    count: AtomicU64,
    /// Approximate bytes of keys and values
    mem_size: AtomicU64,
    on_disk: AtomicBool,
    /// On-disk chunk opened without a checkpoint (no content block)
    empty: AtomicBool,
    data: RwLock<BTreeMap<Vec<u8>, VersionChain>>,
    disk_addr: Mutex<Option<Addr>>,
    bloom_addr: Mutex<Option<Addr>>,
    bloom: Mutex<Option<Arc<Bloom>>>,
}

impl Chunk {
    /// Create an empty in-memory chunk.
    pub fn new(id: u32, tree_name: &str) -> Arc<Self> {
        Arc::new(Chunk {
            id,
            uri: format!("lsm:{tree_name}-{id:06}"),
            switch_txn: AtomicU64::new(TXN_NONE),
            count: AtomicU64::new(0),
            mem_size: AtomicU64::new(0),
            on_disk: AtomicBool::new(false),
            empty: AtomicBool::new(false),
            data: RwLock::new(BTreeMap::new()),
            disk_addr: Mutex::new(None),
            bloom_addr: Mutex::new(None),
            bloom: Mutex::new(None),
        })
    }

    /// Chunk id, unique within its tree.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The chunk's object name.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The freeze id, `TXN_NONE` while the chunk is the primary.
    pub fn switch_txn(&self) -> u64 {
        self.switch_txn.load(Ordering::Acquire)
    }

    /// Seal the chunk at `txnid`.
    pub fn set_switch_txn(&self, txnid: u64) {
        self.switch_txn.store(txnid, Ordering::Release);
    }

    /// Whether the chunk still takes writes.
    pub fn is_primary(&self) -> bool {
        self.switch_txn() == TXN_NONE
    }

    /// Whether the chunk's content has been written out.
    pub fn on_disk(&self) -> bool {
        self.on_disk.load(Ordering::Acquire)
    }

    /// Whether the chunk was sealed with no live records.
    pub fn is_empty_chunk(&self) -> bool {
        self.empty.load(Ordering::Acquire)
    }

    /// Approximate record count.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Approximate in-memory byte size.
    pub fn mem_size(&self) -> u64 {
        self.mem_size.load(Ordering::Relaxed)
    }

    /// The content block address once flushed.
    pub fn disk_addr(&self) -> Option<Addr> {
        *self.disk_addr.lock()
    }

    /// The Bloom filter block address once flushed.
    pub fn bloom_addr(&self) -> Option<Addr> {
        *self.bloom_addr.lock()
    }

    pub(crate) fn set_disk_addr(&self, addr: Option<Addr>) {
        *self.disk_addr.lock() = addr;
        if addr.is_some() {
            self.on_disk.store(true, Ordering::Release);
        }
    }

    pub(crate) fn set_bloom_addr(&self, addr: Option<Addr>) {
        *self.bloom_addr.lock() = addr;
    }

    /// The chunk's Bloom filter, if one was built or loaded.
    pub fn bloom(&self) -> Option<Arc<Bloom>> {
        self.bloom.lock().clone()
    }

    /// Insert or update a key.
    ///
    /// The newest live version is the conflict witness: if it isn't
    /// visible to the writer, a concurrent transaction got there first
    /// and the caller must roll back. With `check_only` the write is a
    /// probe into a sealed chunk and nothing is modified.
    pub fn insert(
        &self,
        key: &[u8],
        value: &[u8],
        cell: Arc<UpdateCell>,
        check_only: bool,
        vis: &VisFn<'_>,
    ) -> Result<()> {
        let own = cell.txnid();
        let mut data = self.data.write();
        let chain = data.entry(key.to_vec());

        let chain = match chain {
            std::collections::btree_map::Entry::Occupied(e) => {
                let chain = e.into_mut();
                if let Some(newest) = newest_live(chain) {
                    let txnid = newest.cell.txnid();
                    if txnid != own && !vis(txnid) {
                        return Err(Error::Rollback);
                    }
                }
                chain
            }
            std::collections::btree_map::Entry::Vacant(e) => {
                if check_only {
                    return Ok(());
                }
                e.insert(Vec::new())
            }
        };

        if check_only {
            return Ok(());
        }
        chain.insert(
            0,
            Version {
                cell,
                value: value.to_vec(),
            },
        );
        self.count.fetch_add(1, Ordering::Relaxed);
        self.mem_size
            .fetch_add((key.len() + value.len()) as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Look up the visible value for `key`, tombstones included.
    pub fn search(&self, key: &[u8], vis: &VisFn<'_>) -> Option<Vec<u8>> {
        let data = self.data.read();
        let chain = data.get(key)?;
        first_visible(chain, vis).map(|v| v.value.clone())
    }

    /// The first visible entry with key greater than `after` (or the
    /// smallest overall when `after` is `None`).
    pub fn next_visible(&self, after: Option<&[u8]>, vis: &VisFn<'_>) -> Option<(Vec<u8>, Vec<u8>)> {
        let data = self.data.read();
        let lower = match after {
            Some(key) => Bound::Excluded(key.to_vec()),
            None => Bound::Unbounded,
        };
        for (key, chain) in data.range((lower, Bound::Unbounded)) {
            if let Some(v) = first_visible(chain, vis) {
                return Some((key.clone(), v.value.clone()));
            }
        }
        None
    }

    /// The first visible entry with key less than `before` (or the
    /// largest overall when `before` is `None`).
    pub fn prev_visible(
        &self,
        before: Option<&[u8]>,
        vis: &VisFn<'_>,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        let data = self.data.read();
        let upper = match before {
            Some(key) => Bound::Excluded(key.to_vec()),
            None => Bound::Unbounded,
        };
        for (key, chain) in data.range((Bound::Unbounded, upper)).rev() {
            if let Some(v) = first_visible(chain, vis) {
                return Some((key.clone(), v.value.clone()));
            }
        }
        None
    }

    /// The first visible entry with key at or after `key`.
    pub fn ge(&self, key: &[u8], vis: &VisFn<'_>) -> Option<(Vec<u8>, Vec<u8>)> {
        let data = self.data.read();
        for (k, chain) in data.range((Bound::Included(key.to_vec()), Bound::Unbounded)) {
            if let Some(v) = first_visible(chain, vis) {
                return Some((k.clone(), v.value.clone()));
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Disk form

    /// Serialize the chunk's live content: one committed version per
    /// key, aborted updates skipped.
    fn to_payload(&self) -> (Vec<u8>, u64) {
        let data = self.data.read();
        let mut entries = PackStream::new();
        let mut count = 0u64;
        for (key, chain) in data.iter() {
            if let Some(v) = newest_live(chain) {
                entries.put_bytes(key).put_bytes(&v.value);
                count += 1;
            }
        }
        let mut pack = PackStream::new();
        pack.put_uint(count).put_raw(entries.as_bytes());
        (pack.into_bytes(), count)
    }

    /// Write the chunk's content (and Bloom filter, if configured)
    /// through the block manager.
    pub fn flush(&self, bm: &BlockManager, cfg: &LsmConfig) -> Result<()> {
        debug_assert!(!self.is_primary(), "flushing the primary chunk");
        let (payload, count) = self.to_payload();

        if count == 0 {
            self.empty.store(true, Ordering::Release);
            self.on_disk.store(true, Ordering::Release);
            tracing::debug!(target: "shale::lsm", uri = %self.uri, "chunk sealed empty");
            return Ok(());
        }

        let mut buf = vec![0u8; BLOCK_DATA_OFFSET];
        PageHeader::new(
            PageType::RowLeaf,
            0,
            self.id as u64,
            (BLOCK_DATA_OFFSET + payload.len()) as u32,
            count as u32,
        )
        .write_to(&mut buf);
        buf.extend_from_slice(&payload);
        let addr = bm.write(&mut buf, true)?;
        *self.disk_addr.lock() = Some(addr);

        if cfg.bloom {
            let mut bloom = Bloom::new(count, cfg.bloom_bit_count, cfg.bloom_hash_count);
            {
                let data = self.data.read();
                for (key, chain) in data.iter() {
                    if newest_live(chain).is_some() {
                        bloom.insert(key);
                    }
                }
            }
            let bloom_bytes = bloom.to_bytes();
            let mut buf = vec![0u8; BLOCK_DATA_OFFSET];
            PageHeader::new(
                PageType::Ovfl,
                0,
                self.id as u64,
                (BLOCK_DATA_OFFSET + bloom_bytes.len()) as u32,
                1,
            )
            .write_to(&mut buf);
            buf.extend_from_slice(&bloom_bytes);
            let bloom_block = bm.write(&mut buf, true)?;
            *self.bloom_addr.lock() = Some(bloom_block);
            *self.bloom.lock() = Some(Arc::new(bloom));
        }

        self.on_disk.store(true, Ordering::Release);
        tracing::debug!(
            target: "shale::lsm",
            uri = %self.uri, count, off = addr.off, size = addr.size,
            "chunk flushed"
        );
        Ok(())
    }

    /// Load a flushed chunk's content and Bloom filter back from disk.
    pub fn load(&self, bm: &BlockManager) -> Result<()> {
        let Some(addr) = self.disk_addr() else {
            return Ok(());
        };
        {
            let mut data = self.data.write();
            if !data.is_empty() {
                return Ok(());
            }
            let block = bm.read(&addr)?;
            let mut stream = UnpackStream::new(&block[BLOCK_DATA_OFFSET..]);
            let count = stream.get_uint().map_err(Error::from)?;
            let mut map = BTreeMap::new();
            for _ in 0..count {
                let key = stream.get_bytes().map_err(Error::from)?.to_vec();
                let value = stream.get_bytes().map_err(Error::from)?.to_vec();
                map.insert(
                    key,
                    vec![Version {
                        cell: UpdateCell::new(TXN_NONE),
                        value,
                    }],
                );
            }
            self.count.store(count, Ordering::Relaxed);
            *data = map;
        }

        if let Some(bloom_addr) = self.bloom_addr() {
            let block = bm.read(&bloom_addr)?;
            let bloom = Bloom::from_bytes(&block[BLOCK_DATA_OFFSET..])?;
            *self.bloom.lock() = Some(Arc::new(bloom));
        }
        Ok(())
    }

    /// Iterate the chunk's live entries in key order, tombstones
    /// included. Used by merges.
    pub fn live_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let data = self.data.read();
        data.iter()
            .filter_map(|(k, chain)| newest_live(chain).map(|v| (k.clone(), v.value.clone())))
            .collect()
    }
}

/// A positioned cursor over one chunk.
#[derive(Debug)]
pub struct ChunkCursor {
    chunk: Arc<Chunk>,
    /// Current key when positioned
    pos: Option<(Vec<u8>, Vec<u8>)>,
}

impl ChunkCursor {
    /// Open a cursor on `chunk`.
    pub fn new(chunk: Arc<Chunk>) -> Self {
        ChunkCursor { chunk, pos: None }
    }

    /// The underlying chunk.
    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }

    /// Whether the cursor is positioned on an entry.
    pub fn positioned(&self) -> bool {
        self.pos.is_some()
    }

    /// The current key.
    pub fn key(&self) -> Option<&[u8]> {
        self.pos.as_ref().map(|(k, _)| k.as_slice())
    }

    /// The current value.
    pub fn value(&self) -> Option<&[u8]> {
        self.pos.as_ref().map(|(_, v)| v.as_slice())
    }

    /// Give up the position.
    pub fn reset(&mut self) {
        self.pos = None;
    }

    /// Exact search; positions the cursor on a hit.
    pub fn search(&mut self, key: &[u8], vis: &VisFn<'_>) -> Option<&[u8]> {
        match self.chunk.search(key, vis) {
            Some(value) => {
                self.pos = Some((key.to_vec(), value));
                self.value()
            }
            None => {
                self.pos = None;
                None
            }
        }
    }

    /// Position at the nearest visible entry: the smallest at or after
    /// `key`, else the largest before it. Returns the comparison of
    /// the landing key against the target.
    pub fn search_near(&mut self, key: &[u8], vis: &VisFn<'_>) -> Option<std::cmp::Ordering> {
        if let Some((k, v)) = self.chunk.ge(key, vis) {
            let cmp = k.as_slice().cmp(key);
            self.pos = Some((k, v));
            return Some(cmp);
        }
        if let Some((k, v)) = self.chunk.prev_visible(Some(key), vis) {
            self.pos = Some((k, v));
            return Some(std::cmp::Ordering::Less);
        }
        self.pos = None;
        None
    }

    /// Advance to the next visible entry.
    pub fn next(&mut self, vis: &VisFn<'_>) -> bool {
        let after = self.pos.as_ref().map(|(k, _)| k.clone());
        self.pos = self.chunk.next_visible(after.as_deref(), vis);
        self.pos.is_some()
    }

    /// Step back to the previous visible entry.
    pub fn prev(&mut self, vis: &VisFn<'_>) -> bool {
        let before = self.pos.as_ref().map(|(k, _)| k.clone());
        self.pos = self.chunk.prev_visible(before.as_deref(), vis);
        self.pos.is_some()
    }
}
