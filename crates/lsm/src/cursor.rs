//! The LSM merge cursor.
//!
//! One cursor presents the chunk stack as a single ordered store. A
//! lookup walks chunks newest to oldest, skipping chunks whose Bloom
//! filters rule the key out; iteration keeps every chunk cursor
//! positioned and repeatedly takes the smallest (or largest) key,
//! newest chunk winning ties; updates land in the primary after
//! probing sealed chunks for snapshot conflicts.
//!
//! The cursor watches the tree's generation counter: any switch or
//! merge invalidates the chunk view and the next operation reopens its
//! chunk cursors.

use crate::bloom::{Bloom, BloomHash};
use crate::chunk::{deleted_decode, deleted_encode, is_deleted, Chunk, ChunkCursor, TOMBSTONE};
use crate::tree::LsmTree;
use crate::worker::{LsmManager, LsmWorkType};
use shale_core::{Error, Isolation, Result};
use shale_txn::{TxnSession, UpdateCell};
use shale_wal::TxnOp;
use std::cmp::Ordering as Cmp;
use std::sync::Arc;
use std::time::Duration;

/// How often a blocked writer re-requests the switch it is waiting on.
const SWITCH_RETRY_SPINS: u64 = 1000;
/// Sleep between switch-wait spins.
const SWITCH_WAIT: Duration = Duration::from_micros(10);
/// Updates between throttle checks.
const THROTTLE_PERIOD: u64 = 100;

/// A merge cursor over an LSM tree.
pub struct LsmCursor {
    tree: Arc<LsmTree>,
    manager: Option<Arc<LsmManager>>,
    fileid: u32,
    /// Blind-write mode: updates skip the read-modify-write lookup
    overwrite: bool,

    chunks: Vec<Arc<Chunk>>,
    cursors: Vec<ChunkCursor>,
    blooms: Vec<Option<Arc<Bloom>>>,
    switch_txns: Vec<u64>,
    /// Trailing chunks an update must probe for snapshot conflicts
    nupdates: usize,
    /// Chunk index of the cursor holding the merged position
    current: Option<usize>,
    /// More than one chunk cursor sits on the current key
    multiple: bool,
    iterate_next: bool,
    iterate_prev: bool,
    open_read: bool,
    open_snapshot: bool,
    dsk_gen: u64,
    update_count: u64,

    /// Merged position, copied out of the winning chunk cursor
    key: Vec<u8>,
    value: Vec<u8>,
    positioned: bool,
}

impl LsmCursor {
    /// Open a cursor on `tree`.
    ///
    /// `fileid` names the tree in logged operations. With `overwrite`
    /// set, updates write blindly instead of read-modify-write.
    pub fn new(
        tree: Arc<LsmTree>,
        manager: Option<Arc<LsmManager>>,
        fileid: u32,
        overwrite: bool,
    ) -> Self {
        LsmCursor {
            tree,
            manager,
            fileid,
            overwrite,
            chunks: Vec::new(),
            cursors: Vec::new(),
            blooms: Vec::new(),
            switch_txns: Vec::new(),
            nupdates: 0,
            current: None,
            multiple: false,
            iterate_next: false,
            iterate_prev: false,
            open_read: false,
            open_snapshot: false,
            // The tree's generation starts at one, so the first
            // operation always opens chunk cursors.
            dsk_gen: 0,
            update_count: 0,
            key: Vec::new(),
            value: Vec::new(),
            positioned: false,
        }
    }

    /// The merged cursor's current key.
    pub fn key(&self) -> Option<&[u8]> {
        self.positioned.then_some(self.key.as_slice())
    }

    /// Give up the cursor's position.
    pub fn reset(&mut self) {
        self.reset_cursors(None);
        self.positioned = false;
        self.key.clear();
        self.value.clear();
    }

    // ------------------------------------------------------------------
    // Entering operations

    fn enter(&mut self, session: &mut TxnSession, update: bool) -> Result<()> {
        session.cursor_op();
        loop {
            if self.dsk_gen != self.tree.dsk_gen() {
                self.open_cursors(session, update)?;
            }

            if update {
                session.id_check()?;
                self.enter_update(session)?;
                if self.dsk_gen != self.tree.dsk_gen() {
                    continue;
                }

                // How many trailing chunks conflict checks must cover:
                // any sealed chunk whose switch id overlaps our
                // snapshot could carry a racing update.
                self.nupdates = 1;
                if session.isolation() == Isolation::Snapshot && self.open_snapshot {
                    let snap_min = session
                        .snapshot()
                        .map(|s| s.snap_min)
                        .unwrap_or_default();
                    let nchunks = self.chunks.len();
                    for i in (0..nchunks.saturating_sub(1)).rev() {
                        if self.switch_txns[i] < snap_min {
                            break;
                        }
                        self.nupdates += 1;
                    }
                }
            }

            let iso_ok = !update
                || session.isolation() != Isolation::Snapshot
                || self.open_snapshot;
            let have_primary = self
                .chunks
                .last()
                .map(|c| c.is_primary())
                .unwrap_or(false);
            if iso_ok && ((update && have_primary) || (!update && self.open_read)) {
                return Ok(());
            }
            self.open_cursors(session, update)?;
        }
    }

    /// Make sure an update can proceed: the primary must exist and
    /// have room. Past the soft limit a switch is requested and the
    /// write continues; past the hard limit (twice the configured
    /// size) the writer blocks until the switch lands.
    fn enter_update(&mut self, session: &TxnSession) -> Result<()> {
        let chunk_size = self.tree.config().chunk_size;
        let hard_limit = self.tree.need_switch();

        let have_primary = match self.chunks.last() {
            Some(primary) if primary.is_primary() => {
                // A sealed ex-primary still takes writes from
                // transactions older than its switch id.
                true
            }
            Some(chunk) => session.id() < chunk.switch_txn(),
            None => false,
        };

        if have_primary {
            let limit = if hard_limit {
                2 * chunk_size
            } else {
                chunk_size
            };
            let over = self
                .chunks
                .last()
                .map(|c| c.mem_size() > limit)
                .unwrap_or(false);
            if !over {
                return Ok(());
            }
        }

        self.request_switch();
        if have_primary && !hard_limit {
            return Ok(());
        }
        self.await_switch()
    }

    /// Ask the workers for a switch, unless the tree moved under us
    /// since we opened (one switch per generation is enough; switching
    /// again would make very small chunks).
    fn request_switch(&self) {
        if self.tree.need_switch() {
            return;
        }
        if self.dsk_gen == self.tree.dsk_gen() {
            self.tree.set_need_switch();
            if let Some(manager) = &self.manager {
                manager.push_entry(LsmWorkType::Switch, &self.tree);
            }
        }
    }

    /// Block until the chunk array changes, re-posting the switch
    /// request periodically in case the workers dropped it.
    fn await_switch(&self) -> Result<()> {
        let mut spins = 0u64;
        while self.tree.dsk_gen() == self.dsk_gen {
            if spins % SWITCH_RETRY_SPINS == 0 {
                match &self.manager {
                    Some(manager) => manager.push_entry(LsmWorkType::Switch, &self.tree),
                    // Without workers, do the switch here.
                    None => self.tree.switch()?,
                }
            }
            std::thread::sleep(SWITCH_WAIT);
            spins += 1;
        }
        Ok(())
    }

    /// Open (or refresh) the per-chunk cursors for the current chunk
    /// array.
    fn open_cursors(&mut self, session: &mut TxnSession, update: bool) -> Result<()> {
        if update && session.isolation() == Isolation::Snapshot {
            self.open_snapshot = true;
        }
        // Reads need the full stack; so do update cursors doing
        // read-modify-write.
        if !update || !self.overwrite {
            self.open_read = true;
        }
        self.iterate_next = false;
        self.iterate_prev = false;
        self.current = None;

        loop {
            let (chunks, gen) = self.tree.chunks();

            // Keep cursors still pointing at the right chunk with the
            // right Bloom state; everything past the first mismatch is
            // reopened.
            let mut ngood = 0;
            while ngood < self.cursors.len() && ngood < chunks.len() {
                let chunk = &chunks[ngood];
                if !Arc::ptr_eq(self.cursors[ngood].chunk(), chunk) {
                    break;
                }
                let want_bloom = !chunk.is_primary() && chunk.on_disk() && chunk.bloom().is_some();
                if want_bloom != self.blooms[ngood].is_some() {
                    break;
                }
                ngood += 1;
            }

            self.cursors.truncate(ngood);
            self.blooms.truncate(ngood);
            self.chunks.truncate(ngood);
            self.switch_txns.truncate(ngood);

            for chunk in &chunks[ngood..] {
                if chunk.on_disk() && !chunk.is_empty_chunk() {
                    chunk.load(self.tree.block_manager())?;
                }
                self.cursors.push(ChunkCursor::new(Arc::clone(chunk)));
                let bloom = if !chunk.is_primary() && chunk.on_disk() {
                    chunk.bloom()
                } else {
                    None
                };
                self.blooms.push(bloom);
                self.switch_txns.push(chunk.switch_txn());
                self.chunks.push(Arc::clone(chunk));
            }

            // Loading chunk data can block; if the tree moved while we
            // were at it, go around.
            if self.tree.dsk_gen() == gen {
                self.dsk_gen = gen;
                return Ok(());
            }
        }
    }

    fn reset_cursors(&mut self, skip: Option<usize>) {
        if self.current.is_none() && !self.iterate_next && !self.iterate_prev {
            return;
        }
        for (i, cursor) in self.cursors.iter_mut().enumerate() {
            if Some(i) == skip {
                continue;
            }
            cursor.reset();
        }
        self.current = None;
        self.iterate_next = false;
        self.iterate_prev = false;
    }

    // ------------------------------------------------------------------
    // Lookup

    /// Exact search. Tombstoned keys read as absent.
    pub fn search(&mut self, session: &mut TxnSession, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.enter(session, false)?;
        self.reset_cursors(None);
        match self.lookup(session, key)? {
            Some(mut value) => {
                deleted_decode(&mut value);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Position on `key` and return the raw stored value, newest chunk
    /// first, tombstones included.
    fn lookup(&mut self, session: &TxnSession, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let vis = |t: u64| session.visible(t);
        let mut hash: Option<BloomHash> = None;

        for i in (0..self.cursors.len()).rev() {
            if let Some(bloom) = &self.blooms[i] {
                let h = hash.get_or_insert_with(|| BloomHash::new(key));
                if !bloom.maybe_contains_hash(h) {
                    tracing::trace!(
                        target: "shale::lsm",
                        tree = %self.tree.name(), chunk = self.chunks[i].id(),
                        "bloom skip"
                    );
                    continue;
                }
            }
            if let Some(value) = self.cursors[i].search(key, &vis) {
                let value = value.to_vec();
                self.current = Some(i);
                self.key = key.to_vec();
                self.value = value.clone();
                self.positioned = true;
                if is_deleted(&value) {
                    self.positioned = false;
                    return Ok(None);
                }
                return Ok(Some(value));
            }
        }
        self.positioned = false;
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Iteration

    /// Advance to the next key, decoded; `None` at the end.
    pub fn next(&mut self, session: &mut TxnSession) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.enter(session, false)?;
        let vis = |t: u64| session.visible(t);

        // If we aren't positioned for a forward scan, get started:
        // stand every chunk cursor at or just after the merged key.
        let mut advance = if self.current.is_none() || !self.iterate_next {
            self.multiple = false;
            for i in (0..self.cursors.len()).rev() {
                if !self.positioned {
                    self.cursors[i].reset();
                    self.cursors[i].next(&vis);
                } else if self.current != Some(i) {
                    match self.cursors[i].search_near(&self.key, &vis) {
                        Some(Cmp::Less) => {
                            self.cursors[i].next(&vis);
                        }
                        Some(Cmp::Equal) => {
                            if self.current.is_none() {
                                self.current = Some(i);
                            } else {
                                self.multiple = true;
                            }
                        }
                        Some(Cmp::Greater) | None => {}
                    }
                }
            }
            self.iterate_next = true;
            self.iterate_prev = false;
            // We just positioned *at* the key; now move off it.
            self.current.is_some()
        } else {
            true
        };

        loop {
            if advance {
                let current = self.current.expect("positioned cursor");
                // Everybody sitting on the current key moves past it.
                if self.multiple {
                    for i in 0..self.cursors.len() {
                        if i == current || !self.cursors[i].positioned() {
                            continue;
                        }
                        if self.cursors[i].key() == Some(self.key.as_slice()) {
                            self.cursors[i].next(&vis);
                        }
                    }
                }
                self.cursors[current].next(&vis);
            }
            advance = true;

            match self.take_current(true) {
                None => {
                    self.positioned = false;
                    return Ok(None);
                }
                Some(deleted) if deleted => continue,
                Some(_) => {
                    let mut value = self.value.clone();
                    deleted_decode(&mut value);
                    return Ok(Some((self.key.clone(), value)));
                }
            }
        }
    }

    /// Step to the previous key, decoded; `None` at the start.
    pub fn prev(&mut self, session: &mut TxnSession) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.enter(session, false)?;
        let vis = |t: u64| session.visible(t);

        let mut advance = if self.current.is_none() || !self.iterate_prev {
            self.multiple = false;
            for i in (0..self.cursors.len()).rev() {
                if !self.positioned {
                    self.cursors[i].reset();
                    self.cursors[i].prev(&vis);
                } else if self.current != Some(i) {
                    match self.cursors[i].search_near(&self.key, &vis) {
                        Some(Cmp::Greater) => {
                            self.cursors[i].prev(&vis);
                        }
                        Some(Cmp::Equal) => {
                            if self.current.is_none() {
                                self.current = Some(i);
                            } else {
                                self.multiple = true;
                            }
                        }
                        Some(Cmp::Less) | None => {}
                    }
                }
            }
            self.iterate_prev = true;
            self.iterate_next = false;
            self.current.is_some()
        } else {
            true
        };

        loop {
            if advance {
                let current = self.current.expect("positioned cursor");
                if self.multiple {
                    for i in 0..self.cursors.len() {
                        if i == current || !self.cursors[i].positioned() {
                            continue;
                        }
                        if self.cursors[i].key() == Some(self.key.as_slice()) {
                            self.cursors[i].prev(&vis);
                        }
                    }
                }
                self.cursors[current].prev(&vis);
            }
            advance = true;

            match self.take_current(false) {
                None => {
                    self.positioned = false;
                    return Ok(None);
                }
                Some(deleted) if deleted => continue,
                Some(_) => {
                    let mut value = self.value.clone();
                    deleted_decode(&mut value);
                    return Ok(Some((self.key.clone(), value)));
                }
            }
        }
    }

    /// Find the smallest (or largest) key across the positioned chunk
    /// cursors and copy it out. Returns whether that entry is a
    /// tombstone, or `None` when no cursor is positioned.
    ///
    /// Walking from the newest chunk down means ties keep the newest
    /// chunk's entry, which is the version that shadows the rest.
    fn take_current(&mut self, smallest: bool) -> Option<bool> {
        let mut current: Option<usize> = None;
        self.multiple = false;

        for i in (0..self.cursors.len()).rev() {
            let Some(key) = self.cursors[i].key() else {
                continue;
            };
            match current {
                None => current = Some(i),
                Some(c) => {
                    let cmp = key.cmp(self.cursors[c].key().expect("positioned"));
                    let better = if smallest {
                        cmp == Cmp::Less
                    } else {
                        cmp == Cmp::Greater
                    };
                    if better {
                        current = Some(i);
                        self.multiple = false;
                    } else if cmp == Cmp::Equal {
                        self.multiple = true;
                    }
                }
            }
        }

        let current = current?;
        self.current = Some(current);
        self.key = self.cursors[current].key().expect("positioned").to_vec();
        self.value = self.cursors[current].value().expect("positioned").to_vec();
        self.positioned = true;
        Some(is_deleted(&self.value))
    }

    /// Position near `key`: prefer the smallest key at or above the
    /// target, fall back to the largest below it. Returns the entry
    /// and the comparison of the landing key against the target.
    pub fn search_near(
        &mut self,
        session: &mut TxnSession,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>, Cmp)>> {
        self.enter(session, false)?;
        self.reset_cursors(None);
        self.iterate_next = false;
        self.iterate_prev = false;

        let vis = |t: u64| session.visible(t);
        let mut closest: Option<usize> = None;
        let mut exact = false;

        // Stop at the first exact match walking newest to oldest;
        // otherwise keep the smallest cursor above the search key.
        for i in (0..self.cursors.len()).rev() {
            match self.cursors[i].search_near(key, &vis) {
                None => continue,
                Some(Cmp::Equal) => {
                    closest = Some(i);
                    exact = true;
                    break;
                }
                Some(Cmp::Less) => {
                    if !self.cursors[i].next(&vis) {
                        continue;
                    }
                }
                Some(Cmp::Greater) => {}
            }
            closest = match closest {
                None => Some(i),
                Some(c) => {
                    let ck = self.cursors[c].key().expect("positioned");
                    if self.cursors[i].key().expect("positioned") < ck {
                        Some(i)
                    } else {
                        Some(c)
                    }
                }
            };
        }

        // At this point closest is an exact match or the smallest
        // entry above the key, and may be a tombstone that shadows
        // whatever we'd otherwise return.
        let Some(c) = closest else {
            // Nothing at or above the key; the largest below it is the
            // answer if one exists.
            self.positioned = true;
            self.key = key.to_vec();
            self.current = None;
            return match self.prev(session)? {
                Some((k, v)) => Ok(Some((k, v, Cmp::Less))),
                None => {
                    self.positioned = false;
                    Ok(None)
                }
            };
        };

        self.current = Some(c);
        self.key = self.cursors[c].key().expect("positioned").to_vec();
        self.value = self.cursors[c].value().expect("positioned").to_vec();
        self.positioned = true;

        if !is_deleted(&self.value) {
            let mut value = self.value.clone();
            deleted_decode(&mut value);
            let cmp = if exact { Cmp::Equal } else { Cmp::Greater };
            return Ok(Some((self.key.clone(), value, cmp)));
        }

        // Landed on a tombstone: the next real key is "greater", and
        // failing that the previous one is "less".
        if let Some((k, v)) = self.next(session)? {
            return Ok(Some((k, v, Cmp::Greater)));
        }
        match self.prev(session)? {
            Some((k, v)) => Ok(Some((k, v, Cmp::Less))),
            None => {
                self.positioned = false;
                Ok(None)
            }
        }
    }

    // ------------------------------------------------------------------
    // Updates

    /// Insert a key. Without overwrite mode an existing visible key is
    /// a duplicate.
    pub fn insert(&mut self, session: &mut TxnSession, key: &[u8], value: &[u8]) -> Result<()> {
        self.insert_inner(session, key, value).map_err(|e| {
            self.reset();
            e
        })
    }

    fn insert_inner(&mut self, session: &mut TxnSession, key: &[u8], value: &[u8]) -> Result<()> {
        self.enter(session, true)?;
        if !self.overwrite && self.lookup(session, key)?.is_some() {
            return Err(Error::DuplicateKey);
        }
        let encoded = deleted_encode(value);
        self.put(session, key, &encoded, false)?;
        // Insert doesn't leave the cursor positioned; the caller may
        // free the key and value it configured.
        self.positioned = false;
        Ok(())
    }

    /// Update a key. Without overwrite mode the key must exist.
    pub fn update(&mut self, session: &mut TxnSession, key: &[u8], value: &[u8]) -> Result<()> {
        self.update_inner(session, key, value).map_err(|e| {
            self.reset();
            e
        })
    }

    fn update_inner(&mut self, session: &mut TxnSession, key: &[u8], value: &[u8]) -> Result<()> {
        self.enter(session, true)?;
        if !self.overwrite && self.lookup(session, key)?.is_none() {
            return Err(Error::NotFound);
        }
        let encoded = deleted_encode(value);
        self.put(session, key, &encoded, true)
    }

    /// Remove a key by writing a tombstone. Without overwrite mode the
    /// key must exist.
    pub fn remove(&mut self, session: &mut TxnSession, key: &[u8]) -> Result<()> {
        self.remove_inner(session, key).map_err(|e| {
            self.reset();
            e
        })
    }

    fn remove_inner(&mut self, session: &mut TxnSession, key: &[u8]) -> Result<()> {
        self.enter(session, true)?;
        if !self.overwrite && self.lookup(session, key)?.is_none() {
            return Err(Error::NotFound);
        }
        self.put(session, key, TOMBSTONE, true)
    }

    /// Write into the primary, probing older chunks for snapshot
    /// conflicts first.
    fn put(
        &mut self,
        session: &mut TxnSession,
        key: &[u8],
        value: &[u8],
        position: bool,
    ) -> Result<()> {
        let nchunks = self.cursors.len();
        debug_assert!(nchunks > 0, "entered update without a primary");
        let primary = nchunks - 1;
        let txnid = session.id();

        self.reset_cursors(Some(primary));
        if position {
            self.current = Some(primary);
            self.key = key.to_vec();
            self.value = value.to_vec();
            self.positioned = true;
        }

        let mut primary_cell = None;
        {
            let vis = |t: u64| session.visible(t);
            for i in 0..self.nupdates.min(nchunks) {
                let slot = nchunks - 1 - i;
                // Once a chunk's switch id is visible, every writer
                // that could race in it has resolved; stop checking.
                if i > 0 && vis(self.switch_txns[slot]) {
                    self.nupdates = i;
                    break;
                }
                let cell = UpdateCell::new(txnid);
                self.chunks[slot].insert(key, value, Arc::clone(&cell), i > 0, &vis)?;
                if i == 0 {
                    primary_cell = Some(cell);
                }
            }
        }

        let op = if is_deleted(value) {
            TxnOp::RowRemove {
                fileid: self.fileid,
                key: key.to_vec(),
            }
        } else {
            TxnOp::RowPut {
                fileid: self.fileid,
                key: key.to_vec(),
                value: value.to_vec(),
            }
        };
        session.log_op(op, primary_cell)?;

        // Throttle periodically so merges and checkpoints keep up; the
        // shared chunk counter races, so keep a cursor-local count too.
        self.update_count += 1;
        let cfg = self.tree.config();
        let throttle = cfg.merge_throttle + cfg.ckpt_throttle;
        if throttle > 0
            && (self.chunks[primary].count() % THROTTLE_PERIOD == 0
                || self.update_count % THROTTLE_PERIOD == 0)
        {
            std::thread::sleep(Duration::from_micros(throttle));
        }
        Ok(())
    }
}
