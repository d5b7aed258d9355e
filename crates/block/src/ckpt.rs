//! Two-phase checkpoints.
//!
//! Checkpointing a file happens in two steps. First, `checkpoint`
//! writes a new checkpoint to disk: extent lists for the live system
//! and any surviving checkpoints, a list of blocks newly reclaimable
//! because old checkpoints are being deleted, and a fresh cookie per
//! touched checkpoint. The caller then records the cookies in stable
//! metadata, and only afterward calls `checkpoint_resolve`, which
//! merges the reclaimable blocks into the avail list. Allocating from
//! that list any earlier could overwrite blocks a crash would still
//! need.

use crate::addr::{Addr, CheckpointCookie, CHECKPOINT_VERSION};
use crate::ext::{reclaim_overlaps, ExtentList};
use crate::manager::{BlockCkpt, BlockManager, LiveState};
use shale_core::{Error, Result};

/// One checkpoint in the array handed to [`BlockManager::checkpoint`].
///
/// The caller builds the array from its metadata: existing checkpoints
/// in age order (flagging the ones being deleted), terminated by the
/// single checkpoint being added.
#[derive(Debug)]
pub struct CkptEntry {
    /// Checkpoint name, for diagnostics
    pub name: String,
    /// Delete this checkpoint as part of the operation
    pub delete: bool,
    /// The checkpoint has no on-disk presence in this file
    pub fake: bool,
    /// The new checkpoint being created
    pub add: bool,
    /// Cookie: supplied for existing checkpoints, produced for the
    /// added checkpoint and for survivors whose lists were rewritten
    pub cookie: Vec<u8>,
    /// Output: checkpoint size, filled in on the added entry
    pub ckpt_size: u64,
    /// Rewrite this survivor's lists and cookie (set during processing)
    update: bool,
    /// Loaded extent-list state for delete processing
    state: Option<Box<BlockCkpt>>,
}

impl CkptEntry {
    fn new(name: impl Into<String>) -> Self {
        CkptEntry {
            name: name.into(),
            delete: false,
            fake: false,
            add: false,
            cookie: Vec::new(),
            ckpt_size: 0,
            update: false,
            state: None,
        }
    }

    /// An existing checkpoint that survives the operation.
    pub fn keep(name: impl Into<String>, cookie: Vec<u8>) -> Self {
        CkptEntry {
            cookie,
            ..Self::new(name)
        }
    }

    /// An existing checkpoint to delete.
    pub fn delete(name: impl Into<String>, cookie: Vec<u8>) -> Self {
        CkptEntry {
            cookie,
            delete: true,
            ..Self::new(name)
        }
    }

    /// A checkpoint with no blocks in this file.
    pub fn fake(name: impl Into<String>) -> Self {
        CkptEntry {
            fake: true,
            ..Self::new(name)
        }
    }

    /// The new checkpoint being created.
    pub fn add(name: impl Into<String>) -> Self {
        CkptEntry {
            add: true,
            ..Self::new(name)
        }
    }
}

impl BlockManager {
    /// Load a checkpoint.
    ///
    /// For the live system (`readonly == false`) this installs the
    /// cookie's extent state: the avail list is read so allocation can
    /// proceed, and the file is truncated to the checkpoint's size
    /// since anything written after it is garbage. Read-only
    /// checkpoints just crack the cookie. Returns the root address,
    /// absent for an empty checkpoint.
    pub fn checkpoint_load(&self, cookie: Option<&[u8]>, readonly: bool) -> Result<Option<Addr>> {
        self.latch().check()?;
        tracing::debug!(
            target: "shale::block",
            file = %self.name(), readonly, has_cookie = cookie.is_some(),
            "load checkpoint"
        );

        let ci = match cookie {
            Some(c) if !c.is_empty() => Some(CheckpointCookie::from_bytes(c, self.allocsize())?),
            _ => None,
        };
        let root = ci.as_ref().and_then(|ci| ci.root);

        if readonly {
            return Ok(root);
        }

        {
            let mut live = self.live();
            if live.live_open {
                return Err(self
                    .latch()
                    .poison(&format!("{}: live system opened twice", self.name())));
            }
            live.live_open = true;
            live.ckpt = BlockCkpt::new("live");
        }

        // Read the avail list without the live lock; reads take it for
        // diagnostics.
        let (file_size, ckpt_size, avail) = match &ci {
            None => (self.allocsize() as u64, 0, None),
            Some(ci) => {
                let avail = self.read_extlist("live.avail", true, ci.avail, ci.file_size)?;
                (ci.file_size, ci.ckpt_size, Some(avail))
            }
        };

        let mut live = self.live();
        if let Some(avail) = avail {
            live.ckpt.avail = avail;
        }
        live.ckpt.root = root;
        live.ckpt.file_size = file_size;
        live.ckpt.ckpt_size = ckpt_size;

        // Anything after the checkpoint is no longer interesting.
        if !self.config().read_only {
            self.truncate_file(&mut live, file_size)?;
        } else {
            live.file_size = file_size;
            live.extend_size = file_size;
        }
        Ok(root)
    }

    /// Unload the live checkpoint: truncate the unused extension tail
    /// and drop the extent lists.
    pub fn checkpoint_unload(&self) -> Result<()> {
        let mut live = self.live();
        if !self.config().read_only {
            let len = live.file_size;
            self.truncate_file(&mut live, len)?;
        }
        live.ckpt = BlockCkpt::new("live");
        live.live_open = false;
        Ok(())
    }

    /// Create a new checkpoint (phase one of two).
    ///
    /// `root` is the serialized root page, absent for an empty tree.
    /// `ckpts` lists every checkpoint in the file plus the added one;
    /// deleted checkpoints roll their blocks into the next survivor.
    pub fn checkpoint(
        &self,
        root: Option<&mut Vec<u8>>,
        data_cksum: bool,
        ckpts: &mut [CkptEntry],
    ) -> Result<()> {
        self.latch().check()?;
        verify_ckpt_array(ckpts)?;

        // Write toward the start of the file while checkpointing.
        self.configure_first_fit(true);
        let ret = self.ckpt_process(root, data_cksum, ckpts);
        self.configure_first_fit(false);
        ret.map_err(|e| self.escalate(e))
    }

    fn ckpt_process(
        &self,
        root: Option<&mut Vec<u8>>,
        data_cksum: bool,
        ckpts: &mut [CkptEntry],
    ) -> Result<()> {
        // Checkpointing the same file twice without resolving is an
        // error at an upper level, and both choices are bad: leak
        // blocks, or risk allocating blocks a crash still needs. Leaked
        // blocks fail verification forever, so resolve and continue.
        if self.live().ckpt_inprogress {
            tracing::error!(
                target: "shale::block",
                file = %self.name(),
                "checkpointed without first resolving the previous checkpoint"
            );
            self.checkpoint_resolve()?;
        }

        // Write the root page before taking the live lock.
        let root_addr = match root {
            Some(buf) => Some(self.write(buf, data_cksum)?),
            None => None,
        };

        // Deleting a checkpoint needs its extent lists and those of the
        // checkpoint it rolls into; read them from disk before locking
        // things down.
        let deleting = self.ckpt_load_deletes(ckpts)?;

        let mut live = self.live();
        live.ckpt.root = root_addr;

        // The live checkpoint's size must be computed before merges
        // below change the underlying byte counts.
        let ckpt_size =
            live.ckpt.ckpt_size + live.ckpt.alloc.bytes() - live.ckpt.discard.bytes();

        // Reset the reclaim state from any previous cycle.
        live.ckpt.ckpt_avail.clear();
        live.ckpt.ckpt_alloc.clear();
        live.ckpt.ckpt_discard.clear();

        if deleting {
            self.ckpt_delete(&mut live, ckpts)?;
            for entry in ckpts.iter_mut().filter(|e| e.update) {
                let state = entry.state.as_mut().expect("updated survivor was loaded");
                let cookie = self.ckpt_update(&mut live, state)?;
                entry.cookie = cookie;
                entry.update = false;
            }
        }

        // Truncate the file if the avail list ends at its tail.
        let file_size = live.file_size;
        let new_size = live.ckpt.avail.truncate_tail(file_size);
        if new_size != file_size {
            self.truncate_file(&mut live, new_size)?;
        }

        // Update the added checkpoint from the live system.
        for entry in ckpts.iter_mut().filter(|e| e.add) {
            entry.ckpt_size = ckpt_size;
            live.ckpt.ckpt_size = ckpt_size;
            entry.cookie = self.ckpt_update_live(&mut live)?;
        }

        // Reset the live alloc and discard lists, parking the old ones
        // for release at resolve time: freeing them can be a lot of
        // work and resolution is off the critical path.
        live.ckpt.ckpt_alloc = std::mem::replace(
            &mut live.ckpt.alloc,
            ExtentList::new("live.alloc", false),
        );
        live.ckpt.ckpt_discard = std::mem::replace(
            &mut live.ckpt.discard,
            ExtentList::new("live.discard", false),
        );

        // The first surviving checkpoint can have nothing to discard:
        // there is no older checkpoint left to reference its blocks.
        if let Some(first) = ckpts.iter().find(|e| !e.delete && !e.fake) {
            let empty = match &first.state {
                Some(state) => state.discard.is_empty(),
                None => true,
            };
            if !empty {
                return Err(Error::Panic(format!(
                    "{}: first checkpoint {} incorrectly has blocks on its discard list",
                    self.name(),
                    first.name
                )));
            }
        }

        live.ckpt_inprogress = true;
        Ok(())
    }

    /// Read extent lists for every checkpoint being deleted, plus the
    /// survivor each one rolls into.
    fn ckpt_load_deletes(&self, ckpts: &mut [CkptEntry]) -> Result<bool> {
        let mut deleting = false;
        for i in 0..ckpts.len() {
            if ckpts[i].fake || !ckpts[i].delete {
                continue;
            }
            deleting = true;

            if ckpts[i].state.is_none() {
                ckpts[i].state = Some(self.ckpt_read_state(&ckpts[i])?);
            }
            let next = next_real(ckpts, i);
            if ckpts[next].state.is_none() && !ckpts[next].add {
                ckpts[next].state = Some(self.ckpt_read_state(&ckpts[next])?);
            }
        }
        Ok(deleting)
    }

    /// Crack a checkpoint cookie and read its alloc and discard lists.
    ///
    /// The avail list is not read: it only describes what could be
    /// allocated when rolling forward from this exact checkpoint, which
    /// later checkpoints have invalidated. Its address is kept so the
    /// block holding it can be freed.
    fn ckpt_read_state(&self, entry: &CkptEntry) -> Result<Box<BlockCkpt>> {
        let ci = CheckpointCookie::from_bytes(&entry.cookie, self.allocsize())?;
        let mut state = Box::new(BlockCkpt::new(&entry.name));
        state.root = ci.root;
        state.file_size = ci.file_size;
        state.ckpt_size = ci.ckpt_size;
        state.alloc =
            self.read_extlist(&format!("{}.alloc", entry.name), false, ci.alloc, ci.file_size)?;
        state.discard = self.read_extlist(
            &format!("{}.discard", entry.name),
            false,
            ci.discard,
            ci.file_size,
        )?;
        state.avail = ExtentList::new(format!("{}.avail", entry.name), true);
        state.avail.set_addr(ci.avail);
        Ok(state)
    }

    /// Roll deleted checkpoints into their successors.
    fn ckpt_delete(&self, live: &mut LiveState, ckpts: &mut [CkptEntry]) -> Result<()> {
        for i in 0..ckpts.len() {
            if ckpts[i].fake || !ckpts[i].delete {
                continue;
            }
            tracing::debug!(
                target: "shale::block",
                file = %self.name(), ckpt = %ckpts[i].name,
                "delete checkpoint"
            );

            let mut a = ckpts[i].state.take().expect("delete state was loaded");
            let next = next_real(ckpts, i);

            // The root page was allocated under normal rules and so
            // appears on this checkpoint's alloc list; free it into the
            // checkpoint's own discard list to keep the pairing.
            if let Some(root) = a.root.take() {
                a.discard.insert(root.off, root.size as u64)?;
            }

            // The blocks holding this checkpoint's extent lists were
            // never on any alloc list; they're reclaimable the moment
            // the new cookies are durable.
            ckpt_fblocks(live, a.alloc.addr())?;
            ckpt_fblocks(live, a.avail.addr())?;
            ckpt_fblocks(live, a.discard.addr())?;

            // Roll the dying checkpoint's alloc and discard ranges into
            // the successor. The extent lists may aggregate over several
            // deleted checkpoints; they stay disjoint throughout.
            if ckpts[next].add {
                let ckpt = &mut live.ckpt;
                a.alloc.merge_into(&mut ckpt.alloc)?;
                a.discard.merge_into(&mut ckpt.discard)?;
                reclaim_overlaps(&mut ckpt.alloc, &mut ckpt.discard, &mut ckpt.ckpt_avail)?;
                continue;
            }

            let b = ckpts[next].state.as_mut().expect("successor state was loaded");
            a.alloc.merge_into(&mut b.alloc)?;
            a.discard.merge_into(&mut b.discard)?;

            // A successor that is itself being deleted rolls forward in
            // a later iteration.
            if ckpts[next].delete {
                continue;
            }

            // Blocks both allocated and discarded across the merged
            // span cancel out; reclaim them for the live system.
            reclaim_overlaps(&mut b.alloc, &mut b.discard, &mut live.ckpt.ckpt_avail)?;

            // The survivor's lists changed: its old list blocks are
            // dead (the avail list is untouched and keeps its block)
            // and new ones must be written.
            ckpt_fblocks(live, b.alloc.addr())?;
            ckpt_fblocks(live, b.discard.addr())?;
            ckpts[next].update = true;
        }
        Ok(())
    }

    /// Rewrite a surviving checkpoint's extent lists and cookie.
    fn ckpt_update(&self, live: &mut LiveState, state: &mut BlockCkpt) -> Result<Vec<u8>> {
        ExtentList::check_disjoint(&state.alloc, &state.discard)?;

        let bytes = state.alloc.to_bytes();
        let addr = self.write_extlist_block(live, &bytes, state.alloc.entries())?;
        state.alloc.set_addr(addr);

        let bytes = state.discard.to_bytes();
        let addr = self.write_extlist_block(live, &bytes, state.discard.entries())?;
        state.discard.set_addr(addr);

        // The file size is deliberately not refreshed for re-written
        // checkpoints: it bounds verification of the checkpoint's
        // blocks, and advancing it could legitimize blocks past the
        // original checkpoint's end.
        Ok(CheckpointCookie {
            version: CHECKPOINT_VERSION,
            root: state.root,
            alloc: state.alloc.addr(),
            avail: state.avail.addr(),
            discard: state.discard.addr(),
            file_size: state.file_size,
            ckpt_size: state.ckpt_size,
        }
        .to_bytes(self.allocsize()))
    }

    /// Write the live system's extent lists and build the added
    /// checkpoint's cookie.
    fn ckpt_update_live(&self, live: &mut LiveState) -> Result<Vec<u8>> {
        ExtentList::check_disjoint(&live.ckpt.alloc, &live.ckpt.avail)?;
        ExtentList::check_disjoint(&live.ckpt.discard, &live.ckpt.avail)?;
        ExtentList::check_disjoint(&live.ckpt.alloc, &live.ckpt.discard)?;

        // Write the alloc and discard lists; each write allocates a
        // block and prunes it back out of the alloc list.
        let bytes = live.ckpt.alloc.to_bytes();
        let addr = self.write_extlist_block(live, &bytes, live.ckpt.alloc.entries())?;
        live.ckpt.alloc.set_addr(addr);

        let bytes = live.ckpt.discard.to_bytes();
        let addr = self.write_extlist_block(live, &bytes, live.ckpt.discard.entries())?;
        live.ckpt.discard.set_addr(addr);

        // The avail list goes last so it reflects the blocks just taken
        // for the other lists, and it is written as two lists in one:
        // the real avail ranges plus the checkpoint-avail ranges that
        // become allocatable at resolve.
        let (bytes, entries) = live.ckpt.avail.to_bytes_merged(&live.ckpt.ckpt_avail);
        let addr = self.write_extlist_block(live, &bytes, entries)?;
        live.ckpt.avail.set_addr(addr);

        live.ckpt.file_size = live.file_size;

        let cookie = CheckpointCookie {
            version: CHECKPOINT_VERSION,
            root: live.ckpt.root,
            alloc: live.ckpt.alloc.addr(),
            avail: live.ckpt.avail.addr(),
            discard: live.ckpt.discard.addr(),
            file_size: live.ckpt.file_size,
            ckpt_size: live.ckpt.ckpt_size,
        };
        tracing::debug!(
            target: "shale::block",
            file = %self.name(), file_size = cookie.file_size, ckpt_size = cookie.ckpt_size,
            "create checkpoint"
        );
        Ok(cookie.to_bytes(self.allocsize()))
    }

    /// Resolve a checkpoint (phase two): the caller has durably saved
    /// the cookies, so blocks freed during processing become
    /// allocatable.
    pub fn checkpoint_resolve(&self) -> Result<()> {
        let mut live = self.live();
        if !live.ckpt_inprogress {
            return Err(Error::InvalidArgument(format!(
                "{}: checkpoint resolved, but no checkpoint in progress",
                self.name()
            )));
        }
        live.ckpt_inprogress = false;

        let LiveState { ckpt, .. } = &mut *live;
        ckpt.ckpt_avail
            .merge_into(&mut ckpt.avail)
            .map_err(|e| self.escalate(e))?;

        // Drop the lists parked at checkpoint time.
        ckpt.ckpt_avail.clear();
        ckpt.ckpt_alloc.clear();
        ckpt.ckpt_discard.clear();
        Ok(())
    }
}

/// Free the block holding a dying checkpoint's serialized extent list
/// into the live checkpoint-avail list. Not the real avail list: the
/// avail list decides file truncation, and no part of the file holding
/// a previous checkpoint's extents can be truncated yet.
fn ckpt_fblocks(live: &mut LiveState, addr: Option<Addr>) -> Result<()> {
    if let Some(addr) = addr {
        live.ckpt.ckpt_avail.insert(addr.off, addr.size as u64)?;
    }
    Ok(())
}

/// Fast check that the checkpoint array is what processing expects:
/// checkpoints to keep, delete or ignore, terminated by the added one.
fn verify_ckpt_array(ckpts: &[CkptEntry]) -> Result<()> {
    for (i, entry) in ckpts.iter().enumerate() {
        if entry.add {
            if entry.delete || entry.fake || i != ckpts.len() - 1 {
                return Err(Error::Panic(format!(
                    "checkpoint array: add entry {} is malformed",
                    entry.name
                )));
            }
        }
    }
    if !ckpts.iter().any(|e| e.add) {
        return Err(Error::Panic("checkpoint array has no add entry".to_string()));
    }
    Ok(())
}

/// Index of the next non-fake entry after `i`; processing guarantees
/// one exists (the add entry terminates the array).
fn next_real(ckpts: &[CkptEntry], i: usize) -> usize {
    (i + 1..ckpts.len())
        .find(|&j| !ckpts[j].fake)
        .expect("checkpoint array terminated by the add entry")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmt::{PageHeader, PageType, BLOCK_DATA_OFFSET};
    use shale_core::{BlockConfig, PanicLatch};
    use tempfile::tempdir;

    fn page_buf(payload: &[u8]) -> Vec<u8> {
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

    fn new_manager(dir: &std::path::Path, name: &str) -> BlockManager {
        let path = dir.join(name);
        let cfg = BlockConfig::new().with_allocation_size(512);
        BlockManager::create(&path, &cfg).unwrap();
        let bm = BlockManager::open(&path, cfg, PanicLatch::new()).unwrap();
        bm.checkpoint_load(None, false).unwrap();
        bm
    }

    /// Take a checkpoint of `bm` with the given root payload, no
    /// deletes, returning the new cookie.
    fn take_checkpoint(bm: &BlockManager, root: &[u8], deletes: Vec<CkptEntry>) -> Vec<u8> {
        let mut ckpts = deletes;
        ckpts.push(CkptEntry::add("new"));
        let mut root_buf = page_buf(root);
        bm.checkpoint(Some(&mut root_buf), true, &mut ckpts).unwrap();
        bm.checkpoint_resolve().unwrap();
        ckpts.pop().unwrap().cookie
    }

    #[test]
    fn test_checkpoint_cookie_loads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ckpt.shale");
        let cfg = BlockConfig::new().with_allocation_size(512);
        BlockManager::create(&path, &cfg).unwrap();

        let cookie = {
            let bm = BlockManager::open(&path, cfg.clone(), PanicLatch::new()).unwrap();
            bm.checkpoint_load(None, false).unwrap();
            bm.write(&mut page_buf(b"data"), true).unwrap();
            let cookie = take_checkpoint(&bm, b"root page", Vec::new());
            bm.checkpoint_unload().unwrap();
            cookie
        };

        // Reopen from the cookie: the root page must come back.
        let bm = BlockManager::open(&path, cfg, PanicLatch::new()).unwrap();
        let root = bm.checkpoint_load(Some(&cookie), false).unwrap().unwrap();
        let block = bm.read(&root).unwrap();
        assert_eq!(&block[BLOCK_DATA_OFFSET..BLOCK_DATA_OFFSET + 9], b"root page");
    }

    #[test]
    fn test_readonly_checkpoint_load_returns_root() {
        let dir = tempdir().unwrap();
        let bm = new_manager(dir.path(), "ro.shale");
        let cookie = take_checkpoint(&bm, b"root", Vec::new());

        let root = bm.checkpoint_load(Some(&cookie), true).unwrap();
        assert!(root.is_some());
    }

    #[test]
    fn test_empty_checkpoint_has_no_root() {
        let dir = tempdir().unwrap();
        let bm = new_manager(dir.path(), "empty.shale");

        let mut ckpts = vec![CkptEntry::add("empty")];
        bm.checkpoint(None, true, &mut ckpts).unwrap();
        bm.checkpoint_resolve().unwrap();

        let ci = CheckpointCookie::from_bytes(&ckpts[0].cookie, 512).unwrap();
        assert_eq!(ci.root, None);
    }

    #[test]
    fn test_resolve_without_checkpoint_fails() {
        let dir = tempdir().unwrap();
        let bm = new_manager(dir.path(), "resolve.shale");
        assert!(matches!(
            bm.checkpoint_resolve(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_process_resolve_is_noop_without_writes() {
        let dir = tempdir().unwrap();
        let bm = new_manager(dir.path(), "noop.shale");
        bm.write(&mut page_buf(b"seed"), true).unwrap();
        let _first = take_checkpoint(&bm, b"r1", Vec::new());

        let avail_before = {
            let live = bm.live();
            live.ckpt.avail.bytes()
        };

        // A checkpoint with no intervening writes must not shrink the
        // available space.
        let _second = take_checkpoint(&bm, b"r2", Vec::new());
        let avail_after = {
            let live = bm.live();
            live.ckpt.avail.bytes()
        };
        assert!(avail_after >= avail_before);
    }

    #[test]
    fn test_delete_checkpoint_reclaims_blocks() {
        let dir = tempdir().unwrap();
        let bm = new_manager(dir.path(), "delete.shale");

        // First checkpoint with some data.
        let a1 = bm.write(&mut page_buf(b"first data"), true).unwrap();
        let c1 = take_checkpoint(&bm, b"root1", Vec::new());

        // Free the first checkpoint's data and write new data.
        bm.free(&a1).unwrap();
        bm.write(&mut page_buf(b"second data"), true).unwrap();

        let size_before = bm.file_size();

        // Second checkpoint deletes the first: its blocks roll forward
        // and the freed data block becomes available again.
        let _c2 = take_checkpoint(&bm, b"root2", vec![CkptEntry::delete("old", c1)]);

        let live = bm.live();
        assert!(
            live.ckpt.avail.bytes() > 0,
            "deleting a checkpoint must reclaim space"
        );
        assert!(live.file_size <= size_before);
        drop(live);

        // Reclaimed space is allocatable.
        let addr = bm.write(&mut page_buf(b"reuse"), true).unwrap();
        assert!(addr.off < size_before);
    }

    #[test]
    fn test_double_checkpoint_self_resolves() {
        let dir = tempdir().unwrap();
        let bm = new_manager(dir.path(), "double.shale");

        let mut ckpts = vec![CkptEntry::add("one")];
        bm.checkpoint(Some(&mut page_buf(b"r")), true, &mut ckpts).unwrap();

        // No resolve: the next checkpoint logs an error, resolves the
        // first itself and proceeds.
        let mut ckpts = vec![CkptEntry::add("two")];
        bm.checkpoint(Some(&mut page_buf(b"r2")), true, &mut ckpts)
            .unwrap();
        bm.checkpoint_resolve().unwrap();
    }

    #[test]
    fn test_ckpt_avail_not_allocatable_until_resolve() {
        let dir = tempdir().unwrap();
        let bm = new_manager(dir.path(), "fence.shale");

        let a = bm.write(&mut page_buf(b"data"), true).unwrap();
        let c1 = take_checkpoint(&bm, b"r1", Vec::new());
        bm.free(&a).unwrap();

        let mut ckpts = vec![CkptEntry::delete("old", c1), CkptEntry::add("new")];
        bm.checkpoint(Some(&mut page_buf(b"r2")), true, &mut ckpts)
            .unwrap();

        // Between phases, ckpt_avail holds reclaimed ranges and the
        // avail list must not include them.
        {
            let live = bm.live();
            assert!(live.ckpt.ckpt_avail.bytes() > 0);
            ExtentList::check_disjoint(&live.ckpt.avail, &live.ckpt.ckpt_avail).unwrap();
        }

        bm.checkpoint_resolve().unwrap();
        {
            let live = bm.live();
            assert_eq!(live.ckpt.ckpt_avail.bytes(), 0);
        }
    }

    #[test]
    fn test_malformed_ckpt_array_rejected() {
        let dir = tempdir().unwrap();
        let bm = new_manager(dir.path(), "bad.shale");

        // No add entry.
        let mut ckpts = vec![CkptEntry::keep("only", Vec::new())];
        assert!(bm.checkpoint(None, true, &mut ckpts).is_err());

        // Add entry not last.
        let mut ckpts = vec![CkptEntry::add("a"), CkptEntry::keep("b", Vec::new())];
        assert!(bm.checkpoint(None, true, &mut ckpts).is_err());
    }

    #[test]
    fn test_live_double_open_is_fatal() {
        let dir = tempdir().unwrap();
        let bm = new_manager(dir.path(), "twice.shale");
        assert!(matches!(
            bm.checkpoint_load(None, false),
            Err(Error::Panic(_))
        ));
    }
}
