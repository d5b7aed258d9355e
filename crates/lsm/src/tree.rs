//! The LSM tree: a stack of chunks plus switch and merge machinery.
//!
//! The chunk array is guarded by a reader/writer lock; cursors take
//! the read side just long enough to copy the array, and discover
//! changes through the `dsk_gen` generation counter. Background
//! workers do the heavy lifting: sealing the primary (switch), writing
//! sealed chunks out (flush) and folding runs of on-disk chunks into
//! one (merge).

use crate::chunk::{is_deleted, Chunk};
use parking_lot::RwLock;
use shale_block::BlockManager;
use shale_core::{LsmConfig, Result};
use shale_txn::TxnGlobal;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// One LSM tree.
pub struct LsmTree {
    name: String,
    cfg: LsmConfig,
    bm: Arc<BlockManager>,
    txn_global: Arc<TxnGlobal>,
    /// Oldest chunk first; the last entry is the primary
    chunks: RwLock<Vec<Arc<Chunk>>>,
    /// Bumped on every chunk-array change; cursors compare it to
    /// decide when to reopen
    dsk_gen: AtomicU64,
    next_chunk_id: AtomicU32,
    /// A switch has been requested and not yet performed
    need_switch: AtomicBool,
}

impl LsmTree {
    /// Create a tree with one empty primary chunk.
    pub fn new(
        name: impl Into<String>,
        cfg: LsmConfig,
        bm: Arc<BlockManager>,
        txn_global: Arc<TxnGlobal>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        let name = name.into();
        let primary = Chunk::new(1, &name);
        Ok(Arc::new(LsmTree {
            name,
            cfg,
            bm,
            txn_global,
            chunks: RwLock::new(vec![primary]),
            // Cursors start at generation zero so their first
            // operation opens chunk cursors.
            dsk_gen: AtomicU64::new(1),
            next_chunk_id: AtomicU32::new(2),
            need_switch: AtomicBool::new(false),
        }))
    }

    /// The tree's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tree's configuration.
    pub fn config(&self) -> &LsmConfig {
        &self.cfg
    }

    /// The file backing this tree's chunks.
    pub fn block_manager(&self) -> &Arc<BlockManager> {
        &self.bm
    }

    /// The connection's transaction state.
    pub fn txn_global(&self) -> &Arc<TxnGlobal> {
        &self.txn_global
    }

    /// Current chunk-array generation.
    pub fn dsk_gen(&self) -> u64 {
        self.dsk_gen.load(Ordering::Acquire)
    }

    /// Copy the chunk array along with the generation it belongs to.
    pub fn chunks(&self) -> (Vec<Arc<Chunk>>, u64) {
        let chunks = self.chunks.read();
        (chunks.clone(), self.dsk_gen())
    }

    /// The primary chunk.
    pub fn primary(&self) -> Option<Arc<Chunk>> {
        let chunks = self.chunks.read();
        chunks.last().filter(|c| c.is_primary()).cloned()
    }

    /// Whether a switch has been requested.
    pub fn need_switch(&self) -> bool {
        self.need_switch.load(Ordering::Acquire)
    }

    /// Request a switch; idempotent until the switch happens.
    pub fn set_need_switch(&self) {
        self.need_switch.store(true, Ordering::Release);
    }

    /// Seal the primary and install a fresh one.
    ///
    /// The old primary's switch id is a freshly allocated transaction
    /// id: transactions with earlier ids may still write to the sealed
    /// chunk, everything later lands in the new primary.
    pub fn switch(&self) -> Result<()> {
        let mut chunks = self.chunks.write();

        // A duplicate switch request can arrive after the switch it
        // asked for; don't pile up empty chunks.
        if let Some(primary) = chunks.last() {
            if primary.is_primary() && primary.count() == 0 && !chunks.is_empty() {
                self.need_switch.store(false, Ordering::Release);
                return Ok(());
            }
            if primary.is_primary() {
                let switch_txn = self.txn_global.new_id();
                primary.set_switch_txn(switch_txn);
                tracing::debug!(
                    target: "shale::lsm",
                    tree = %self.name, chunk = primary.id(), switch_txn,
                    "chunk sealed"
                );
            }
        }

        let id = self.next_chunk_id.fetch_add(1, Ordering::AcqRel);
        chunks.push(Chunk::new(id, &self.name));
        self.need_switch.store(false, Ordering::Release);
        self.dsk_gen.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(target: "shale::lsm", tree = %self.name, chunk = id, "new primary");
        Ok(())
    }

    /// Write out sealed chunks whose writers have all resolved.
    ///
    /// Returns how many chunks were flushed.
    pub fn flush_chunks(&self) -> Result<usize> {
        let (chunks, _) = self.chunks();
        let mut flushed = 0;
        for chunk in &chunks {
            if chunk.is_primary() || chunk.on_disk() {
                continue;
            }
            // A chunk still being written by an unresolved transaction
            // can't go out yet; the next flush pass will get it.
            if !self.txn_global.visible_all(chunk.switch_txn()) {
                continue;
            }
            chunk.flush(&self.bm, &self.cfg)?;
            flushed += 1;
        }
        if flushed > 0 {
            self.dsk_gen.fetch_add(1, Ordering::AcqRel);
        }
        Ok(flushed)
    }

    /// Fold the oldest run of on-disk chunks into one.
    ///
    /// Returns whether a merge happened. Tombstones are dropped only
    /// here, when the run starts at the oldest chunk: there is nothing
    /// older left for them to shadow.
    pub fn merge(&self) -> Result<bool> {
        // Collect the mergeable prefix under the read lock.
        let (all, gen_at_start) = self.chunks();
        let run: Vec<Arc<Chunk>> = all
            .iter()
            .take_while(|c| c.on_disk())
            .cloned()
            .collect();
        if run.len() < 2 {
            return Ok(false);
        }

        for chunk in &run {
            chunk.load(&self.bm)?;
        }

        // Newest chunk wins each key; the run starts at the tree's
        // oldest chunk, so nothing a tombstone shadows survives and
        // the tombstone itself can go.
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for chunk in &run {
            for (key, value) in chunk.live_entries() {
                merged.insert(key, value);
            }
        }
        merged.retain(|_, value| !is_deleted(value));

        let id = self.next_chunk_id.fetch_add(1, Ordering::AcqRel);
        let out = Chunk::new(id, &self.name);
        out.set_switch_txn(run.last().expect("run is non-empty").switch_txn());
        for (key, value) in &merged {
            out.insert(
                key,
                value,
                shale_txn::UpdateCell::new(shale_txn::TXN_NONE),
                false,
                &|_| true,
            )?;
        }
        out.flush(&self.bm, &self.cfg)?;

        {
            let mut chunks = self.chunks.write();
            // A racing switch is fine (it appends); a racing merge is
            // not expected, but verify the prefix is still ours before
            // splicing.
            if self.dsk_gen() != gen_at_start
                && (chunks.len() < run.len()
                    || !chunks
                        .iter()
                        .zip(run.iter())
                        .all(|(a, b)| Arc::ptr_eq(a, b)))
            {
                tracing::warn!(target: "shale::lsm", tree = %self.name, "merge raced, discarded");
                self.free_chunk_blocks(&out)?;
                return Ok(false);
            }
            chunks.splice(..run.len(), [out]);
            self.dsk_gen.fetch_add(1, Ordering::AcqRel);
        }

        // The merged chunks' blocks are dead.
        for chunk in &run {
            self.free_chunk_blocks(chunk)?;
        }
        tracing::debug!(
            target: "shale::lsm",
            tree = %self.name, merged = run.len(), keys = merged.len(),
            "merge complete"
        );
        Ok(true)
    }

    fn free_chunk_blocks(&self, chunk: &Chunk) -> Result<()> {
        if let Some(addr) = chunk.disk_addr() {
            self.bm.free(&addr)?;
        }
        if let Some(addr) = chunk.bloom_addr() {
            self.bm.free(&addr)?;
        }
        Ok(())
    }

    /// Whether the primary has outgrown `limit` bytes.
    pub fn primary_over(&self, limit: u64) -> bool {
        self.primary().is_some_and(|p| p.mem_size() > limit)
    }
}

impl std::fmt::Debug for LsmTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmTree")
            .field("name", &self.name)
            .field("dsk_gen", &self.dsk_gen())
            .field("nchunks", &self.chunks.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shale_core::{BlockConfig, PanicLatch};
    use shale_txn::UpdateCell;
    use tempfile::tempdir;

    fn vis_all(_: u64) -> bool {
        true
    }

    pub(crate) fn test_tree(dir: &std::path::Path, name: &str) -> (Arc<LsmTree>, Arc<TxnGlobal>) {
        let path = dir.join(format!("{name}.shale"));
        let cfg = BlockConfig::new().with_allocation_size(512);
        BlockManager::create(&path, &cfg).unwrap();
        let bm = BlockManager::open(&path, cfg, PanicLatch::new()).unwrap();
        bm.checkpoint_load(None, false).unwrap();

        let global = Arc::new(TxnGlobal::new(8));
        let tree = LsmTree::new(
            name,
            LsmConfig::new().with_chunk_size(1024),
            Arc::new(bm),
            Arc::clone(&global),
        )
        .unwrap();
        (tree, global)
    }

    fn put(tree: &LsmTree, key: &[u8], value: &[u8]) {
        let primary = tree.primary().unwrap();
        primary
            .insert(key, value, UpdateCell::new(shale_txn::TXN_NONE), false, &vis_all)
            .unwrap();
    }

    #[test]
    fn test_switch_seals_and_replaces() {
        let dir = tempdir().unwrap();
        let (tree, _) = test_tree(dir.path(), "switch");
        put(&tree, b"a", b"1");

        let gen = tree.dsk_gen();
        tree.switch().unwrap();
        assert!(tree.dsk_gen() > gen);

        let (chunks, _) = tree.chunks();
        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].is_primary());
        assert!(chunks[0].switch_txn() > 0);
        assert!(chunks[1].is_primary());
    }

    #[test]
    fn test_switch_skips_empty_primary() {
        let dir = tempdir().unwrap();
        let (tree, _) = test_tree(dir.path(), "empty-switch");
        tree.set_need_switch();
        tree.switch().unwrap();
        let (chunks, _) = tree.chunks();
        assert_eq!(chunks.len(), 1, "no chunk stack of empties");
        assert!(!tree.need_switch());
    }

    #[test]
    fn test_flush_waits_for_writers() {
        let dir = tempdir().unwrap();
        let (tree, global) = test_tree(dir.path(), "flush");
        put(&tree, b"a", b"1");
        tree.switch().unwrap();

        // The sealed chunk's switch id hasn't been passed by the
        // oldest-id watermark yet.
        assert_eq!(tree.flush_chunks().unwrap(), 0);

        global.update_oldest(true);
        assert_eq!(tree.flush_chunks().unwrap(), 1);
        let (chunks, _) = tree.chunks();
        assert!(chunks[0].on_disk());
    }

    #[test]
    fn test_merge_folds_and_drops_tombstones() {
        let dir = tempdir().unwrap();
        let (tree, global) = test_tree(dir.path(), "merge");

        put(&tree, b"x", b"1");
        tree.switch().unwrap();
        put(&tree, b"x", crate::chunk::TOMBSTONE);
        put(&tree, b"y", b"2");
        tree.switch().unwrap();

        global.update_oldest(true);
        assert_eq!(tree.flush_chunks().unwrap(), 2);
        assert!(tree.merge().unwrap());

        let (chunks, _) = tree.chunks();
        assert_eq!(chunks.len(), 2, "merged run plus primary");
        let merged = &chunks[0];
        merged.load(tree.block_manager()).unwrap();
        assert!(merged.search(b"x", &vis_all).is_none(), "tombstone dropped");
        assert_eq!(merged.search(b"y", &vis_all).unwrap(), b"2");
    }

    #[test]
    fn test_merge_needs_two_chunks() {
        let dir = tempdir().unwrap();
        let (tree, global) = test_tree(dir.path(), "short-merge");
        put(&tree, b"a", b"1");
        tree.switch().unwrap();
        global.update_oldest(true);
        tree.flush_chunks().unwrap();
        assert!(!tree.merge().unwrap());
    }
}
