//! The LSM worker pool.
//!
//! Cursors never switch or merge trees themselves; they push work
//! entries and keep going. A small pool of native threads drains the
//! queue: a switch seals the primary, then tries to flush; a flush
//! writes sealed chunks out, then queues a merge when enough on-disk
//! chunks have piled up; a merge folds the on-disk run into one chunk.

use crate::tree::LsmTree;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Kinds of background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LsmWorkType {
    /// Seal the primary chunk and start a new one
    Switch,
    /// Write sealed chunks to disk
    Flush,
    /// Fold the on-disk run into one chunk
    Merge,
}

struct WorkQueue {
    entries: Mutex<VecDeque<(LsmWorkType, Arc<LsmTree>)>>,
    cond: Condvar,
    shutdown: Mutex<bool>,
}

/// The worker pool.
pub struct LsmManager {
    queue: Arc<WorkQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LsmManager {
    /// Start `nworkers` worker threads.
    pub fn start(nworkers: usize) -> Arc<Self> {
        let queue = Arc::new(WorkQueue {
            entries: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: Mutex::new(false),
        });

        let manager = Arc::new(LsmManager {
            queue: Arc::clone(&queue),
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = manager.workers.lock();
        for i in 0..nworkers {
            let queue = Arc::clone(&queue);
            let handle = std::thread::Builder::new()
                .name(format!("shale-lsm-worker-{i}"))
                .spawn(move || worker_loop(&queue))
                .expect("spawn lsm worker");
            workers.push(handle);
        }
        drop(workers);
        manager
    }

    /// Queue a work entry.
    pub fn push_entry(&self, work: LsmWorkType, tree: &Arc<LsmTree>) {
        let mut entries = self.queue.entries.lock();
        // Coalesce duplicates: one pending switch per tree is plenty.
        if entries
            .iter()
            .any(|(w, t)| *w == work && Arc::ptr_eq(t, tree))
        {
            return;
        }
        entries.push_back((work, Arc::clone(tree)));
        self.queue.cond.notify_one();
    }

    /// Wait until the queue is empty and workers are idle enough for
    /// tests to make assertions.
    pub fn drain(&self) {
        loop {
            {
                let entries = self.queue.entries.lock();
                if entries.is_empty() {
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stop the workers.
    pub fn shutdown(&self) {
        {
            let mut shutdown = self.queue.shutdown.lock();
            *shutdown = true;
        }
        self.queue.cond.notify_all();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for LsmManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(queue: &WorkQueue) {
    loop {
        let entry = {
            let mut entries = queue.entries.lock();
            loop {
                if let Some(entry) = entries.pop_front() {
                    break Some(entry);
                }
                if *queue.shutdown.lock() {
                    break None;
                }
                queue.cond.wait_for(&mut entries, Duration::from_millis(100));
            }
        };
        let Some((work, tree)) = entry else {
            return;
        };

        let result = match work {
            LsmWorkType::Switch => tree.switch().and_then(|()| {
                // A fresh sealed chunk usually flushes right away.
                tree.flush_chunks().map(drop)
            }),
            LsmWorkType::Flush => tree.flush_chunks().and_then(|flushed| {
                let (chunks, _) = tree.chunks();
                let ondisk = chunks.iter().take_while(|c| c.on_disk()).count();
                if flushed > 0 && ondisk >= 2 {
                    tree.merge().map(drop)
                } else {
                    Ok(())
                }
            }),
            LsmWorkType::Merge => tree.merge().map(drop),
        };

        if let Err(e) = result {
            tracing::error!(
                target: "shale::lsm",
                tree = %tree.name(), ?work, error = %e,
                "background work failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shale_block::BlockManager;
    use shale_core::{BlockConfig, LsmConfig, PanicLatch};
    use shale_txn::{TxnGlobal, UpdateCell, TXN_NONE};
    use tempfile::tempdir;

    fn test_tree(dir: &std::path::Path) -> (Arc<LsmTree>, Arc<TxnGlobal>) {
        let path = dir.join("worker.shale");
        let cfg = BlockConfig::new().with_allocation_size(512);
        BlockManager::create(&path, &cfg).unwrap();
        let bm = BlockManager::open(&path, cfg, PanicLatch::new()).unwrap();
        bm.checkpoint_load(None, false).unwrap();

        let global = Arc::new(TxnGlobal::new(8));
        let tree = LsmTree::new(
            "worker",
            LsmConfig::new().with_chunk_size(1024),
            Arc::new(bm),
            Arc::clone(&global),
        )
        .unwrap();
        (tree, global)
    }

    #[test]
    fn test_switch_work_executes() {
        let dir = tempdir().unwrap();
        let (tree, _) = test_tree(dir.path());
        let manager = LsmManager::start(2);

        tree.primary()
            .unwrap()
            .insert(b"k", b"v", UpdateCell::new(TXN_NONE), false, &|_| true)
            .unwrap();

        let gen = tree.dsk_gen();
        tree.set_need_switch();
        manager.push_entry(LsmWorkType::Switch, &tree);

        for _ in 0..1000 {
            if tree.dsk_gen() > gen {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(tree.dsk_gen() > gen, "worker never switched");
        manager.shutdown();
    }

    #[test]
    fn test_duplicate_entries_coalesce() {
        let dir = tempdir().unwrap();
        let (tree, _) = test_tree(dir.path());
        // No workers: queue contents stay put for inspection.
        let manager = LsmManager::start(0);

        manager.push_entry(LsmWorkType::Switch, &tree);
        manager.push_entry(LsmWorkType::Switch, &tree);
        manager.push_entry(LsmWorkType::Flush, &tree);
        {
            let entries = manager.queue.entries.lock();
            assert_eq!(entries.len(), 2, "duplicate switch coalesced");
        }
        manager.shutdown();
    }

    #[test]
    fn test_shutdown_idempotent() {
        let manager = LsmManager::start(2);
        manager.shutdown();
        manager.shutdown();
    }
}
