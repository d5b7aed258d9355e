//! Shale: an embedded ordered key-value storage engine core.
//!
//! The engine decomposes into one crate per concern, re-exported here:
//!
//! - [`shale_core`]: errors, varint packing, scratch buffers, config
//! - [`shale_block`]: extent lists, block I/O, two-phase checkpoints,
//!   compaction, salvage
//! - [`shale_txn`]: transaction ids, snapshots, visibility, commit and
//!   rollback, named snapshots
//! - [`shale_wal`]: log records, append/sync, scan and recovery
//! - [`shale_lsm`]: chunks, Bloom filters, the merge cursor, workers
//! - [`shale_async`]: the async op ring and worker pool
//!
//! The [`Engine`] type wires the pieces together for embedders and
//! integration tests: one directory, one WAL, one transaction space,
//! any number of LSM trees.

pub use shale_async::{AsyncCallback, AsyncOp, AsyncOpHandle, AsyncSink, AsyncSystem};
pub use shale_block::{Addr, BlockManager, CheckpointCookie, CkptEntry, ExtentList};
pub use shale_core::{
    AllocPolicy, AsyncConfig, BlockConfig, CheckpointConfig, Error, Isolation, LsmConfig,
    PanicLatch, Result,
};
pub use shale_lsm::{LsmCursor, LsmManager, LsmTree, LsmWorkType};
pub use shale_txn::{DropSpec, NamedSnapshots, TxnGlobal, TxnSession, TXN_NONE};
pub use shale_wal::{
    LogRecord, Lsn, RecoveryHandler, RecoveryStats, SyncLevel, TxnOp, WalConfig, WalScanner,
    WalWriter,
};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Engine-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Maximum concurrent sessions
    pub session_max: usize,
    /// Write-ahead logging; `None` disables the log
    pub wal: Option<WalConfig>,
    /// LSM background worker threads
    pub lsm_workers: usize,
}

impl EngineConfig {
    /// A small configuration for embedding and tests.
    pub fn new() -> Self {
        EngineConfig {
            session_max: 32,
            wal: Some(WalConfig::new()),
            lsm_workers: 2,
        }
    }
}

/// One open engine: a home directory, a transaction space, a log and
/// a set of LSM trees.
pub struct Engine {
    home: PathBuf,
    latch: PanicLatch,
    txn_global: Arc<TxnGlobal>,
    nsnap: NamedSnapshots,
    wal: Option<WalWriter>,
    lsm_manager: Arc<LsmManager>,
    trees: Mutex<HashMap<u32, Arc<LsmTree>>>,
}

impl Engine {
    /// Open (creating if needed) an engine rooted at `home`.
    pub fn open(home: impl AsRef<Path>, cfg: EngineConfig) -> Result<Arc<Engine>> {
        let home = home.as_ref().to_path_buf();
        std::fs::create_dir_all(&home)?;

        let txn_global = Arc::new(TxnGlobal::new(cfg.session_max.max(1)));
        let wal = match &cfg.wal {
            Some(wal_cfg) => Some(WalWriter::open(home.join("wal"), wal_cfg.clone())?),
            None => None,
        };

        Ok(Arc::new(Engine {
            home,
            latch: PanicLatch::new(),
            nsnap: NamedSnapshots::new(Arc::clone(&txn_global)),
            txn_global,
            wal,
            lsm_manager: LsmManager::start(cfg.lsm_workers.max(1)),
            trees: Mutex::new(HashMap::new()),
        }))
    }

    /// The engine's home directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// The shared transaction state.
    pub fn txn_global(&self) -> &Arc<TxnGlobal> {
        &self.txn_global
    }

    /// The named snapshot registry.
    pub fn named_snapshots(&self) -> &NamedSnapshots {
        &self.nsnap
    }

    /// The write-ahead log, if logging is enabled.
    pub fn wal(&self) -> Option<&WalWriter> {
        self.wal.as_ref()
    }

    /// The LSM worker pool.
    pub fn lsm_manager(&self) -> &Arc<LsmManager> {
        &self.lsm_manager
    }

    /// The connection poison latch.
    pub fn latch(&self) -> &PanicLatch {
        &self.latch
    }

    /// Open a session.
    pub fn open_session(&self) -> Result<TxnSession> {
        self.latch.check()?;
        TxnSession::new(Arc::clone(&self.txn_global))
    }

    /// Create an LSM tree backed by a new file, registered under
    /// `fileid` for logging and recovery.
    pub fn create_tree(&self, name: &str, fileid: u32, cfg: LsmConfig) -> Result<Arc<LsmTree>> {
        self.latch.check()?;
        let path = self.home.join(format!("{name}.shale"));
        let block_cfg = BlockConfig::new();
        if !path.exists() {
            BlockManager::create(&path, &block_cfg)?;
        }
        let bm = BlockManager::open(&path, block_cfg, self.latch.clone())?;
        bm.checkpoint_load(None, false)?;

        let tree = LsmTree::new(name, cfg, Arc::new(bm), Arc::clone(&self.txn_global))?;
        let mut trees = self.trees.lock();
        if trees.contains_key(&fileid) {
            return Err(Error::InvalidArgument(format!(
                "file id {fileid} already registered"
            )));
        }
        trees.insert(fileid, Arc::clone(&tree));
        Ok(tree)
    }

    /// The tree registered under `fileid`.
    pub fn tree(&self, fileid: u32) -> Option<Arc<LsmTree>> {
        self.trees.lock().get(&fileid).cloned()
    }

    /// Open a cursor on the tree registered under `fileid`.
    pub fn open_cursor(&self, fileid: u32, overwrite: bool) -> Result<LsmCursor> {
        self.latch.check()?;
        let tree = self
            .tree(fileid)
            .ok_or_else(|| Error::InvalidArgument(format!("no tree with file id {fileid}")))?;
        Ok(LsmCursor::new(
            tree,
            Some(Arc::clone(&self.lsm_manager)),
            fileid,
            overwrite,
        ))
    }

    /// Replay the log into the registered trees.
    ///
    /// Call after every tree has been created; recovered transaction
    /// ids seed the id counter so new transactions never collide with
    /// logged ones.
    pub fn recover(&self) -> Result<RecoveryStats> {
        let mut handler = EngineRecovery { engine: self };
        let stats = shale_wal::recover(self.home.join("wal"), &mut handler)?;
        self.txn_global.set_recovered_id(stats.max_txnid);
        Ok(stats)
    }

    /// Build an [`AsyncSink`] applying operations to one tree with
    /// autocommit transactions.
    pub fn async_sink(self: &Arc<Self>, fileid: u32) -> Result<Arc<dyn AsyncSink>> {
        self.tree(fileid)
            .ok_or_else(|| Error::InvalidArgument(format!("no tree with file id {fileid}")))?;
        Ok(Arc::new(EngineSink {
            engine: Arc::clone(self),
            fileid,
        }))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.nsnap.destroy();
        self.lsm_manager.shutdown();
        if let Some(wal) = &self.wal {
            let _ = wal.flush();
        }
    }
}

/// Applies recovered operations into the engine's trees.
struct EngineRecovery<'a> {
    engine: &'a Engine,
}

impl RecoveryHandler for EngineRecovery<'_> {
    fn apply(&mut self, _txnid: u64, op: &TxnOp) -> Result<()> {
        let Some(tree) = self.engine.tree(op.fileid()) else {
            // Files can be dropped after their last log record; their
            // operations have nowhere to go.
            tracing::warn!(
                target: "shale::engine",
                fileid = op.fileid(),
                "recovered operation for an unregistered file"
            );
            return Ok(());
        };
        let primary = tree
            .primary()
            .ok_or_else(|| Error::Panic("tree without a primary chunk".to_string()))?;
        let committed = shale_txn::UpdateCell::new(TXN_NONE);
        match op {
            TxnOp::RowPut { key, value, .. } => {
                primary.insert(key, value, committed, false, &|_| true)
            }
            TxnOp::RowRemove { key, .. } => primary.insert(
                key,
                shale_lsm::TOMBSTONE,
                committed,
                false,
                &|_| true,
            ),
            // Column stores ride on the same chunks in this engine;
            // record numbers pack as big-endian keys elsewhere, and a
            // truncate expands to individual removes before logging.
            other => Err(Error::Unsupported(format!(
                "recovery of operation {other:?}"
            ))),
        }
    }
}

/// Applies async operations to one tree with autocommit transactions.
struct EngineSink {
    engine: Arc<Engine>,
    fileid: u32,
}

impl EngineSink {
    fn with_cursor<T>(
        &self,
        update: impl FnOnce(&mut LsmCursor, &mut TxnSession) -> Result<T>,
    ) -> Result<T> {
        let mut session = self.engine.open_session()?;
        let mut cursor = self.engine.open_cursor(self.fileid, true)?;
        session.begin(Isolation::Snapshot, SyncLevel::Background)?;
        match update(&mut cursor, &mut session) {
            Ok(out) => {
                session.commit(self.engine.wal())?;
                Ok(out)
            }
            Err(e) => {
                session.rollback();
                Err(e)
            }
        }
    }
}

impl AsyncSink for EngineSink {
    fn search(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_cursor(|cursor, session| cursor.search(session, key))
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_cursor(|cursor, session| cursor.insert(session, key, value))
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_cursor(|cursor, session| cursor.update(session, key, value))
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.with_cursor(|cursor, session| cursor.remove(session, key))
    }

    fn compact(&self) -> Result<()> {
        let tree = self
            .engine
            .tree(self.fileid)
            .ok_or_else(|| Error::InvalidArgument("tree dropped".to_string()))?;
        self.engine
            .lsm_manager()
            .push_entry(LsmWorkType::Merge, &tree);
        Ok(())
    }
}
