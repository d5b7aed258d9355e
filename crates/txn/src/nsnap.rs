//! Named snapshots.
//!
//! A named snapshot is a saved `(snap_min, snap_max, ids)` view kept in
//! an insertion-ordered queue. Later transactions can open on a name
//! and read exactly what a transaction at creation time would have
//! read. The head of the queue pins the global oldest-id watermark
//! through `nsnap_oldest` so the updates those views need aren't
//! reclaimed.

use crate::global::{TxnGlobal, TXN_NONE};
use crate::snapshot::SnapshotData;
use crate::txn::TxnSession;
use parking_lot::RwLock;
use shale_core::{Error, Isolation, Result};
use std::collections::VecDeque;
use std::sync::Arc;

/// One saved snapshot.
#[derive(Debug, Clone)]
pub struct NamedSnapshot {
    /// The snapshot's name
    pub name: String,
    /// Saved view
    pub snapshot: SnapshotData,
}

/// Which snapshots a drop request removes.
#[derive(Debug, Clone, Default)]
pub struct DropSpec {
    /// Drop every named snapshot
    pub all: bool,
    /// Drop these names
    pub names: Vec<String>,
    /// Drop the queue prefix before this name (exclusive)
    pub before: Option<String>,
    /// Drop the queue prefix through this name (inclusive)
    pub to: Option<String>,
}

impl DropSpec {
    /// Validate the combination rules: `all` stands alone, and
    /// `before`/`to` are mutually exclusive.
    pub fn validate(&self) -> Result<()> {
        if self.before.is_some() && self.to.is_some() {
            return Err(Error::InvalidArgument(
                "named snapshot drop can't specify both before and to options".to_string(),
            ));
        }
        if self.all && (!self.names.is_empty() || self.before.is_some() || self.to.is_some()) {
            return Err(Error::InvalidArgument(
                "named snapshot drop can't specify all and any other options".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the spec drops anything at all.
    pub fn is_empty(&self) -> bool {
        !self.all && self.names.is_empty() && self.before.is_none() && self.to.is_none()
    }
}

/// The connection's named snapshot registry.
pub struct NamedSnapshots {
    global: Arc<TxnGlobal>,
    list: RwLock<VecDeque<NamedSnapshot>>,
}

impl NamedSnapshots {
    /// Create an empty registry.
    pub fn new(global: Arc<TxnGlobal>) -> Self {
        NamedSnapshots {
            global,
            list: RwLock::new(VecDeque::new()),
        }
    }

    /// Number of saved snapshots.
    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }

    /// Save the session's current view under `name`.
    ///
    /// A running transaction must be at snapshot isolation and must
    /// not have made updates; without one, a fresh view is taken on
    /// the spot. A snapshot with an existing name replaces it.
    pub fn create(&self, name: &str, session: &mut TxnSession) -> Result<()> {
        if name == "all" {
            return Err(Error::InvalidArgument(
                "can't create snapshot with reserved \"all\" name".to_string(),
            ));
        }
        if name.is_empty() {
            return Err(Error::InvalidArgument("empty snapshot name".to_string()));
        }

        let snapshot = if session.is_running() {
            if !matches!(
                session.isolation(),
                Isolation::Snapshot | Isolation::SnapshotNamed
            ) {
                return Err(Error::InvalidArgument(
                    "can't create a named snapshot from a running transaction that isn't \
                     snapshot isolation"
                        .to_string(),
                ));
            }
            if session.has_mods() {
                return Err(Error::InvalidArgument(
                    "can't create a named snapshot from a running transaction that has made \
                     updates"
                        .to_string(),
                ));
            }
            session.cursor_op();
            session.snapshot().expect("snapshot isolation has a view").clone()
        } else {
            self.global.build_snapshot(session.slot())
        };

        let mut list = self.list.write();
        // Same name replaces the old snapshot.
        Self::drop_one(&self.global, &mut list, name).ok();

        if list.is_empty() {
            self.global.set_nsnap_oldest(snapshot.snap_min);
        }
        tracing::debug!(
            target: "shale::txn",
            name, snap_min = snapshot.snap_min, snap_max = snapshot.snap_max,
            "named snapshot created"
        );
        list.push_back(NamedSnapshot {
            name: name.to_string(),
            snapshot,
        });

        if !session.is_running() {
            // The temporary view published a snap_min; clear it.
            self.global.state(session.slot()).clear();
        }
        Ok(())
    }

    /// Drop snapshots per `spec`.
    pub fn drop_snapshots(&self, spec: &DropSpec) -> Result<()> {
        spec.validate()?;
        let mut list = self.list.write();

        if spec.all {
            Self::drop_to(&self.global, &mut list, None, true)?;
        } else if let Some(name) = &spec.before {
            Self::drop_to(&self.global, &mut list, Some(name), false)?;
        } else if let Some(name) = &spec.to {
            Self::drop_to(&self.global, &mut list, Some(name), true)?;
        }

        for name in &spec.names {
            Self::drop_one(&self.global, &mut list, name).map_err(|_| {
                Error::InvalidArgument(format!("named snapshot {name:?} for drop not found"))
            })?;
        }
        Ok(())
    }

    /// Open the session's transaction on a named snapshot's view.
    pub fn open_on(&self, name: &str, session: &mut TxnSession) -> Result<()> {
        let list = self.list.read();
        let found = list
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| Error::InvalidArgument(format!("named snapshot {name:?} not found")))?;
        session.set_named_snapshot(found.snapshot.clone());
        Ok(())
    }

    /// Drop everything at connection close.
    pub fn destroy(&self) {
        self.global.set_nsnap_oldest(TXN_NONE);
        self.list.write().clear();
    }

    fn drop_one(
        global: &TxnGlobal,
        list: &mut VecDeque<NamedSnapshot>,
        name: &str,
    ) -> Result<()> {
        let pos = list
            .iter()
            .position(|n| n.name == name)
            .ok_or(Error::NotFound)?;

        // Removing the head republishes the pin.
        if pos == 0 {
            global.set_nsnap_oldest(
                list.get(1).map_or(TXN_NONE, |next| next.snapshot.snap_min),
            );
        }
        list.remove(pos);
        Ok(())
    }

    /// Drop a queue prefix: everything when `name` is `None`, else
    /// through (or up to, per `inclusive`) the named entry.
    fn drop_to(
        global: &TxnGlobal,
        list: &mut VecDeque<NamedSnapshot>,
        name: Option<&str>,
        inclusive: bool,
    ) -> Result<()> {
        if list.is_empty() {
            return match name {
                None => Ok(()),
                Some(name) => Err(Error::InvalidArgument(format!(
                    "named snapshot {name:?} for drop not found"
                ))),
            };
        }

        let last = match name {
            None => list.len() - 1,
            Some(name) => {
                let pos = list.iter().position(|n| n.name == name).ok_or_else(|| {
                    Error::InvalidArgument(format!("named snapshot {name:?} for drop not found"))
                })?;
                if !inclusive {
                    // Dropping before the head drops nothing.
                    if pos == 0 {
                        return Ok(());
                    }
                    pos - 1
                } else {
                    pos
                }
            }
        };

        let new_oldest = list
            .get(last + 1)
            .map_or(TXN_NONE, |next| next.snapshot.snap_min);
        list.drain(..=last);
        global.set_nsnap_oldest(new_oldest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shale_wal::SyncLevel;

    fn setup() -> (Arc<TxnGlobal>, NamedSnapshots) {
        let global = Arc::new(TxnGlobal::new(8));
        let nsnap = NamedSnapshots::new(Arc::clone(&global));
        (global, nsnap)
    }

    fn session(global: &Arc<TxnGlobal>) -> TxnSession {
        TxnSession::new(Arc::clone(global)).unwrap()
    }

    #[test]
    fn test_create_and_open_on() {
        let (global, nsnap) = setup();
        let mut writer = session(&global);
        let mut snapper = session(&global);

        // One in-flight writer at creation time.
        writer.begin(Isolation::Snapshot, SyncLevel::None).unwrap();
        let wid = writer.id_check().unwrap();

        nsnap.create("before-commit", &mut snapper).unwrap();
        writer.commit(None).unwrap();

        // A transaction opened on the name can't see the writer even
        // though it committed long ago.
        let mut reader = session(&global);
        reader.begin(Isolation::Snapshot, SyncLevel::None).unwrap();
        assert!(reader.visible(wid));
        nsnap.open_on("before-commit", &mut reader).unwrap();
        assert_eq!(reader.isolation(), Isolation::SnapshotNamed);
        assert!(!reader.visible(wid));
    }

    #[test]
    fn test_duplicate_name_replaces() {
        let (global, nsnap) = setup();
        let mut s = session(&global);
        nsnap.create("x", &mut s).unwrap();
        nsnap.create("x", &mut s).unwrap();
        assert_eq!(nsnap.len(), 1);
    }

    #[test]
    fn test_reserved_name_rejected() {
        let (global, nsnap) = setup();
        let mut s = session(&global);
        assert!(matches!(
            nsnap.create("all", &mut s),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_create_from_update_transaction_rejected() {
        let (global, nsnap) = setup();
        let mut s = session(&global);
        s.begin(Isolation::Snapshot, SyncLevel::None).unwrap();
        s.id_check().unwrap();
        s.log_op(
            shale_wal::TxnOp::RowRemove {
                fileid: 1,
                key: b"k".to_vec(),
            },
            None,
        )
        .unwrap();
        assert!(nsnap.create("bad", &mut s).is_err());
    }

    #[test]
    fn test_create_from_read_committed_rejected() {
        let (global, nsnap) = setup();
        let mut s = session(&global);
        s.begin(Isolation::ReadCommitted, SyncLevel::None).unwrap();
        assert!(nsnap.create("bad", &mut s).is_err());
    }

    #[test]
    fn test_drop_spec_validation() {
        assert!(DropSpec {
            all: true,
            names: vec!["a".to_string()],
            ..Default::default()
        }
        .validate()
        .is_err());

        assert!(DropSpec {
            before: Some("a".to_string()),
            to: Some("b".to_string()),
            ..Default::default()
        }
        .validate()
        .is_err());

        assert!(DropSpec {
            all: true,
            ..Default::default()
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_nsnap_oldest_tracks_head() {
        let (global, nsnap) = setup();
        let mut s = session(&global);
        let mut writer = session(&global);

        assert_eq!(global.nsnap_oldest(), TXN_NONE);

        writer.begin(Isolation::Snapshot, SyncLevel::None).unwrap();
        let id1 = writer.id_check().unwrap();
        nsnap.create("first", &mut s).unwrap();
        assert_eq!(global.nsnap_oldest(), id1);
        writer.commit(None).unwrap();

        nsnap.create("second", &mut s).unwrap();
        // Head unchanged.
        assert_eq!(global.nsnap_oldest(), id1);

        nsnap
            .drop_snapshots(&DropSpec {
                names: vec!["first".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(global.nsnap_oldest(), id1 + 1);

        nsnap
            .drop_snapshots(&DropSpec {
                all: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(global.nsnap_oldest(), TXN_NONE);
    }

    #[test]
    fn test_drop_before_and_to() {
        let (global, nsnap) = setup();
        let mut s = session(&global);
        for name in ["a", "b", "c", "d"] {
            nsnap.create(name, &mut s).unwrap();
        }

        // before=b drops only a.
        nsnap
            .drop_snapshots(&DropSpec {
                before: Some("b".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(nsnap.len(), 3);
        assert!(nsnap.open_on("a", &mut s).is_err());

        // to=c drops b and c.
        nsnap
            .drop_snapshots(&DropSpec {
                to: Some("c".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(nsnap.len(), 1);
        assert!(nsnap.open_on("d", &mut s).is_ok());
    }

    #[test]
    fn test_drop_missing_name_fails() {
        let (global, nsnap) = setup();
        let mut s = session(&global);
        nsnap.create("present", &mut s).unwrap();
        assert!(nsnap
            .drop_snapshots(&DropSpec {
                names: vec!["absent".to_string()],
                ..Default::default()
            })
            .is_err());

        // Dropping by prefix from an empty registry is only an error
        // when a name is given.
        nsnap.destroy();
        assert!(nsnap
            .drop_snapshots(&DropSpec {
                to: Some("x".to_string()),
                ..Default::default()
            })
            .is_err());
        assert!(nsnap
            .drop_snapshots(&DropSpec {
                all: true,
                ..Default::default()
            })
            .is_ok());
    }

    #[test]
    fn test_destroy_clears_pin() {
        let (global, nsnap) = setup();
        let mut s = session(&global);
        nsnap.create("x", &mut s).unwrap();
        nsnap.destroy();
        assert!(nsnap.is_empty());
        assert_eq!(global.nsnap_oldest(), TXN_NONE);
    }
}
