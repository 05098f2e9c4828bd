//! Object directory and allocator
//!
//! The directory owns every live object record: it assigns identities,
//! carves zone extents out of the backing drives, drives the lifecycle
//! transitions, and keeps the per-drive object tables durable across
//! them. Records are shared out to handles as `Arc<PmdLayout>`; the
//! directory holds one reference of its own for as long as the identity
//! is live.

use crate::omf::OtabEntry;
use crate::pd::PoolDrive;
use crate::zone::ZoneExtent;
use mpool_common::{Error, Find, MediaClass, ObjectId, ObjectKind, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error};

/// Lifecycle stage of an object record
///
/// `Uncommitted -> Committed` happens exactly once; `Retired` is the
/// terminal stage on the abort/delete path and means the identity is gone
/// from the directory and the zones are free.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Uncommitted,
    Committed,
    Retired,
}

/// Mutable state of an object record, guarded by the record's lock
#[derive(Debug)]
pub struct LayoutState {
    /// Bytes written so far; increases only while uncommitted
    pub mblen: u32,
    /// Lifecycle stage
    pub stage: Stage,
    /// Set while an abort or delete is draining; commit and the data
    /// paths observe it and fail busy
    pub aborting: bool,
}

/// One object's record: identity, placement, and lock-guarded state
#[derive(Debug)]
pub struct PmdLayout {
    objid: ObjectId,
    mclass: MediaClass,
    zone: ZoneExtent,
    capacity: u32,
    state: RwLock<LayoutState>,
}

impl PmdLayout {
    fn new(objid: ObjectId, mclass: MediaClass, zone: ZoneExtent, capacity: u32, mblen: u32, stage: Stage) -> Self {
        Self {
            objid,
            mclass,
            zone,
            capacity,
            state: RwLock::new(LayoutState {
                mblen,
                stage,
                aborting: false,
            }),
        }
    }

    /// Get the object identifier
    pub fn objid(&self) -> ObjectId {
        self.objid
    }

    /// Get the media class of the backing drive
    pub fn mclass(&self) -> MediaClass {
        self.mclass
    }

    /// Get the zone extent backing this object
    pub fn zone(&self) -> ZoneExtent {
        self.zone
    }

    /// Get the object's fixed capacity in bytes
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Acquire the record's shared lock
    pub fn read(&self) -> RwLockReadGuard<'_, LayoutState> {
        self.state.read()
    }

    /// Acquire the record's exclusive lock
    pub fn write(&self) -> RwLockWriteGuard<'_, LayoutState> {
        self.state.write()
    }

    fn otab_entry(&self, mblen: u32, committed: bool) -> OtabEntry {
        OtabEntry {
            objid: self.objid,
            zstart: self.zone.start,
            zcnt: self.zone.count,
            mblen,
            committed,
        }
    }
}

/// The pool's object directory
#[derive(Debug)]
pub struct Pmd {
    drives: Vec<Arc<PoolDrive>>,
    next_uniq: AtomicU64,
    objs: RwLock<HashMap<u64, Arc<PmdLayout>>>,
}

impl Pmd {
    /// Create an empty directory over the given drives
    pub fn new(drives: Vec<Arc<PoolDrive>>) -> Self {
        Self {
            drives,
            next_uniq: AtomicU64::new(1),
            objs: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild directory entries from one drive's object table
    pub fn adopt(&self, drive: &Arc<PoolDrive>, entries: &[OtabEntry]) -> Result<()> {
        let zone_size = u64::from(drive.attrs().zone_size);
        let mut objs = self.objs.write();

        for entry in entries {
            let capacity = u32::try_from(u64::from(entry.zcnt) * zone_size)
                .map_err(|_| Error::corrupt(format!("object {} capacity overflow", entry.objid)))?;
            if entry.mblen > capacity {
                return Err(Error::corrupt(format!(
                    "object {} write length {} past capacity {}",
                    entry.objid, entry.mblen, capacity
                )));
            }

            let stage = if entry.committed {
                Stage::Committed
            } else {
                Stage::Uncommitted
            };
            let layout = Arc::new(PmdLayout::new(
                entry.objid,
                drive.attrs().mclass,
                ZoneExtent::new(entry.zstart, entry.zcnt),
                capacity,
                entry.mblen,
                stage,
            ));

            if objs.insert(entry.objid.as_u64(), layout).is_some() {
                return Err(Error::corrupt(format!(
                    "object {} recorded on more than one drive",
                    entry.objid
                )));
            }

            let next = entry.objid.uniquifier() + 1;
            self.next_uniq.fetch_max(next, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Get the drive backing the given media class
    pub fn drive_for(&self, mclass: MediaClass) -> Option<&Arc<PoolDrive>> {
        self.drives.iter().find(|d| d.attrs().mclass == mclass)
    }

    /// Allocate a fresh object of unspecified identity
    pub fn obj_alloc(&self, kind: ObjectKind, mclass: MediaClass, spare: bool) -> Result<Arc<PmdLayout>> {
        let drive = self
            .drive_for(mclass)
            .ok_or_else(|| Error::invalid_argument(format!("no drive of media class {mclass}")))?;

        let zcnt = drive.attrs().mblock_zones;
        let extent = drive.zmap().allocate(zcnt, spare)?;
        let capacity = u32::try_from(u64::from(zcnt) * u64::from(drive.attrs().zone_size))
            .map_err(|_| Error::internal("object capacity overflow"))?;

        let uniq = self.next_uniq.fetch_add(1, Ordering::Relaxed);
        let objid = ObjectId::new(uniq, kind);
        let layout = Arc::new(PmdLayout::new(
            objid,
            mclass,
            extent,
            capacity,
            0,
            Stage::Uncommitted,
        ));

        self.objs.write().insert(objid.as_u64(), Arc::clone(&layout));

        if let Err(err) = drive.otab_upsert(layout.otab_entry(0, false)) {
            // Unwind; the identity was never visible on media
            self.objs.write().remove(&objid.as_u64());
            if let Err(ferr) = drive.zmap().free_extent(extent) {
                error!(objid = %objid, "leaked zones unwinding failed allocation: {ferr}");
            }
            return Err(err);
        }

        debug!(objid = %objid, zstart = extent.start, zcnt, "allocated object");
        Ok(layout)
    }

    /// Recover a live, uncommitted object by identity
    pub fn obj_realloc(&self, objid: ObjectId, mclass: MediaClass) -> Result<Arc<PmdLayout>> {
        let Some(layout) = self.objs.read().get(&objid.as_u64()).cloned() else {
            return Err(Error::NotFound(objid));
        };

        let state = layout.read();
        if state.aborting {
            return Err(Error::Busy(objid));
        }
        match state.stage {
            Stage::Retired => return Err(Error::NotFound(objid)),
            Stage::Committed => {
                return Err(Error::invalid_argument(format!(
                    "object {objid} is already committed"
                )));
            }
            Stage::Uncommitted => {}
        }
        drop(state);

        if layout.mclass() != mclass {
            return Err(Error::invalid_argument(format!(
                "object {objid} is not on media class {mclass}"
            )));
        }

        Ok(layout)
    }

    /// Look up an existing object and acquire a reference
    pub fn obj_find_get(&self, objid: ObjectId, which: Find) -> Result<Arc<PmdLayout>> {
        let Some(layout) = self.objs.read().get(&objid.as_u64()).cloned() else {
            return Err(Error::NotFound(objid));
        };

        let stage = layout.read().stage;
        let matched = match which {
            Find::Any => stage != Stage::Retired,
            Find::Committed => stage == Stage::Committed,
            Find::Uncommitted => stage == Stage::Uncommitted,
        };
        if !matched {
            return Err(Error::NotFound(objid));
        }

        Ok(layout)
    }

    /// Commit an object, making it permanently read-only
    ///
    /// The new record state reaches media before it becomes visible in
    /// memory; a failed table write leaves the object uncommitted.
    pub fn obj_commit(&self, layout: &Arc<PmdLayout>) -> Result<()> {
        let objid = layout.objid();
        let drive = self
            .drive_for(layout.mclass())
            .ok_or_else(|| Error::internal(format!("object {objid} has no backing drive")))?;

        let mut state = layout.write();
        if state.aborting {
            return Err(Error::Busy(objid));
        }
        match state.stage {
            Stage::Retired => return Err(Error::NotFound(objid)),
            Stage::Committed => return Err(Error::AlreadyCommitted(objid)),
            Stage::Uncommitted => {}
        }

        drive.otab_upsert(layout.otab_entry(state.mblen, true))?;
        state.stage = Stage::Committed;

        debug!(objid = %objid, mblen = state.mblen, "committed object");
        Ok(())
    }

    /// Discard an uncommitted object and everything written to it
    pub fn obj_abort(&self, layout: &Arc<PmdLayout>) -> Result<()> {
        self.discard(layout, true)
    }

    /// Reclaim an object's storage and identity
    pub fn obj_delete(&self, layout: &Arc<PmdLayout>) -> Result<()> {
        self.discard(layout, false)
    }

    fn discard(&self, layout: &Arc<PmdLayout>, abort_only: bool) -> Result<()> {
        let objid = layout.objid();
        let drive = self
            .drive_for(layout.mclass())
            .ok_or_else(|| Error::internal(format!("object {objid} has no backing drive")))?;

        {
            let mut state = layout.write();
            if state.aborting {
                return Err(Error::Busy(objid));
            }
            match state.stage {
                Stage::Retired => return Err(Error::NotFound(objid)),
                Stage::Committed if abort_only => return Err(Error::AlreadyCommitted(objid)),
                Stage::Committed | Stage::Uncommitted => {}
            }
            state.aborting = true;
        }

        // The record lock is released while the identity removal drains;
        // a commit racing this window observes `aborting` and fails busy.
        if let Err(err) = drive.otab_remove(objid.as_u64()) {
            layout.write().aborting = false;
            return Err(err);
        }

        // The identity is gone from media; zone erase is hygiene and must
        // not resurrect the object on failure.
        if drive.attrs().erase_on_free {
            if let Err(err) = drive.erase_extent(layout.zone()) {
                error!(objid = %objid, "erase of reclaimed zones failed: {err}");
            }
        }

        {
            let mut state = layout.write();
            state.aborting = false;
            state.stage = Stage::Retired;
        }

        self.objs.write().remove(&objid.as_u64());
        drive.zmap().free_extent(layout.zone())?;

        debug!(objid = %objid, abort = abort_only, "retired object");
        Ok(())
    }

    /// Count live objects on the given media class
    pub fn live_objects(&self, mclass: MediaClass) -> u64 {
        self.objs
            .read()
            .values()
            .filter(|l| l.mclass() == mclass)
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpool_common::DriveConfig;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn test_pmd(dir: &std::path::Path) -> Pmd {
        let cfg = DriveConfig {
            capacity: 16 * 1024 * 1024,
            ..DriveConfig::default()
        };
        let drive = Arc::new(
            PoolDrive::format(dir.join("mp0.pd"), &cfg, Uuid::new_v4(), "mp0").unwrap(),
        );
        Pmd::new(vec![drive])
    }

    #[test]
    fn test_alloc_assigns_identity_and_zones() {
        let dir = tempdir().unwrap();
        let pmd = test_pmd(dir.path());

        let a = pmd.obj_alloc(ObjectKind::Mblock, MediaClass::Capacity, false).unwrap();
        let b = pmd.obj_alloc(ObjectKind::Mblock, MediaClass::Capacity, false).unwrap();

        assert_ne!(a.objid(), b.objid());
        assert!(a.objid().is_mblock());
        assert_ne!(a.zone().start, b.zone().start);
        assert_eq!(a.read().stage, Stage::Uncommitted);
        assert_eq!(a.read().mblen, 0);
        assert_eq!(a.capacity(), 8 * 128 * 1024);
    }

    #[test]
    fn test_alloc_wrong_class() {
        let dir = tempdir().unwrap();
        let pmd = test_pmd(dir.path());
        let err = pmd
            .obj_alloc(ObjectKind::Mblock, MediaClass::Staging, false)
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_find_get_selectors() {
        let dir = tempdir().unwrap();
        let pmd = test_pmd(dir.path());
        let layout = pmd.obj_alloc(ObjectKind::Mblock, MediaClass::Capacity, false).unwrap();
        let objid = layout.objid();

        assert!(pmd.obj_find_get(objid, Find::Any).is_ok());
        assert!(pmd.obj_find_get(objid, Find::Uncommitted).is_ok());
        assert!(pmd.obj_find_get(objid, Find::Committed).unwrap_err().is_not_found());

        pmd.obj_commit(&layout).unwrap();
        assert!(pmd.obj_find_get(objid, Find::Committed).is_ok());
        assert!(pmd.obj_find_get(objid, Find::Uncommitted).unwrap_err().is_not_found());
    }

    #[test]
    fn test_commit_is_single_shot() {
        let dir = tempdir().unwrap();
        let pmd = test_pmd(dir.path());
        let layout = pmd.obj_alloc(ObjectKind::Mblock, MediaClass::Capacity, false).unwrap();

        pmd.obj_commit(&layout).unwrap();
        assert_eq!(layout.read().stage, Stage::Committed);
        assert!(matches!(
            pmd.obj_commit(&layout),
            Err(Error::AlreadyCommitted(_))
        ));
    }

    #[test]
    fn test_commit_busy_while_aborting() {
        let dir = tempdir().unwrap();
        let pmd = test_pmd(dir.path());
        let layout = pmd.obj_alloc(ObjectKind::Mblock, MediaClass::Capacity, false).unwrap();

        layout.write().aborting = true;
        assert!(matches!(pmd.obj_commit(&layout), Err(Error::Busy(_))));
        layout.write().aborting = false;
        pmd.obj_commit(&layout).unwrap();
    }

    #[test]
    fn test_abort_rejects_committed() {
        let dir = tempdir().unwrap();
        let pmd = test_pmd(dir.path());
        let layout = pmd.obj_alloc(ObjectKind::Mblock, MediaClass::Capacity, false).unwrap();

        pmd.obj_commit(&layout).unwrap();
        assert!(matches!(
            pmd.obj_abort(&layout),
            Err(Error::AlreadyCommitted(_))
        ));
    }

    #[test]
    fn test_abort_frees_zones_and_identity() {
        let dir = tempdir().unwrap();
        let pmd = test_pmd(dir.path());
        let layout = pmd.obj_alloc(ObjectKind::Mblock, MediaClass::Capacity, false).unwrap();
        let objid = layout.objid();
        let drive = pmd.drive_for(MediaClass::Capacity).unwrap();
        let free_before = drive.zmap().free_zones();

        pmd.obj_abort(&layout).unwrap();

        assert_eq!(layout.read().stage, Stage::Retired);
        assert!(pmd.obj_find_get(objid, Find::Any).unwrap_err().is_not_found());
        assert_eq!(drive.zmap().free_zones(), free_before + 8);

        // Terminal transitions cannot be replayed
        assert!(pmd.obj_abort(&layout).unwrap_err().is_not_found());
        assert!(pmd.obj_commit(&layout).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_works_on_committed() {
        let dir = tempdir().unwrap();
        let pmd = test_pmd(dir.path());
        let layout = pmd.obj_alloc(ObjectKind::Mblock, MediaClass::Capacity, false).unwrap();
        let objid = layout.objid();

        pmd.obj_commit(&layout).unwrap();
        pmd.obj_delete(&layout).unwrap();
        assert!(pmd.obj_find_get(objid, Find::Any).unwrap_err().is_not_found());
    }

    #[test]
    fn test_realloc_preserves_write_length() {
        let dir = tempdir().unwrap();
        let pmd = test_pmd(dir.path());
        let layout = pmd.obj_alloc(ObjectKind::Mblock, MediaClass::Capacity, false).unwrap();
        let objid = layout.objid();
        layout.write().mblen = 4096;
        drop(layout);

        let layout = pmd.obj_realloc(objid, MediaClass::Capacity).unwrap();
        assert_eq!(layout.read().mblen, 4096);

        pmd.obj_commit(&layout).unwrap();
        assert!(pmd
            .obj_realloc(objid, MediaClass::Capacity)
            .unwrap_err()
            .is_invalid_argument());
    }

    #[test]
    fn test_realloc_unknown_id() {
        let dir = tempdir().unwrap();
        let pmd = test_pmd(dir.path());
        let ghost = ObjectId::new(0x4242, ObjectKind::Mblock);
        assert!(pmd
            .obj_realloc(ghost, MediaClass::Capacity)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_adopt_rebuilds_directory() {
        let dir = tempdir().unwrap();
        let cfg = DriveConfig {
            capacity: 16 * 1024 * 1024,
            ..DriveConfig::default()
        };
        let uuid = Uuid::new_v4();
        let path = dir.path().join("mp0.pd");

        {
            let drive = Arc::new(PoolDrive::format(&path, &cfg, uuid, "mp0").unwrap());
            let pmd = Pmd::new(vec![Arc::clone(&drive)]);
            let a = pmd.obj_alloc(ObjectKind::Mblock, MediaClass::Capacity, false).unwrap();
            pmd.obj_commit(&a).unwrap();
            pmd.obj_alloc(ObjectKind::Mblock, MediaClass::Capacity, false).unwrap();
        }

        let drive = Arc::new(PoolDrive::activate(&path, &cfg).unwrap());
        let entries = drive.otab_snapshot();
        assert_eq!(entries.len(), 2);

        let pmd = Pmd::new(vec![Arc::clone(&drive)]);
        pmd.adopt(&drive, &entries).unwrap();

        assert_eq!(pmd.live_objects(MediaClass::Capacity), 2);
        let committed = entries.iter().find(|e| e.committed).unwrap();
        assert!(pmd.obj_find_get(committed.objid, Find::Committed).is_ok());

        // New identities never collide with adopted ones
        let fresh = pmd.obj_alloc(ObjectKind::Mblock, MediaClass::Capacity, false).unwrap();
        assert!(entries.iter().all(|e| e.objid != fresh.objid()));
    }
}
