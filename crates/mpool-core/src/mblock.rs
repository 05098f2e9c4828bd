//! Mblock operations
//!
//! Mblocks are fixed-capacity, append-then-immutable objects. A client
//! allocates one, appends sequentially, commits it (after which it is
//! permanently read-only and durable), and reads ranges of it; an
//! uncommitted mblock can instead be aborted. Writes and lifecycle
//! transitions take the object's exclusive lock; reads and property
//! snapshots take the shared lock, so readers of a committed mblock never
//! contend with each other.

use crate::mpool::Mpool;
use crate::pd::PoolDrive;
use crate::pmd::{LayoutState, PmdLayout, Stage};
use mpool_common::{
    Error, Find, MblockProps, MblockPropsEx, MediaClass, ObjectId, ObjectKind, PAGE_SIZE, Result,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Opaque client handle to an mblock
///
/// Holds one shared reference to the object record. Dropping the handle
/// (or passing it to [`Mpool::mblock_put`]) releases the reference; the
/// record itself is reclaimed once the directory and every handle have
/// let go after a terminal lifecycle transition.
#[derive(Debug)]
pub struct Mblock {
    layout: Arc<PmdLayout>,
}

impl Mblock {
    pub(crate) fn new(layout: Arc<PmdLayout>) -> Self {
        Self { layout }
    }

    /// Get the object identifier this handle refers to
    #[must_use]
    pub fn objid(&self) -> ObjectId {
        self.layout.objid()
    }
}

/// Direction of a validated data-path request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RwOp {
    Read,
    Write,
}

/// Validate an mblock read or write request
///
/// Pure function of the object geometry and the request; takes no lock
/// and performs no I/O. Checks here keep illegal arguments out of the
/// lower layers, which assert rather than re-check.
fn rw_argcheck(
    objid: ObjectId,
    cap: u64,
    mblen: u64,
    opt_iosz: u64,
    max_probe: u64,
    boff: u64,
    len: u64,
    op: RwOp,
) -> Result<()> {
    match op {
        RwOp::Read => {
            // boff must be a multiple of the OS page size
            if boff % u64::from(PAGE_SIZE) != 0 {
                return Err(Error::invalid_argument(format!(
                    "read offset {boff:#x} of {objid} is not page aligned"
                )));
            }

            if boff >= cap {
                return Err(Error::invalid_argument(format!(
                    "read offset {boff:#x} of {objid} is at or past capacity {cap:#x}"
                )));
            }

            // A probe extending at most max_probe past the written data
            // is a tolerated read-ahead request and gets clamped by the
            // caller rather than failed here.
            if boff + len > mblen + max_probe {
                return Err(Error::invalid_argument(format!(
                    "read of {len:#x} at {boff:#x} of {objid} exceeds written length {mblen:#x}"
                )));
            }
        }
        RwOp::Write => {
            // Appends only: boff is required to match the write length
            if boff != mblen {
                return Err(Error::invalid_argument(format!(
                    "write offset {boff:#x} of {objid} != write length {mblen:#x}"
                )));
            }

            if boff % opt_iosz != 0 {
                return Err(Error::invalid_argument(format!(
                    "write offset {boff:#x} of {objid} is not optimal I/O size aligned"
                )));
            }

            if boff + len > cap {
                return Err(Error::invalid_argument(format!(
                    "write of {len:#x} at {boff:#x} of {objid} extends past capacity {cap:#x}"
                )));
            }
        }
    }

    Ok(())
}

impl Mpool {
    /// Convert an opaque mblock handle to the object record
    ///
    /// Total resolve-or-fail step: the kind tag is checked before any
    /// operation proceeds, and a record the directory no longer holds is
    /// reported through the rate-limited diagnostic channel as a likely
    /// caller bug (the operation itself then fails on the retired stage,
    /// not here).
    fn mblock_to_layout<'h>(&self, mbh: &'h Mblock) -> Result<&'h Arc<PmdLayout>> {
        let layout = &mbh.layout;

        if !layout.objid().is_mblock() {
            if self.limiter().check("mblock_bad_handle") {
                warn!(pool = self.name(), objid = %layout.objid(), "handle does not name an mblock");
            }
            return Err(Error::invalid_argument(format!(
                "handle {} does not name an mblock",
                layout.objid()
            )));
        }

        // The directory holds a reference while the identity is live, so
        // a live object resolved through a client handle has at least two.
        if Arc::strong_count(layout) < 2 && self.limiter().check("mblock_stale_handle") {
            warn!(pool = self.name(), objid = %layout.objid(), "handle references a reclaimed object");
        }

        Ok(layout)
    }

    fn drive_of(&self, layout: &Arc<PmdLayout>) -> Result<&Arc<PoolDrive>> {
        self.pmd().drive_for(layout.mclass()).ok_or_else(|| {
            Error::internal(format!("object {} has no backing drive", layout.objid()))
        })
    }

    fn getprops_cmn(&self, layout: &Arc<PmdLayout>, drive: &PoolDrive, state: &LayoutState) -> MblockProps {
        MblockProps {
            objid: layout.objid(),
            alloc_cap: layout.capacity(),
            write_len: state.mblen,
            optimal_wrsz: drive.attrs().optimal_io_size,
            mclass: layout.mclass(),
            committed: state.stage == Stage::Committed,
        }
    }

    fn props_of(&self, layout: &Arc<PmdLayout>) -> Result<MblockProps> {
        let drive = self.drive_of(layout)?;
        let state = layout.read();
        Ok(self.getprops_cmn(layout, drive, &state))
    }

    /// Allocate a new mblock
    ///
    /// The object starts uncommitted with a write length of zero and a
    /// capacity fixed by the drive's geometry. It is not findable by
    /// other clients as committed until [`Mpool::mblock_commit`].
    pub fn mblock_alloc(&self, mclass: MediaClass, spare: bool) -> Result<(Mblock, MblockProps)> {
        let layout = self.pmd().obj_alloc(ObjectKind::Mblock, mclass, spare)?;
        let props = self.props_of(&layout)?;
        Ok((Mblock::new(layout), props))
    }

    /// Recover a previously allocated, not-yet-committed mblock by id
    ///
    /// Used after a restart to resume an interrupted write sequence; the
    /// partial write length is preserved, so the next append must land
    /// exactly there.
    pub fn mblock_realloc(
        &self,
        objid: u64,
        mclass: MediaClass,
        spare: bool,
    ) -> Result<(Mblock, MblockProps)> {
        let Some(objid) = ObjectId::from_raw(objid).filter(|id| id.is_mblock()) else {
            return Err(Error::invalid_argument(format!(
                "{objid:#x} is not an mblock id"
            )));
        };

        match self.pmd().obj_realloc(objid, mclass) {
            Ok(layout) => {
                debug!(pool = self.name(), %objid, spare, "re-acquired mblock");
                let props = self.props_of(&layout)?;
                Ok((Mblock::new(layout), props))
            }
            Err(err) => {
                // Not-found is expected while probing for survivors of a
                // restart; anything else is reported.
                if err.is_not_found() {
                    debug!(pool = self.name(), %objid, "mblock not found on realloc");
                } else {
                    error!(pool = self.name(), %objid, "re-allocating mblock failed: {err}");
                }
                Err(err)
            }
        }
    }

    /// Look up an existing mblock by id and acquire a reference
    pub fn mblock_find_get(&self, objid: u64, which: Find) -> Result<(Mblock, MblockProps)> {
        let Some(objid) = ObjectId::from_raw(objid).filter(|id| id.is_mblock()) else {
            return Err(Error::invalid_argument(format!(
                "{objid:#x} is not an mblock id"
            )));
        };

        let layout = self.pmd().obj_find_get(objid, which)?;
        let props = self.props_of(&layout)?;
        Ok((Mblock::new(layout), props))
    }

    /// Release the caller's reference to an mblock
    ///
    /// The object's state is unchanged; after a terminal abort or delete
    /// the record's memory is reclaimed once the last reference drops.
    pub fn mblock_put(&self, mbh: Mblock) {
        drop(mbh);
    }

    /// Commit an mblock, making its data durable and read-only
    ///
    /// If the backing drive does not guarantee durability on write
    /// completion, its write cache is flushed first.
    pub fn mblock_commit(&self, mbh: &Mblock) -> Result<()> {
        let layout = self.mblock_to_layout(mbh)?;
        let drive = self.drive_of(layout)?;

        if !drive.attrs().fua {
            drive.flush()?;
        }

        // Fails busy if an abort is draining on this object
        self.pmd().obj_commit(layout).inspect_err(|err| {
            if self.limiter().check("mblock_commit_failed") {
                error!(pool = self.name(), objid = %layout.objid(), "committing mblock failed: {err}");
            }
        })
    }

    /// Discard an uncommitted mblock and all data written to it
    pub fn mblock_abort(&self, mbh: &Mblock) -> Result<()> {
        let layout = self.mblock_to_layout(mbh)?;

        self.pmd().obj_abort(layout).inspect_err(|err| {
            error!(pool = self.name(), objid = %layout.objid(), "aborting mblock failed: {err}");
        })
    }

    /// Reclaim a committed or uncommitted mblock's storage and identity
    pub fn mblock_delete(&self, mbh: &Mblock) -> Result<()> {
        let layout = self.mblock_to_layout(mbh)?;
        self.pmd().obj_delete(layout)
    }

    /// Append data to an uncommitted mblock
    ///
    /// `boff` must equal the current write length; the check is repeated
    /// under the object's exclusive lock, so of several racing appends
    /// exactly one succeeds and the rest observe a stale offset. Writes
    /// to distinct mblocks proceed independently.
    pub fn mblock_write(&self, mbh: &Mblock, boff: u64, bufs: &[&[u8]]) -> Result<()> {
        let layout = self.mblock_to_layout(mbh)?;

        let len: u64 = bufs.iter().map(|b| b.len() as u64).sum();
        if len == 0 {
            return Ok(());
        }

        let drive = self.drive_of(layout)?;
        let objid = layout.objid();

        let mut state = layout.write();
        if state.aborting {
            return Err(Error::Busy(objid));
        }
        match state.stage {
            Stage::Retired => return Err(Error::NotFound(objid)),
            Stage::Committed => return Err(Error::AlreadyCommitted(objid)),
            Stage::Uncommitted => {}
        }

        rw_argcheck(
            objid,
            u64::from(layout.capacity()),
            u64::from(state.mblen),
            u64::from(drive.attrs().optimal_io_size),
            0,
            boff,
            len,
            RwOp::Write,
        )
        .inspect_err(|err| debug!("mblock write argcheck failed: {err}"))?;

        // Request a durable write only when the drive guarantees
        // durability on completion; otherwise commit flushes explicitly.
        drive.write_data(layout.zone().start, boff, bufs, drive.attrs().fua)?;
        state.mblen = (boff + len) as u32;

        Ok(())
    }

    /// Read a range of a committed mblock
    ///
    /// Returns the number of bytes read. Many readers may proceed
    /// concurrently; only a writer or lifecycle transition on the same
    /// object blocks them. A request ending within the configured
    /// read-ahead tolerance past the written length is clamped to the
    /// written length rather than failed.
    pub fn mblock_read(&self, mbh: &Mblock, boff: u64, buf: &mut [u8]) -> Result<usize> {
        let layout = self.mblock_to_layout(mbh)?;

        if buf.is_empty() {
            return Ok(0);
        }

        let drive = self.drive_of(layout)?;
        let objid = layout.objid();

        let state = layout.read();
        if state.aborting {
            return Err(Error::Busy(objid));
        }
        match state.stage {
            Stage::Retired => return Err(Error::NotFound(objid)),
            Stage::Uncommitted => return Err(Error::NotReady(objid)),
            Stage::Committed => {}
        }

        rw_argcheck(
            objid,
            u64::from(layout.capacity()),
            u64::from(state.mblen),
            u64::from(drive.attrs().optimal_io_size),
            u64::from(self.read_ahead().max_probe),
            boff,
            buf.len() as u64,
            RwOp::Read,
        )
        .inspect_err(|err| debug!("mblock read argcheck failed: {err}"))?;

        let n = u64::from(state.mblen)
            .saturating_sub(boff)
            .min(buf.len() as u64) as usize;
        if n > 0 {
            drive.read_data(layout.zone().start, boff, &mut buf[..n])?;
        }

        Ok(n)
    }

    /// Snapshot an mblock's properties
    pub fn mblock_get_props(&self, mbh: &Mblock) -> Result<MblockProps> {
        let layout = self.mblock_to_layout(mbh)?;
        self.props_of(layout)
    }

    /// Snapshot an mblock's extended properties
    pub fn mblock_get_props_ex(&self, mbh: &Mblock) -> Result<MblockPropsEx> {
        let layout = self.mblock_to_layout(mbh)?;
        let drive = self.drive_of(layout)?;

        let state = layout.read();
        Ok(MblockPropsEx {
            props: self.getprops_cmn(layout, drive, &state),
            zone_cnt: layout.zone().count,
        })
    }
}
