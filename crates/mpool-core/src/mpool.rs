//! Pool descriptor
//!
//! An mpool is a named set of backing drives, at most one per media
//! class, plus the object directory built over them. Creating a pool
//! formats every drive; opening one validates the superblocks and
//! rediscovers the live objects from the persisted object tables, which
//! is what lets an interrupted writer recover its mblock by identity.

use crate::pd::PoolDrive;
use crate::pmd::Pmd;
use crate::ratelimit::DiagLimiter;
use mpool_common::{Error, MediaClass, MpoolConfig, MpoolUsage, ReadAheadConfig, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// A storage pool descriptor
#[derive(Debug)]
pub struct Mpool {
    name: String,
    uuid: Uuid,
    read_ahead: ReadAheadConfig,
    drives: Vec<Arc<PoolDrive>>,
    pmd: Pmd,
    limiter: DiagLimiter,
}

impl Mpool {
    /// Create a pool, formatting every configured drive
    pub fn create(dir: &Path, cfg: &MpoolConfig) -> Result<Self> {
        Self::check_cfg(cfg)?;

        let uuid = Uuid::new_v4();
        let mut drives = Vec::with_capacity(cfg.drives.len());
        for dcfg in &cfg.drives {
            let path = resolve_path(dir, &dcfg.path);
            drives.push(Arc::new(PoolDrive::format(&path, dcfg, uuid, &cfg.name)?));
        }

        let pmd = Pmd::new(drives.clone());
        info!(name = %cfg.name, %uuid, drives = drives.len(), "created pool");

        Ok(Self {
            name: cfg.name.clone(),
            uuid,
            read_ahead: cfg.read_ahead,
            drives,
            pmd,
            limiter: DiagLimiter::default(),
        })
    }

    /// Activate an existing pool, rediscovering its live objects
    pub fn open(dir: &Path, cfg: &MpoolConfig) -> Result<Self> {
        Self::check_cfg(cfg)?;

        let mut drives = Vec::with_capacity(cfg.drives.len());
        for dcfg in &cfg.drives {
            let path = resolve_path(dir, &dcfg.path);
            let drive = PoolDrive::activate(&path, dcfg)?;

            if drive.pool_name() != cfg.name {
                return Err(Error::corrupt(format!(
                    "drive {} belongs to pool {:?}, not {:?}",
                    path.display(),
                    drive.pool_name(),
                    cfg.name
                )));
            }
            drives.push(Arc::new(drive));
        }

        let uuid = drives[0].pool_uuid();
        if drives.iter().any(|d| d.pool_uuid() != uuid) {
            return Err(Error::corrupt("pool uuid differs across drives"));
        }

        let pmd = Pmd::new(drives.clone());
        let mut objects = 0usize;
        for drive in &drives {
            let entries = drive.otab_snapshot();
            objects += entries.len();
            pmd.adopt(drive, &entries)?;
        }

        info!(name = %cfg.name, %uuid, drives = drives.len(), objects, "activated pool");

        Ok(Self {
            name: cfg.name.clone(),
            uuid,
            read_ahead: cfg.read_ahead,
            drives,
            pmd,
            limiter: DiagLimiter::default(),
        })
    }

    fn check_cfg(cfg: &MpoolConfig) -> Result<()> {
        if cfg.drives.is_empty() {
            return Err(Error::invalid_argument("a pool needs at least one drive"));
        }

        for (i, dcfg) in cfg.drives.iter().enumerate() {
            dcfg.validate()?;
            if cfg.drives[..i].iter().any(|d| d.mclass == dcfg.mclass) {
                return Err(Error::invalid_argument(format!(
                    "more than one drive of media class {}",
                    dcfg.mclass
                )));
            }
        }

        Ok(())
    }

    /// Get the pool name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the pool identity
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Get space usage for one media class
    pub fn usage(&self, mclass: MediaClass) -> Result<MpoolUsage> {
        let drive = self
            .pmd
            .drive_for(mclass)
            .ok_or_else(|| Error::invalid_argument(format!("no drive of media class {mclass}")))?;

        Ok(MpoolUsage {
            total_zones: drive.zmap().total_zones(),
            free_zones: drive.zmap().free_zones(),
            spare_zones: drive.zmap().spare_zones(),
            mblock_cnt: self.pmd.live_objects(mclass),
        })
    }

    /// Iterate over the pool's drives, e.g. to read their I/O statistics
    pub fn drives(&self) -> impl Iterator<Item = &Arc<PoolDrive>> {
        self.drives.iter()
    }

    pub(crate) fn pmd(&self) -> &Pmd {
        &self.pmd
    }

    pub(crate) fn limiter(&self) -> &DiagLimiter {
        &self.limiter
    }

    pub(crate) fn read_ahead(&self) -> ReadAheadConfig {
        self.read_ahead
    }
}

fn resolve_path(dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}
