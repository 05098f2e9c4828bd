//! Pool drive access
//!
//! A pool drive is a regular file or block device holding one media
//! class's share of a pool: a superblock, the object table, and the zoned
//! data region. [`PdFile`] is the raw positional-I/O handle; [`PoolDrive`]
//! layers the on-media geometry, the zone map, and the persistent object
//! table on top of it.

use crate::omf::{self, OtabEntry, SUPERBLOCK_SIZE, Superblock};
use crate::zone::{ZoneExtent, ZoneMap};
use mpool_common::{DriveConfig, Error, MediaClass, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Raw drive handle with positional I/O
#[derive(Debug)]
pub struct PdFile {
    file: File,
    path: PathBuf,
    size: u64,
}

impl PdFile {
    /// Open an existing drive
    pub fn open(path: impl AsRef<Path>, direct_io: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        Self::apply_direct_io(&mut options, direct_io);

        let file = options.open(&path)?;
        let size = Self::device_size(&file, &path)?;

        Ok(Self { file, path, size })
    }

    /// Create a new drive of the given size
    ///
    /// Regular files are created/truncated and sized; block devices are
    /// opened as-is and the size parameter is ignored in favor of the
    /// kernel-reported device size.
    pub fn create(path: impl AsRef<Path>, size: u64, direct_io: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let is_block = Self::is_block_device(&path);

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !is_block {
            options.create(true).truncate(true);
        }
        Self::apply_direct_io(&mut options, direct_io);

        let file = options.open(&path)?;

        let actual_size = if is_block {
            Self::block_device_size(&file)?
        } else {
            file.set_len(size)?;
            size
        };

        Ok(Self {
            file,
            path,
            size: actual_size,
        })
    }

    #[cfg(target_os = "linux")]
    fn apply_direct_io(options: &mut OpenOptions, direct_io: bool) {
        if direct_io {
            // O_DIRECT bypasses the page cache; callers must keep all
            // I/O page aligned when this is enabled
            options.custom_flags(libc::O_DIRECT);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_direct_io(_options: &mut OpenOptions, _direct_io: bool) {}

    /// Check if path is a block device
    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(path).is_ok_and(|m| m.file_type().is_block_device())
    }

    fn device_size(file: &File, path: &Path) -> Result<u64> {
        if Self::is_block_device(path) {
            Self::block_device_size(file)
        } else {
            Ok(file.metadata()?.len())
        }
    }

    /// Get block device size using the BLKGETSIZE64 ioctl
    #[cfg(target_os = "linux")]
    fn block_device_size(file: &File) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &raw mut size) };

        if ret == -1 {
            return Err(Error::DeviceIo(std::io::Error::last_os_error()));
        }

        Ok(size)
    }

    /// Get block device size (non-Linux fallback)
    #[cfg(not(target_os = "linux"))]
    fn block_device_size(file: &File) -> Result<u64> {
        Ok(file.metadata()?.len())
    }

    /// Get the drive size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Get the drive path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read exactly `buf.len()` bytes at the given offset
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Write the whole buffer at the given offset
    pub fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Flush written data to stable media
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Drive attributes reported to clients and the I/O paths
#[derive(Clone, Copy, Debug)]
pub struct DriveAttrs {
    /// Media class of this drive
    pub mclass: MediaClass,
    /// Zone size in bytes
    pub zone_size: u32,
    /// Write alignment granularity
    pub optimal_io_size: u32,
    /// Zones per mblock
    pub mblock_zones: u32,
    /// Whether completed writes are durable without a flush
    pub fua: bool,
    /// Zero-fill zones when an object is reclaimed
    pub erase_on_free: bool,
}

/// Drive I/O statistics
#[derive(Debug, Default)]
pub struct PdStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub flushes: AtomicU64,
}

/// One backing drive of a pool
#[derive(Debug)]
pub struct PoolDrive {
    file: PdFile,
    attrs: DriveAttrs,
    pool_uuid: Uuid,
    pool_name: String,
    otab_offset: u64,
    otab_size: u64,
    data_offset: u64,
    zmap: ZoneMap,
    /// In-memory image of the persistent object table; mutations go to
    /// media before they are visible here
    otab: Mutex<BTreeMap<u64, OtabEntry>>,
    stats: PdStats,
}

impl PoolDrive {
    /// Format a drive for a new pool
    pub fn format(
        path: impl AsRef<Path>,
        cfg: &DriveConfig,
        pool_uuid: Uuid,
        pool_name: &str,
    ) -> Result<Self> {
        let file = PdFile::create(path, cfg.capacity, cfg.direct_io)?;
        let sb = Superblock::new(cfg, pool_uuid, pool_name, file.size())?;

        file.write_all_at(0, &sb.to_bytes())?;
        file.write_all_at(sb.otab_offset, &omf::encode_otab(&[])?)?;
        file.sync_data()?;

        Ok(Self::assemble(file, &sb, cfg, BTreeMap::new()))
    }

    /// Activate an existing drive, rediscovering its live objects
    pub fn activate(path: impl AsRef<Path>, cfg: &DriveConfig) -> Result<Self> {
        let file = PdFile::open(path, cfg.direct_io)?;

        let mut sb_buf = vec![0u8; SUPERBLOCK_SIZE as usize];
        file.read_exact_at(0, &mut sb_buf)?;
        let sb = Superblock::from_bytes(&sb_buf)?;
        sb.validate(file.size())?;

        let mut otab_buf = vec![0u8; sb.otab_size as usize];
        file.read_exact_at(sb.otab_offset, &mut otab_buf)?;
        let entries = omf::decode_otab(&otab_buf)?;

        let drive = Self::assemble(
            file,
            &sb,
            cfg,
            entries
                .iter()
                .map(|e| (e.objid.as_u64(), *e))
                .collect(),
        );

        for entry in &entries {
            drive.zmap.reserve(ZoneExtent::new(entry.zstart, entry.zcnt))?;
        }

        Ok(drive)
    }

    fn assemble(
        file: PdFile,
        sb: &Superblock,
        cfg: &DriveConfig,
        otab: BTreeMap<u64, OtabEntry>,
    ) -> Self {
        Self {
            file,
            attrs: DriveAttrs {
                mclass: sb.mclass,
                zone_size: sb.zone_size,
                optimal_io_size: sb.optimal_io_size,
                mblock_zones: sb.mblock_zones,
                // Runtime device properties come from the caller's
                // configuration, not from media
                fua: cfg.fua,
                erase_on_free: cfg.erase_on_free,
            },
            pool_uuid: sb.pool_uuid,
            pool_name: sb.name(),
            otab_offset: sb.otab_offset,
            otab_size: sb.otab_size,
            data_offset: sb.data_offset,
            zmap: ZoneMap::new(sb.zone_total, sb.spare_base),
            otab: Mutex::new(otab),
            stats: PdStats::default(),
        }
    }

    /// Get the drive attributes
    pub fn attrs(&self) -> &DriveAttrs {
        &self.attrs
    }

    /// Get the pool UUID recorded on this drive
    pub fn pool_uuid(&self) -> Uuid {
        self.pool_uuid
    }

    /// Get the pool name recorded on this drive
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// Get the drive path
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Get the zone map
    pub fn zmap(&self) -> &ZoneMap {
        &self.zmap
    }

    /// Get the I/O statistics
    pub fn stats(&self) -> &PdStats {
        &self.stats
    }

    /// Snapshot the live object table records
    pub fn otab_snapshot(&self) -> Vec<OtabEntry> {
        self.otab.lock().values().copied().collect()
    }

    fn data_pos(&self, zstart: u64, boff: u64) -> u64 {
        self.data_offset + zstart * u64::from(self.attrs.zone_size) + boff
    }

    /// Gather-write into an object's extent at the given byte offset
    ///
    /// With `durable` set, data is flushed before returning, standing in
    /// for a force-unit-access write.
    pub fn write_data(&self, zstart: u64, boff: u64, bufs: &[&[u8]], durable: bool) -> Result<()> {
        let mut pos = self.data_pos(zstart, boff);
        for buf in bufs {
            self.file.write_all_at(pos, buf)?;
            pos += buf.len() as u64;
        }
        if durable {
            self.file.sync_data()?;
        }

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(pos - self.data_pos(zstart, boff), Ordering::Relaxed);
        Ok(())
    }

    /// Read from an object's extent at the given byte offset
    pub fn read_data(&self, zstart: u64, boff: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(self.data_pos(zstart, boff), buf)?;

        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_read
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Flush the drive's write cache
    pub fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Zero-fill an object's zones
    pub fn erase_extent(&self, extent: ZoneExtent) -> Result<()> {
        let zeros = vec![0u8; self.attrs.zone_size as usize];
        for zone in extent.start..extent.end() {
            self.file.write_all_at(self.data_pos(zone, 0), &zeros)?;
        }
        Ok(())
    }

    /// Insert or update an object table record, durably
    ///
    /// The in-memory table is only updated once the rewrite reached
    /// media, so a failed update leaves both views unchanged.
    pub fn otab_upsert(&self, entry: OtabEntry) -> Result<()> {
        let mut otab = self.otab.lock();
        let key = entry.objid.as_u64();
        let prev = otab.insert(key, entry);

        if let Err(err) = self.otab_write_locked(&otab) {
            match prev {
                Some(prev) => otab.insert(key, prev),
                None => otab.remove(&key),
            };
            return Err(err);
        }
        Ok(())
    }

    /// Remove an object table record, durably
    pub fn otab_remove(&self, objid: u64) -> Result<()> {
        let mut otab = self.otab.lock();
        let Some(prev) = otab.remove(&objid) else {
            return Ok(());
        };

        if let Err(err) = self.otab_write_locked(&otab) {
            otab.insert(objid, prev);
            return Err(err);
        }
        Ok(())
    }

    fn otab_write_locked(&self, otab: &BTreeMap<u64, OtabEntry>) -> Result<()> {
        let entries: Vec<OtabEntry> = otab.values().copied().collect();
        let buf = omf::encode_otab(&entries)?;
        if buf.len() as u64 > self.otab_size {
            return Err(Error::InsufficientSpace {
                required: buf.len() as u64,
                available: self.otab_size,
            });
        }

        self.file.write_all_at(self.otab_offset, &buf)?;
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpool_common::{ObjectId, ObjectKind};
    use tempfile::tempdir;

    fn small_cfg() -> DriveConfig {
        DriveConfig {
            capacity: 16 * 1024 * 1024, // 16 MB
            ..DriveConfig::default()
        }
    }

    #[test]
    fn test_format_and_activate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mp0.pd");
        let cfg = small_cfg();
        let uuid = Uuid::new_v4();

        {
            let drive = PoolDrive::format(&path, &cfg, uuid, "mp0").unwrap();
            assert_eq!(drive.pool_uuid(), uuid);
            assert_eq!(drive.pool_name(), "mp0");
            assert!(drive.zmap().total_zones() > 0);
        }

        let drive = PoolDrive::activate(&path, &cfg).unwrap();
        assert_eq!(drive.pool_uuid(), uuid);
        assert_eq!(drive.attrs().zone_size, cfg.zone_size);
        assert!(drive.otab_snapshot().is_empty());
    }

    #[test]
    fn test_activate_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.pd");
        std::fs::write(&path, vec![0u8; 64 * 1024]).unwrap();

        let err = PoolDrive::activate(&path, &small_cfg()).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_data_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mp0.pd");
        let drive = PoolDrive::format(&path, &small_cfg(), Uuid::new_v4(), "mp0").unwrap();

        let part1 = vec![0xabu8; 4096];
        let part2 = vec![0xcdu8; 4096];
        drive.write_data(2, 0, &[&part1, &part2], false).unwrap();
        drive.flush().unwrap();

        let mut out = vec![0u8; 8192];
        drive.read_data(2, 0, &mut out).unwrap();
        assert_eq!(&out[..4096], &part1[..]);
        assert_eq!(&out[4096..], &part2[..]);

        assert_eq!(drive.stats().writes.load(Ordering::Relaxed), 1);
        assert_eq!(drive.stats().bytes_written.load(Ordering::Relaxed), 8192);
    }

    #[test]
    fn test_otab_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mp0.pd");
        let cfg = small_cfg();
        let uuid = Uuid::new_v4();

        let entry = OtabEntry {
            objid: ObjectId::new(1, ObjectKind::Mblock),
            zstart: 0,
            zcnt: 8,
            mblen: 4096,
            committed: false,
        };

        {
            let drive = PoolDrive::format(&path, &cfg, uuid, "mp0").unwrap();
            drive.otab_upsert(entry).unwrap();
        }

        let drive = PoolDrive::activate(&path, &cfg).unwrap();
        let entries = drive.otab_snapshot();
        assert_eq!(entries, vec![entry]);

        // Zones referenced by the table were reserved at activation
        assert!(drive.zmap().is_allocated(0));
        assert!(drive.zmap().is_allocated(7));
        assert!(!drive.zmap().is_allocated(8));

        drive.otab_remove(entry.objid.as_u64()).unwrap();
        assert!(drive.otab_snapshot().is_empty());
    }

    #[test]
    fn test_erase_extent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mp0.pd");
        let drive = PoolDrive::format(&path, &small_cfg(), Uuid::new_v4(), "mp0").unwrap();

        let data = vec![0x77u8; 4096];
        drive.write_data(0, 0, &[&data], false).unwrap();
        drive.erase_extent(ZoneExtent::new(0, 1)).unwrap();

        let mut out = vec![0xffu8; 4096];
        drive.read_data(0, 0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }
}
