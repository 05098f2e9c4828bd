//! On-media format definitions
//!
//! Drive layout:
//! ```text
//! +------------------+  offset 0
//! |   Superblock     |  4KB - magic, version, pool UUID, geometry
//! +------------------+
//! |  Object table    |  live object records, rewritten on lifecycle
//! |                  |  transitions (alloc/commit/abort/delete)
//! +------------------+
//! |   Data region    |  zones, allocated to mblocks in fixed extents
//! +------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mpool_common::{DriveConfig, Error, MediaClass, ObjectId, PAGE_SIZE, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Magic number for the mpool drive format
pub const MAGIC: [u8; 8] = *b"MPOOLOMF";

/// Current on-media format version
pub const FORMAT_VERSION: u32 = 1;

/// Superblock size (4KB)
pub const SUPERBLOCK_SIZE: u64 = 4096;

/// Maximum pool name length stored in the superblock (NUL padded)
pub const NAME_LEN_MAX: usize = 32;

/// Object table header magic ("MPOT")
const OTAB_MAGIC: u32 = 0x4D50_4F54;

/// Object table header size: magic + length + crc32c
const OTAB_HEADER_SIZE: usize = 12;

/// Serialized upper bound for one object table record
const OTAB_ENTRY_MAX: u64 = 64;

/// Align a value up to the nearest multiple of `align`
#[inline]
const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

/// Superblock stored at the beginning of each pool drive
#[derive(Clone, Debug)]
pub struct Superblock {
    /// Magic number for format identification
    pub magic: [u8; 8],
    /// Format version
    pub version: u32,
    /// Pool identity, identical across all drives of one pool
    pub pool_uuid: Uuid,
    /// Pool name, NUL padded
    name: [u8; NAME_LEN_MAX],
    /// Media class of this drive
    pub mclass: MediaClass,
    /// Zone size in bytes
    pub zone_size: u32,
    /// Total zones in the data region
    pub zone_total: u64,
    /// Zones at or above this index are spares
    pub spare_base: u64,
    /// Write alignment granularity reported to clients
    pub optimal_io_size: u32,
    /// Zones per mblock on this drive
    pub mblock_zones: u32,
    /// Object table region offset
    pub otab_offset: u64,
    /// Object table region size
    pub otab_size: u64,
    /// Data region offset
    pub data_offset: u64,
    /// Creation timestamp (Unix epoch)
    pub created_at: u64,
    /// Checksum of the superblock (excluding this field)
    pub checksum: u32,
}

impl Superblock {
    /// Create a new superblock for a drive of the given size
    pub fn new(cfg: &DriveConfig, pool_uuid: Uuid, pool_name: &str, device_size: u64) -> Result<Self> {
        cfg.validate()?;

        if pool_name.is_empty() || pool_name.len() >= NAME_LEN_MAX {
            return Err(Error::invalid_argument(format!(
                "pool name must be 1..{NAME_LEN_MAX} bytes"
            )));
        }

        let zone_size = u64::from(cfg.zone_size);
        let otab_offset = SUPERBLOCK_SIZE;

        // Size the object table for the worst case of minimum-capacity
        // objects filling the whole data region.
        let approx_zones = device_size / zone_size;
        let max_objects = (approx_zones / u64::from(cfg.mblock_zones)).max(16);
        let otab_size = align_up(
            OTAB_HEADER_SIZE as u64 + max_objects * OTAB_ENTRY_MAX,
            u64::from(PAGE_SIZE),
        );

        let data_offset = align_up(otab_offset + otab_size, zone_size);
        if device_size <= data_offset {
            return Err(Error::invalid_argument(format!(
                "drive size {device_size} leaves no data region"
            )));
        }

        let zone_total = (device_size - data_offset) / zone_size;
        if zone_total < u64::from(cfg.mblock_zones) {
            return Err(Error::invalid_argument(format!(
                "drive size {device_size} cannot hold a single mblock"
            )));
        }

        let spare = zone_total * u64::from(cfg.spare_pct) / 100;
        let spare_base = zone_total - spare;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut name = [0u8; NAME_LEN_MAX];
        name[..pool_name.len()].copy_from_slice(pool_name.as_bytes());

        let mut sb = Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            pool_uuid,
            name,
            mclass: cfg.mclass,
            zone_size: cfg.zone_size,
            zone_total,
            spare_base,
            optimal_io_size: cfg.optimal_io_size,
            mblock_zones: cfg.mblock_zones,
            otab_offset,
            otab_size,
            data_offset,
            created_at: now,
            checksum: 0,
        };

        sb.checksum = sb.compute_checksum();
        Ok(sb)
    }

    /// Get the pool name
    #[must_use]
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN_MAX);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Serialize superblock to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SUPERBLOCK_SIZE as usize);

        buf.put_slice(&self.magic);
        buf.put_u32_le(self.version);
        buf.put_slice(self.pool_uuid.as_bytes());
        buf.put_slice(&self.name);
        buf.put_u8(self.mclass.tag());
        buf.put_u8(0); // flags, reserved
        buf.put_u16_le(0); // reserved
        buf.put_u32_le(self.zone_size);
        buf.put_u64_le(self.zone_total);
        buf.put_u64_le(self.spare_base);
        buf.put_u32_le(self.optimal_io_size);
        buf.put_u32_le(self.mblock_zones);
        buf.put_u64_le(self.otab_offset);
        buf.put_u64_le(self.otab_size);
        buf.put_u64_le(self.data_offset);
        buf.put_u64_le(self.created_at);
        buf.put_u32_le(self.checksum);

        // Pad to SUPERBLOCK_SIZE
        buf.resize(SUPERBLOCK_SIZE as usize, 0);

        buf.freeze()
    }

    /// Parse superblock from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::CHECKSUM_OFFSET + 4 {
            return Err(Error::corrupt("superblock too small"));
        }

        let mut buf = &data[..];

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(Error::corrupt("invalid superblock magic"));
        }

        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported format version: {version}"
            )));
        }

        let mut uuid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut uuid_bytes);
        let pool_uuid = Uuid::from_bytes(uuid_bytes);

        let mut name = [0u8; NAME_LEN_MAX];
        buf.copy_to_slice(&mut name);

        let mclass_tag = buf.get_u8();
        let mclass = MediaClass::from_tag(mclass_tag)
            .ok_or_else(|| Error::corrupt(format!("invalid media class tag {mclass_tag}")))?;
        let _flags = buf.get_u8();
        let _reserved = buf.get_u16_le();

        let zone_size = buf.get_u32_le();
        let zone_total = buf.get_u64_le();
        let spare_base = buf.get_u64_le();
        let optimal_io_size = buf.get_u32_le();
        let mblock_zones = buf.get_u32_le();
        let otab_offset = buf.get_u64_le();
        let otab_size = buf.get_u64_le();
        let data_offset = buf.get_u64_le();
        let created_at = buf.get_u64_le();
        let checksum = buf.get_u32_le();

        let sb = Self {
            magic,
            version,
            pool_uuid,
            name,
            mclass,
            zone_size,
            zone_total,
            spare_base,
            optimal_io_size,
            mblock_zones,
            otab_offset,
            otab_size,
            data_offset,
            created_at,
            checksum,
        };

        if sb.compute_checksum() != checksum {
            return Err(Error::corrupt("superblock checksum mismatch"));
        }

        Ok(sb)
    }

    /// Offset of the checksum field within the serialized superblock:
    /// magic(8) + version(4) + pool_uuid(16) + name(32) + mclass(1) +
    /// flags(1) + reserved(2) + zone_size(4) + zone_total(8) +
    /// spare_base(8) + optimal_io_size(4) + mblock_zones(4) +
    /// otab_offset(8) + otab_size(8) + data_offset(8) + created_at(8) = 124
    const CHECKSUM_OFFSET: usize = 124;

    /// Compute checksum of the superblock (CRC32C)
    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        crc32c::crc32c(&bytes[..Self::CHECKSUM_OFFSET])
    }

    /// Validate superblock consistency against the device size
    pub fn validate(&self, device_size: u64) -> Result<()> {
        if self.zone_size == 0 || self.zone_size % PAGE_SIZE != 0 {
            return Err(Error::corrupt("zone size not page aligned"));
        }
        if self.spare_base > self.zone_total {
            return Err(Error::corrupt("spare watermark past zone count"));
        }
        if self.otab_offset + self.otab_size > self.data_offset {
            return Err(Error::corrupt("object table overlaps data region"));
        }
        if self.data_offset + self.zone_total * u64::from(self.zone_size) > device_size {
            return Err(Error::corrupt("data region exceeds drive size"));
        }
        Ok(())
    }
}

/// One live object's record in the object table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtabEntry {
    /// Object identifier
    pub objid: ObjectId,
    /// First zone of the object's extent
    pub zstart: u64,
    /// Zones in the extent
    pub zcnt: u32,
    /// Bytes written, as of the last lifecycle transition
    pub mblen: u32,
    /// Whether the object has been committed
    pub committed: bool,
}

/// Serialize object table records with a length/crc header
pub fn encode_otab(entries: &[OtabEntry]) -> Result<Vec<u8>> {
    let body = bincode::serialize(entries)
        .map_err(|e| Error::internal(format!("object table encode: {e}")))?;

    let mut buf = Vec::with_capacity(OTAB_HEADER_SIZE + body.len());
    buf.extend_from_slice(&OTAB_MAGIC.to_le_bytes());
    buf.extend_from_slice(&u32::try_from(body.len())
        .map_err(|_| Error::internal("object table too large"))?
        .to_le_bytes());
    buf.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Parse object table records written by [`encode_otab`]
pub fn decode_otab(data: &[u8]) -> Result<Vec<OtabEntry>> {
    if data.len() < OTAB_HEADER_SIZE {
        return Err(Error::corrupt("object table region too small"));
    }

    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if magic != OTAB_MAGIC {
        return Err(Error::corrupt("invalid object table magic"));
    }

    let len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(data[8..12].try_into().unwrap());

    let Some(body) = data.get(OTAB_HEADER_SIZE..OTAB_HEADER_SIZE + len) else {
        return Err(Error::corrupt("object table length exceeds region"));
    };

    if crc32c::crc32c(body) != crc {
        return Err(Error::corrupt("object table checksum mismatch"));
    }

    bincode::deserialize(body).map_err(|e| Error::corrupt(format!("object table decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpool_common::ObjectKind;

    fn test_sb() -> Superblock {
        let cfg = DriveConfig::default();
        Superblock::new(&cfg, Uuid::new_v4(), "mp0", cfg.capacity).unwrap()
    }

    #[test]
    fn test_superblock_roundtrip() {
        let sb = test_sb();
        let bytes = sb.to_bytes();
        assert_eq!(bytes.len() as u64, SUPERBLOCK_SIZE);

        let sb2 = Superblock::from_bytes(&bytes).unwrap();
        assert_eq!(sb.pool_uuid, sb2.pool_uuid);
        assert_eq!(sb2.name(), "mp0");
        assert_eq!(sb.zone_total, sb2.zone_total);
        assert_eq!(sb.data_offset, sb2.data_offset);
        assert_eq!(sb.mclass, sb2.mclass);
    }

    #[test]
    fn test_superblock_geometry() {
        let sb = test_sb();
        sb.validate(DriveConfig::default().capacity).unwrap();

        assert_eq!(sb.data_offset % u64::from(sb.zone_size), 0);
        assert!(sb.spare_base < sb.zone_total);
        assert!(sb.zone_total >= u64::from(sb.mblock_zones));
    }

    #[test]
    fn test_superblock_rejects_corruption() {
        let sb = test_sb();
        let mut bytes = sb.to_bytes().to_vec();

        // Flip a byte inside the checksummed prefix
        bytes[40] ^= 0xff;
        let err = Superblock::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));

        // Bad magic is reported before the checksum
        let mut bytes = sb.to_bytes().to_vec();
        bytes[0] = b'X';
        assert!(Superblock::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_superblock_tiny_drive() {
        let cfg = DriveConfig::default();
        let err = Superblock::new(&cfg, Uuid::new_v4(), "mp0", 8192).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_otab_roundtrip() {
        let entries = vec![
            OtabEntry {
                objid: ObjectId::new(1, ObjectKind::Mblock),
                zstart: 0,
                zcnt: 8,
                mblen: 4096,
                committed: false,
            },
            OtabEntry {
                objid: ObjectId::new(2, ObjectKind::Mblock),
                zstart: 8,
                zcnt: 8,
                mblen: 1 << 20,
                committed: true,
            },
        ];

        let buf = encode_otab(&entries).unwrap();
        let decoded = decode_otab(&buf).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_otab_empty() {
        let buf = encode_otab(&[]).unwrap();
        assert!(decode_otab(&buf).unwrap().is_empty());
    }

    #[test]
    fn test_otab_rejects_corruption() {
        let entries = vec![OtabEntry {
            objid: ObjectId::new(3, ObjectKind::Mblock),
            zstart: 16,
            zcnt: 4,
            mblen: 0,
            committed: false,
        }];

        let mut buf = encode_otab(&entries).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x5a;
        assert!(matches!(decode_otab(&buf), Err(Error::Corrupt(_))));
    }
}
