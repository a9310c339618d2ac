use std::fmt;

use crate::error::{Result, Stage2Error};
use crate::protocol::constants::*;

/// Storage area addressed by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageRegion {
    /// Boot partition 1, holds the preloader.
    Boot1,
    Boot2,
    UserData,
    Rpmb,
}

impl StorageRegion {
    pub fn sector_size(&self) -> usize {
        match self {
            StorageRegion::Rpmb => RPMB_SECTOR_SIZE,
            _ => EMMC_SECTOR_SIZE,
        }
    }

    /// Value sent with `CMD_SELECT_PARTITION`.
    pub fn selector(&self) -> u32 {
        match self {
            StorageRegion::UserData => PART_USER,
            StorageRegion::Boot1 => PART_BOOT1,
            StorageRegion::Boot2 => PART_BOOT2,
            StorageRegion::Rpmb => PART_RPMB,
        }
    }

    /// Sectors covering the byte range `[offset, offset + length)`.
    pub fn sector_range(&self, offset: u64, length: u64) -> Result<SectorRange> {
        let end = offset.checked_add(length).ok_or_else(|| {
            Stage2Error::BadArgument(format!(
                "range 0x{:X}+0x{:X} overflows",
                offset, length
            ))
        })?;
        let size = self.sector_size() as u64;
        let start = offset / size;
        let end = end.div_ceil(size);
        let max = match self {
            StorageRegion::Rpmb => u16::MAX as u64 + 1,
            _ => u32::MAX as u64 + 1,
        };
        if end > max {
            return Err(Stage2Error::BadArgument(format!(
                "{} sector {} out of range",
                self,
                end - 1
            )));
        }
        Ok(SectorRange {
            start: start as u32,
            end: end as u32,
            sector_size: self.sector_size(),
        })
    }
}

impl fmt::Display for StorageRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageRegion::Boot1 => write!(f, "boot1"),
            StorageRegion::Boot2 => write!(f, "boot2"),
            StorageRegion::UserData => write!(f, "user"),
            StorageRegion::Rpmb => write!(f, "rpmb"),
        }
    }
}

/// Half-open range of sector indices `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRange {
    pub start: u32,
    pub end: u32,
    pub sector_size: usize,
}

impl SectorRange {
    pub fn count(&self) -> u64 {
        (self.end - self.start) as u64
    }

    /// Byte offset of the first sector.
    pub fn byte_start(&self) -> u64 {
        self.start as u64 * self.sector_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_range_partial_tail() {
        let r = StorageRegion::Boot1.sector_range(0, 0x201).unwrap();
        assert_eq!((r.start, r.end), (0, 2));
        assert_eq!(r.count(), 2);
    }

    #[test]
    fn test_sector_range_unaligned_start() {
        let r = StorageRegion::UserData.sector_range(0x3FF, 2).unwrap();
        assert_eq!((r.start, r.end), (1, 3));
        assert_eq!(r.byte_start(), 0x200);
    }

    #[test]
    fn test_rpmb_range_uses_256_byte_sectors() {
        let r = StorageRegion::Rpmb.sector_range(0x100, 0x100).unwrap();
        assert_eq!((r.start, r.end), (1, 2));
    }

    #[test]
    fn test_rpmb_index_limit() {
        assert!(StorageRegion::Rpmb.sector_range(0, 0x100 * 0x10000).is_ok());
        assert!(StorageRegion::Rpmb.sector_range(0, 0x100 * 0x10000 + 1).is_err());
    }
}
