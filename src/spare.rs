//! This module contains the code necessary to read and write the spare (out-of-band) area of meta
//! pages and data pages, with redundancy, ZBC and CRC verification/computation.
//!
//! Every field is stored as a (value, complement) pair, so erased flash, torn programs and
//! foreign data are all rejected without trusting the page content.

use bytes::BufMut;
pub use deku::{DekuContainerRead, DekuContainerWrite};
use deku::{DekuRead, DekuUpdate, DekuWrite};

use crate::bitmap::{SectorBitmap, SECTOR_SIZE};
use crate::error::{FtlError, Result};
use crate::integrity::{crc32, zero_bits, Redundant};
use crate::meta::{Age, PageType};
use crate::util::BufExt;

/// Raw layout of a meta page's spare area
#[derive(Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct RawMetaSpare {
    age: u32,
    age_inv: u32,
    tag: u32,
    tag_inv: u32,
    zbc: u32,
    zbc_inv: u32,
}

/// The fields of a meta page's spare area, after redundancy checks
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MetaSpare {
    pub age: Age,
    pub kind: PageType,

    /// Structure index: LAN for mapping pages, header part for header pages
    pub index: u32,

    /// Zero-bit count of the page's data area
    pub zbc: u32,
}

impl MetaSpare {
    pub const SIZE: usize = 24;

    /// Largest index that fits in a tag
    pub const MAX_INDEX: u32 = 0x00FF_FFFF;

    /// Describe the page about to be written with `data`
    pub fn for_page(age: Age, kind: PageType, index: u32, data: &[u8]) -> Self {
        Self {
            age,
            kind,
            index,
            zbc: zero_bits(data),
        }
    }

    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, raw) = RawMetaSpare::from_bytes((bytes, 0)).ok()?;

        let age = Redundant {
            value: raw.age,
            inverse: raw.age_inv,
        }
        .get()?;
        let tag = Redundant {
            value: raw.tag,
            inverse: raw.tag_inv,
        }
        .get()?;
        let zbc = Redundant {
            value: raw.zbc,
            inverse: raw.zbc_inv,
        }
        .get()?;

        Some(Self {
            age: Age::from_u32(age),
            kind: PageType::try_from((tag >> 24) as u8).ok()?,
            index: tag & Self::MAX_INDEX,
            zbc,
        })
    }

    /// Write into a byte slice, filling the unused remainder with 0xFF
    pub fn encode(self, out_bytes: &mut [u8]) -> Result<()> {
        let tag = (u32::from(u8::from(self.kind)) << 24) | (self.index & Self::MAX_INDEX);
        let raw = RawMetaSpare {
            age: self.age.to_u32(),
            age_inv: !self.age.to_u32(),
            tag,
            tag_inv: !tag,
            zbc: self.zbc,
            zbc_inv: !self.zbc,
        };
        let bytes = raw.to_bytes()?;
        let (head, rest) = split_spare(out_bytes, bytes.len())?;
        head.copy_from_slice(&bytes);
        rest.fill(0xFF);
        Ok(())
    }

    /// Does `data` match the checksum recorded for it?
    pub fn matches(&self, data: &[u8]) -> bool {
        zero_bits(data) == self.zbc
    }
}

/// Raw layout of the fixed part of a data page's spare area; per-sector CRCs follow it
#[derive(Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct RawDataSpare {
    lpn: u32,
    lpn_inv: u32,
    mark: u32,
    mark_inv: u32,
}

const DATA_MARK_MAGIC: u32 = 0xDA7A;
const DATA_FLAG_CONFIRM: u32 = 1;

/// The fields of a data page's spare area, after redundancy checks
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataSpare {
    /// Logical page: relative to its data group in log blocks, zone-wide in the buffer block
    pub lpn: u32,

    /// Sectors of the page holding data
    pub sectors: SectorBitmap,

    /// Does this page complete a transaction?
    pub confirm: bool,

    /// CRC32 of every sector of the data area
    pub crcs: Vec<u32>,
}

/// What a data page's spare area says about the page
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SpareValidity {
    /// A redundant field is broken, or a confirmation CRC does not match
    Corrupted,

    /// A valid page completing a transaction; every CRC matches
    Confirmed(DataSpare),

    /// A valid page inside a transaction
    Plain(DataSpare),
}

impl SpareValidity {
    /// Check a data page
    pub fn of(data: &[u8], spare: &[u8], sectors_per_page: usize) -> Self {
        let Some(decoded) = DataSpare::decode(spare, sectors_per_page) else {
            return Self::Corrupted;
        };

        if !decoded.confirm {
            return Self::Plain(decoded);
        }

        let crcs_match = data
            .chunks(SECTOR_SIZE)
            .zip(&decoded.crcs)
            .all(|(sector, &crc)| crc32(sector) == crc);

        if crcs_match {
            Self::Confirmed(decoded)
        } else {
            Self::Corrupted
        }
    }

    pub fn spare(&self) -> Option<&DataSpare> {
        match self {
            Self::Corrupted => None,
            Self::Confirmed(spare) | Self::Plain(spare) => Some(spare),
        }
    }
}

impl DataSpare {
    /// Describe the page about to be written with `data`
    pub fn new(lpn: u32, sectors: SectorBitmap, confirm: bool, data: &[u8]) -> Self {
        let crcs = data.chunks(SECTOR_SIZE).map(crc32).collect();
        Self {
            lpn,
            sectors,
            confirm,
            crcs,
        }
    }

    /// Bytes of spare area needed for pages of `sectors_per_page` sectors
    pub fn size(sectors_per_page: usize) -> usize {
        16 + 4 * sectors_per_page
    }

    /// Convert from a byte slice
    pub fn decode(bytes: &[u8], sectors_per_page: usize) -> Option<Self> {
        let (_, raw) = RawDataSpare::from_bytes((bytes, 0)).ok()?;
        let lpn = Redundant {
            value: raw.lpn,
            inverse: raw.lpn_inv,
        }
        .get()?;
        let mark = Redundant {
            value: raw.mark,
            inverse: raw.mark_inv,
        }
        .get()?;

        if mark >> 16 != DATA_MARK_MAGIC {
            return None;
        }
        let sectors = SectorBitmap((mark >> 8) as u8);
        if sectors.is_empty() || !sectors.fits(sectors_per_page) {
            return None;
        }

        let mut rest = bytes.get(16..)?;
        let crcs = (0..sectors_per_page)
            .map(|_| rest.try_u32_le())
            .collect::<Option<Vec<_>>>()?;

        Some(Self {
            lpn,
            sectors,
            confirm: mark & DATA_FLAG_CONFIRM != 0,
            crcs,
        })
    }

    /// Write into a byte slice, filling the unused remainder with 0xFF
    pub fn encode(&self, out_bytes: &mut [u8]) -> Result<()> {
        let mark = (DATA_MARK_MAGIC << 16)
            | (u32::from(self.sectors.0) << 8)
            | if self.confirm { DATA_FLAG_CONFIRM } else { 0 };
        let raw = RawDataSpare {
            lpn: self.lpn,
            lpn_inv: !self.lpn,
            mark,
            mark_inv: !mark,
        };

        let mut bytes = raw.to_bytes()?;
        for &crc in &self.crcs {
            bytes.put_u32_le(crc);
        }

        let (head, rest) = split_spare(out_bytes, bytes.len())?;
        head.copy_from_slice(&bytes);
        rest.fill(0xFF);
        Ok(())
    }
}

fn split_spare(out_bytes: &mut [u8], len: usize) -> Result<(&mut [u8], &mut [u8])> {
    if out_bytes.len() < len {
        return Err(FtlError::Geometry(format!(
            "spare area of {} bytes cannot hold {len} bytes",
            out_bytes.len()
        )));
    }
    Ok(out_bytes.split_at_mut(len))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_meta_spare() -> Result<()> {
        let data = vec![0x5Au8; 2048];
        let spare = MetaSpare::for_page(Age::new(10, 3), PageType::Bmt, 7, &data);

        let mut buf = vec![0u8; 64];
        spare.encode(&mut buf)?;
        assert!(buf[MetaSpare::SIZE..].iter().all(|&b| b == 0xFF));
        assert_eq!(MetaSpare::decode(&buf), Some(spare));
        assert!(spare.matches(&data));

        // Any broken pair is rejected
        for byte in 0..MetaSpare::SIZE {
            let mut broken = buf.clone();
            broken[byte] ^= 0x10;
            assert_eq!(MetaSpare::decode(&broken), None, "byte {byte}");
        }

        // Erased spare is rejected
        assert_eq!(MetaSpare::decode(&[0xFF; 64]), None);
        Ok(())
    }

    #[test]
    fn test_meta_spare_too_small() {
        let spare = MetaSpare::for_page(Age::INITIAL, PageType::Root, 0, &[]);
        assert!(spare.encode(&mut [0u8; 8]).is_err());
    }

    #[test]
    fn test_data_spare_validity() -> Result<()> {
        let data: Vec<u8> = (0..2048u32).map(|i| (i * 7) as u8).collect();
        let mut spare = vec![0u8; 64];

        let plain = DataSpare::new(42, SectorBitmap::full(4), false, &data);
        plain.encode(&mut spare)?;
        assert_eq!(SpareValidity::of(&data, &spare, 4), SpareValidity::Plain(plain));

        let confirm = DataSpare::new(43, SectorBitmap::full(4), true, &data);
        confirm.encode(&mut spare)?;
        assert_eq!(
            SpareValidity::of(&data, &spare, 4),
            SpareValidity::Confirmed(confirm)
        );

        // A CRC mismatch on a confirmation page is corruption
        let mut torn = data.clone();
        torn[1500] ^= 0x80;
        assert_eq!(SpareValidity::of(&torn, &spare, 4), SpareValidity::Corrupted);

        // A broken redundant pair is corruption
        let mut broken = spare.clone();
        broken[2] ^= 1;
        assert_eq!(SpareValidity::of(&data, &broken, 4), SpareValidity::Corrupted);

        assert_eq!(SpareValidity::of(&data, &[0xFF; 64], 4), SpareValidity::Corrupted);
        Ok(())
    }

    #[test]
    fn test_data_spare_bitmap_bounds() -> Result<()> {
        let data = vec![0u8; 2048];
        let mut spare = vec![0u8; 64];
        let partial = DataSpare::new(1, SectorBitmap(0b0110), true, &data);
        partial.encode(&mut spare)?;
        assert_eq!(DataSpare::decode(&spare, 4), Some(partial));

        let outside = DataSpare::new(1, SectorBitmap(0b1_0000), true, &data);
        outside.encode(&mut spare)?;
        assert_eq!(DataSpare::decode(&spare, 4), None);
        Ok(())
    }
}
