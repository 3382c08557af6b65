//! Sector bitmaps and shift arithmetic for the logical address space.

use std::fmt;

/// Size of a host sector; CRCs in data spares are computed per sector
pub const SECTOR_SIZE: usize = 512;

/// Largest number of sectors per page a [SectorBitmap] can describe
pub const MAX_SECTORS: usize = 8;

/// Derive the shift that replaces multiplication/division by `value`, if it is a power of two
pub fn log2_shift(value: u32) -> Option<u32> {
    value.is_power_of_two().then(|| value.trailing_zeros())
}

/// Which sectors of a page hold data
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct SectorBitmap(pub u8);

impl SectorBitmap {
    /// Bitmap with sectors `first..first + count` set
    ///
    /// Returns None if the range does not fit within `sectors_per_page`.
    pub fn range(first: usize, count: usize, sectors_per_page: usize) -> Option<Self> {
        let end = first.checked_add(count)?;
        if end > sectors_per_page || sectors_per_page > MAX_SECTORS {
            return None;
        }
        let bits = (first..end).fold(0u8, |acc, s| acc | (1 << s));
        Some(Self(bits))
    }

    /// Every sector of a page
    pub fn full(sectors_per_page: usize) -> Self {
        Self::range(0, sectors_per_page.min(MAX_SECTORS), sectors_per_page.min(MAX_SECTORS))
            .unwrap_or_default()
    }

    pub fn contains(self, sector: usize) -> bool {
        sector < MAX_SECTORS && self.0 & (1 << sector) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Does every set bit lie below `sectors_per_page`?
    pub fn fits(self, sectors_per_page: usize) -> bool {
        sectors_per_page >= MAX_SECTORS || self.0 >> sectors_per_page == 0
    }

    /// Iterate the indices of set sectors
    pub fn sectors(self) -> impl Iterator<Item = usize> {
        (0..MAX_SECTORS).filter(move |&s| self.contains(s))
    }
}

impl fmt::Debug for SectorBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorBitmap({:08b})", self.0)
    }
}

#[test]
fn test_log2_shift() {
    assert_eq!(log2_shift(1), Some(0));
    assert_eq!(log2_shift(512), Some(9));
    assert_eq!(log2_shift(0), None);
    assert_eq!(log2_shift(48), None);
}

#[test]
fn test_sector_bitmap() {
    let map = SectorBitmap::range(1, 2, 4).unwrap();
    assert_eq!(map.0, 0b0110);
    assert!(map.contains(1) && map.contains(2) && !map.contains(0));
    assert_eq!(map.sectors().collect::<Vec<_>>(), [1, 2]);
    assert_eq!(map.count(), 2);

    assert!(SectorBitmap::range(3, 2, 4).is_none());
    assert_eq!(SectorBitmap::full(4).0, 0b1111);
    assert_eq!(SectorBitmap::full(8).0, 0xFF);

    assert!(SectorBitmap(0b1000).fits(4));
    assert!(!SectorBitmap(0b1_0000).fits(4));
    assert_eq!(map.union(SectorBitmap(1)).0, 0b0111);
}
