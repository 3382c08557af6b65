//! On-flash meta structures: the directory header, context snapshots, mapping tables and root
//! info, plus the page codec and the commit path that appends them to meta blocks.

pub mod context;
pub mod directory;
pub mod layout;
pub mod mapping;
pub mod page;
pub mod root;
pub mod writer;

use std::fmt;

use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::nand::Nand;
use crate::spare::MetaSpare;
use crate::util::{opt_u32, NONE_U32};

use layout::MetaLayout;
use page::{read_meta, MetaPage, PageRead};

/// The age of a meta page. Lower is newer.
///
/// `high` is decremented whenever a new meta block becomes current (and wraps, so it is
/// compared with serial-number arithmetic); `low` is decremented for every header checkpoint
/// written within a block.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Age {
    pub high: u16,
    pub low: u16,
}

impl Age {
    /// Age of the first header ever written
    pub const INITIAL: Age = Age {
        high: 0xFFFF,
        low: 0xFFFF,
    };

    pub fn new(high: u16, low: u16) -> Self {
        Self { high, low }
    }

    pub fn from_u32(raw: u32) -> Self {
        Self {
            high: (raw >> 16) as u16,
            low: raw as u16,
        }
    }

    pub fn to_u32(self) -> u32 {
        (u32::from(self.high) << 16) | u32::from(self.low)
    }

    /// Age of the header opening the next meta block
    pub fn next_block(self) -> Self {
        Self {
            high: self.high.wrapping_sub(1),
            low: 0xFFFF,
        }
    }

    /// Age of the next header checkpoint within the same meta block
    pub fn next_header(self) -> Self {
        Self {
            high: self.high,
            low: self.low.wrapping_sub(1),
        }
    }

    pub fn is_newer_than(self, other: Self) -> bool {
        if self.high != other.high {
            other.high.wrapping_sub(self.high) as i16 > 0
        } else {
            self.low < other.low
        }
    }
}

impl fmt::Debug for Age {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Age({}, {})", self.high, self.low)
    }
}

/// Location of a meta page: an index into the zone's meta block list, and a page within it
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MetaLoc {
    pub block: u16,
    pub page: u16,
}

impl MetaLoc {
    pub fn new(block: u16, page: u32) -> Self {
        Self {
            block,
            page: page as u16,
        }
    }

    pub fn encode(loc: Option<Self>) -> u32 {
        loc.map_or(NONE_U32, |l| (u32::from(l.block) << 16) | u32::from(l.page))
    }

    pub fn decode(raw: u32) -> Option<Self> {
        opt_u32(raw).map(|raw| Self {
            block: (raw >> 16) as u16,
            page: raw as u16,
        })
    }
}

/// The type tag carried in every meta page's spare area
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PageType {
    Root,
    Header,
    Bmt,
    Pmt,
    Context,
}

impl PageType {
    pub fn name(self) -> &'static str {
        match self {
            PageType::Root => "root info",
            PageType::Header => "directory header",
            PageType::Bmt => "block mapping table",
            PageType::Pmt => "page mapping table",
            PageType::Context => "context snapshot",
        }
    }
}

impl From<PageType> for u8 {
    fn from(value: PageType) -> Self {
        match value {
            PageType::Root => 1,
            PageType::Header => 2,
            PageType::Bmt => 3,
            PageType::Pmt => 4,
            PageType::Context => 5,
        }
    }
}

impl TryFrom<u8> for PageType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, ()> {
        match value {
            1 => Ok(PageType::Root),
            2 => Ok(PageType::Header),
            3 => Ok(PageType::Bmt),
            4 => Ok(PageType::Pmt),
            5 => Ok(PageType::Context),
            _ => Err(()),
        }
    }
}

/// Read the meta page at `loc`, if it is a valid page of type `expect`
///
/// Invalid, unreadable and clean pages all come back as `None`; only device failures are
/// errors.
pub fn read_meta_page<N: Nand>(
    nand: &mut N,
    layout: &MetaLayout,
    loc: MetaLoc,
    expect: PageType,
    cfg: &RecoveryConfig,
) -> Result<Option<(MetaSpare, MetaPage)>> {
    let Some(vpn) = layout.meta_vpn(loc) else {
        return Ok(None);
    };

    match read_meta(nand, vpn, cfg.read_retries)? {
        PageRead::Valid(spare, page) if spare.kind == expect => Ok(Some((spare, page))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_age_ordering() {
        // Lower is newer
        assert!(Age::new(10, 2).is_newer_than(Age::new(10, 3)));
        assert!(!Age::new(10, 3).is_newer_than(Age::new(10, 2)));
        assert!(Age::new(9, 0xFFFF).is_newer_than(Age::new(10, 0)));
        assert!(!Age::new(10, 2).is_newer_than(Age::new(10, 2)));

        // Ages wrap
        assert!(Age::new(0xFFFF, 0xFFFF).is_newer_than(Age::new(0, 5)));
        assert_eq!(Age::new(0, 5).next_block(), Age::new(0xFFFF, 0xFFFF));

        let first = Age::INITIAL;
        let second = first.next_block();
        let checkpoint = second.next_header();
        assert!(second.is_newer_than(first));
        assert!(checkpoint.is_newer_than(second));
        assert_eq!(Age::from_u32(checkpoint.to_u32()), checkpoint);
    }

    #[test]
    fn test_meta_loc() {
        let loc = MetaLoc::new(3, 17);
        assert_eq!(MetaLoc::decode(MetaLoc::encode(Some(loc))), Some(loc));
        assert_eq!(MetaLoc::decode(MetaLoc::encode(None)), None);
    }

    #[test]
    fn test_page_type() {
        for kind in [
            PageType::Root,
            PageType::Header,
            PageType::Bmt,
            PageType::Pmt,
            PageType::Context,
        ] {
            assert_eq!(PageType::try_from(u8::from(kind)), Ok(kind));
        }
        assert!(PageType::try_from(0).is_err());
        assert!(PageType::try_from(0xFF).is_err());
    }
}
