//! Block mapping tables: one page per LAN, mapping each logical block to its data block.

use bytes::BufMut;

use crate::nand::Vbn;
use crate::util::{opt_u32, BufExt, NONE_U32};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockMapEntry {
    /// The data block holding this logical block, if one was ever allocated
    pub vbn: Option<Vbn>,

    /// Erase count of `vbn` when it was mapped
    pub ec_hint: u32,
}

impl BlockMapEntry {
    pub const UNALLOCATED: BlockMapEntry = BlockMapEntry {
        vbn: None,
        ec_hint: 0,
    };
}

/// The block mapping table of one LAN
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BlockMapPage {
    pub lan: u32,
    pub entries: Vec<BlockMapEntry>,
}

impl BlockMapPage {
    pub fn unallocated(lan: u32, blocks_per_lan: u32) -> Self {
        Self {
            lan,
            entries: vec![BlockMapEntry::UNALLOCATED; blocks_per_lan as usize],
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        for entry in &self.entries {
            buf.put_u32_le(entry.vbn.unwrap_or(NONE_U32));
            buf.put_u32_le(entry.ec_hint);
        }
    }

    pub fn decode(buf: &mut &[u8], lan: u32, count: usize) -> Option<Self> {
        let entries = (0..count)
            .map(|_| {
                Some(BlockMapEntry {
                    vbn: opt_u32(buf.try_u32_le()?),
                    ec_hint: buf.try_u32_le()?,
                })
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Self { lan, entries })
    }
}

/// Every block mapping table of a zone, held in RAM
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct MappingCache {
    pub pages: Vec<BlockMapPage>,
}

impl MappingCache {
    pub fn blocks_per_lan(&self) -> u32 {
        self.pages.first().map_or(0, |p| p.entries.len() as u32)
    }

    /// Look up a zone-relative logical block
    pub fn lookup(&self, lbn: u32) -> Option<&BlockMapEntry> {
        let per_lan = self.blocks_per_lan();
        if per_lan == 0 {
            return None;
        }
        self.pages
            .get((lbn / per_lan) as usize)?
            .entries
            .get((lbn % per_lan) as usize)
    }

    /// Every data block the mapping refers to
    pub fn mapped_blocks(&self) -> impl Iterator<Item = Vbn> + '_ {
        self.pages
            .iter()
            .flat_map(|p| p.entries.iter())
            .filter_map(|e| e.vbn)
    }
}

#[test]
fn test_mapping_cache() {
    let mut first = BlockMapPage::unallocated(0, 4);
    first.entries[2] = BlockMapEntry {
        vbn: Some(40),
        ec_hint: 3,
    };
    let mut second = BlockMapPage::unallocated(1, 4);
    second.entries[0] = BlockMapEntry {
        vbn: Some(41),
        ec_hint: 0,
    };

    let mut buf = Vec::new();
    second.encode(&mut buf);
    assert_eq!(BlockMapPage::decode(&mut &buf[..], 1, 4).as_ref(), Some(&second));
    assert_eq!(BlockMapPage::decode(&mut &buf[..8], 1, 4), None);

    let cache = MappingCache {
        pages: vec![first, second],
    };
    assert_eq!(cache.lookup(2).and_then(|e| e.vbn), Some(40));
    assert_eq!(cache.lookup(4).and_then(|e| e.vbn), Some(41));
    assert_eq!(cache.lookup(5).and_then(|e| e.vbn), None);
    assert!(cache.lookup(8).is_none());
    assert_eq!(cache.mapped_blocks().collect::<Vec<_>>(), [40, 41]);
}
