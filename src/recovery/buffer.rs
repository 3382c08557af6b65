//! Rebuilding the index of the buffer block absorbing sub-page writes.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::bitmap::{SectorBitmap, MAX_SECTORS};
use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::meta::context::{BufferBlock, BufferState};
use crate::meta::layout::MetaLayout;
use crate::nand::Nand;
use crate::recovery::{classify_data_page, DataPage};

/// Where the newest copy of each sector of a logical page lives in the buffer block
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct BufferEntry {
    pub sectors: SectorBitmap,
    pages: [Option<u32>; MAX_SECTORS],
}

impl BufferEntry {
    /// Buffer page holding the newest copy of `sector`
    pub fn page_of(&self, sector: usize) -> Option<u32> {
        self.pages.get(sector).copied().flatten()
    }
}

/// Zone-wide LPN -> buffered sectors
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct BufferIndex {
    entries: BTreeMap<u32, BufferEntry>,
}

impl BufferIndex {
    /// Buffer page `page` holds `sectors` of `lpn`; later pages win
    pub fn insert(&mut self, lpn: u32, page: u32, sectors: SectorBitmap) {
        let entry = self.entries.entry(lpn).or_default();
        for sector in sectors.sectors() {
            let slot = &mut entry.pages[sector];
            if slot.map_or(true, |p| p <= page) {
                *slot = Some(page);
            }
        }
        entry.sectors = entry.sectors.union(sectors);
    }

    pub fn get(&self, lpn: u32) -> Option<&BufferEntry> {
        self.entries.get(&lpn)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lpns(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }
}

/// Scan the buffer block, rebuilding its index and bringing `buffer`'s committed offset and
/// state up to date
pub fn recover<N: Nand>(
    nand: &mut N,
    layout: &MetaLayout,
    buffer: &mut BufferBlock,
    cfg: &RecoveryConfig,
) -> Result<BufferIndex> {
    let ppb = layout.nand.pages_per_block;
    let sectors_per_page = layout.nand.sectors_per_page();

    let mut index = BufferIndex::default();
    let mut last_programmed = None;
    let mut last_valid = None;
    let mut first_bad = None;
    for page in 0..ppb {
        let valid = match classify_data_page(nand, buffer.vbn, page, cfg)? {
            DataPage::Clean => continue,
            DataPage::Valid { spare, .. }
                if spare.lpn < layout.zone_pages()
                    && !spare.sectors.is_empty()
                    && spare.sectors.fits(sectors_per_page) =>
            {
                index.insert(spare.lpn, page, spare.sectors);
                true
            }
            _ => false,
        };

        last_programmed = Some(page);
        if valid {
            last_valid = Some(page);
        } else {
            first_bad.get_or_insert(page);
        }
    }

    buffer.committed = buffer.committed.max(last_programmed.map_or(0, |p| p + 1));
    let dirty = matches!((first_bad, last_valid), (Some(bad), Some(valid)) if bad < valid);
    buffer.state = if dirty || buffer.state == BufferState::Dirty {
        if let Some(page) = first_bad {
            warn!(vbn = buffer.vbn, page, "corrupted page inside buffer block");
        }
        BufferState::Dirty
    } else if buffer.committed >= ppb {
        BufferState::Full
    } else if buffer.committed > 0 {
        BufferState::Filling
    } else {
        BufferState::Empty
    };

    debug!(
        vbn = buffer.vbn,
        committed = buffer.committed,
        state = ?buffer.state,
        lpns = index.len(),
        "buffer block recovered"
    );
    Ok(index)
}
