//! Loading the block mapping tables and log group snapshots the directory points at.

use tracing::{debug, warn};

use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::log_block::LogGroup;
use crate::meta::directory::{DirectoryHeader, Structure};
use crate::meta::layout::MetaLayout;
use crate::meta::mapping::{BlockMapPage, MappingCache};
use crate::meta::page::MetaPayload;
use crate::meta::{read_meta_page, PageType};
use crate::nand::{Nand, Vbn};

/// The result of loading a structure that may be damaged on flash
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Loaded<T> {
    Found(T),
    Corrupted { vbn: Vbn, page: u32 },
}

fn location(layout: &MetaLayout, dir: &DirectoryHeader, structure: Structure) -> (Vbn, u32) {
    dir.location(structure).map_or((u32::MAX, 0), |loc| {
        let vbn = layout.meta_vbn(loc.block).unwrap_or(u32::MAX);
        (vbn, u32::from(loc.page))
    })
}

/// Load the block mapping table of every LAN
///
/// A LAN whose table cannot be read is loaded as entirely unallocated, and the first such table
/// is reported alongside the cache.
pub fn load_all<N: Nand>(
    nand: &mut N,
    layout: &MetaLayout,
    dir: &DirectoryHeader,
    cfg: &RecoveryConfig,
) -> Result<(MappingCache, Option<(Vbn, u32)>)> {
    let g = &layout.geometry;
    let rpt = howudoin::new()
        .label("Loading block mapping")
        .set_len(u64::from(g.lan_count));

    let mut cache = MappingCache::default();
    let mut corrupted = None;
    for lan in 0..g.lan_count {
        let page = match load_bmt(nand, layout, dir, lan, cfg)? {
            Loaded::Found(page) => page,
            Loaded::Corrupted { vbn, page } => {
                warn!(lan, vbn, page, "block mapping table unreadable");
                corrupted.get_or_insert((vbn, page));
                BlockMapPage::unallocated(lan, g.blocks_per_lan)
            }
        };
        cache.pages.push(page);
        rpt.inc();
    }

    rpt.close();
    debug!(mapped = cache.mapped_blocks().count(), "block mapping loaded");
    Ok((cache, corrupted))
}

fn load_bmt<N: Nand>(
    nand: &mut N,
    layout: &MetaLayout,
    dir: &DirectoryHeader,
    lan: u32,
    cfg: &RecoveryConfig,
) -> Result<Loaded<BlockMapPage>> {
    let structure = Structure::Bmt(lan);
    let Some(loc) = dir.location(structure) else {
        let (vbn, page) = location(layout, dir, structure);
        return Ok(Loaded::Corrupted { vbn, page });
    };

    if let Some((_, page)) = read_meta_page(nand, layout, loc, PageType::Bmt, cfg)? {
        if let MetaPayload::Bmt(bmt) = page.payload {
            let in_data = bmt
                .entries
                .iter()
                .filter_map(|e| e.vbn)
                .all(|vbn| layout.is_data_block(vbn));
            if bmt.lan == lan && in_data {
                return Ok(Loaded::Found(bmt));
            }
        }
    }

    let (vbn, page) = location(layout, dir, structure);
    Ok(Loaded::Corrupted { vbn, page })
}

/// Load the snapshot of the log group `dgn`
///
/// A group that was never written is empty.
pub fn load_group<N: Nand>(
    nand: &mut N,
    layout: &MetaLayout,
    dir: &DirectoryHeader,
    dgn: u32,
    cfg: &RecoveryConfig,
) -> Result<Loaded<LogGroup>> {
    let structure = Structure::Pmt(dgn);
    let Some(loc) = dir.location(structure) else {
        return Ok(Loaded::Found(LogGroup::new(dgn)));
    };

    if let Some((_, page)) = read_meta_page(nand, layout, loc, PageType::Pmt, cfg)? {
        if let MetaPayload::Pmt(groups) = page.payload {
            if let Some(group) = groups.into_iter().find(|g| g.dgn == dgn) {
                return Ok(Loaded::Found(group));
            }
        }
    }

    let (vbn, page) = location(layout, dir, structure);
    warn!(dgn, vbn, page, "log group snapshot unreadable");
    Ok(Loaded::Corrupted { vbn, page })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::log_block::LogBlock;
    use crate::meta::mapping::BlockMapEntry;
    use crate::meta::page::SideEffect;
    use crate::nand::{Fault, SimNand};
    use crate::testutil::{test_layout, TEST_NAND};
    use crate::zone::Zone;

    #[test]
    fn test_load_all() -> Result<()> {
        let layout = test_layout();
        let cfg = RecoveryConfig::default();
        let mut nand = SimNand::new(TEST_NAND);
        let mut zone = Zone::format(&mut nand, 0, layout.clone(), &cfg)?;

        let mut bmt = BlockMapPage::unallocated(1, 8);
        bmt.entries[3] = BlockMapEntry {
            vbn: Some(40),
            ec_hint: 2,
        };
        zone.writer(&mut nand).write_bmt(&bmt, SideEffect::None)?;

        let (cache, corrupted) = load_all(&mut nand, &layout, &zone.dir, &cfg)?;
        assert_eq!(corrupted, None);
        assert_eq!(cache.pages.len(), 2);
        assert_eq!(cache.lookup(11).and_then(|e| e.vbn), Some(40));
        assert_eq!(cache.mapped_blocks().collect::<Vec<_>>(), [40]);

        // A damaged table degrades to unallocated
        let loc = zone.dir.location(Structure::Bmt(1)).unwrap();
        nand.inject(layout.meta_vpn(loc).unwrap(), Fault::ReadError);
        let (cache, corrupted) = load_all(&mut nand, &layout, &zone.dir, &cfg)?;
        assert_eq!(corrupted, Some((2, u32::from(loc.page))));
        assert_eq!(cache.lookup(11), Some(&BlockMapEntry::UNALLOCATED));
        Ok(())
    }

    #[test]
    fn test_load_group() -> Result<()> {
        let layout = test_layout();
        let cfg = RecoveryConfig::default();
        let mut nand = SimNand::new(TEST_NAND);
        let mut zone = Zone::format(&mut nand, 0, layout.clone(), &cfg)?;

        let mut group = LogGroup::new(2);
        let mut log = LogBlock::new(30, 3);
        log.record(0, 17);
        log.committed = 1;
        group.logs.push(log);
        zone.writer(&mut nand).write_groups(&[&group], SideEffect::None)?;

        assert_eq!(
            load_group(&mut nand, &layout, &zone.dir, 2, &cfg)?,
            Loaded::Found(group)
        );
        assert_eq!(
            load_group(&mut nand, &layout, &zone.dir, 1, &cfg)?,
            Loaded::Found(LogGroup::new(1))
        );

        zone.dir.pmt[3].loc = None;
        assert_eq!(
            load_group(&mut nand, &layout, &zone.dir, 3, &cfg)?,
            Loaded::Found(LogGroup::new(3))
        );
        Ok(())
    }
}
