//! Directory replay: one forward pass over the meta pages written after the authoritative
//! header copy, redoing the bookkeeping the commit path did when it wrote them.

use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::meta::directory::{DirectoryHeader, Structure};
use crate::meta::layout::MetaLayout;
use crate::meta::page::{read_meta, MetaPage, MetaPayload, PageRead};
use crate::meta::writer::MetaCursor;
use crate::meta::{MetaLoc, PageType};
use crate::nand::{Nand, Vbn};
use crate::recovery::scan::LocatedHeader;
use crate::spare::MetaSpare;

#[derive(Debug, Clone)]
pub struct Replayed {
    pub dir: DirectoryHeader,
    pub cursor: MetaCursor,

    /// The first page before the terminal one that failed validation
    pub corrupted: Option<(Vbn, u32)>,

    /// A terminal page that failed validation: a torn write, skipped
    pub torn: Option<u32>,
}

enum Outcome {
    Applied,
    Skipped,
    Bad,
}

/// Replay pages `[header_at + header_pages, committed)` of the current block
pub fn replay<N: Nand>(
    nand: &mut N,
    layout: &MetaLayout,
    located: LocatedHeader,
    cfg: &RecoveryConfig,
) -> Result<Replayed> {
    let LocatedHeader {
        current,
        header_at,
        age,
        committed,
        mut dir,
        ..
    } = located;
    let vbn = layout.meta_vbn(current).unwrap_or(u32::MAX);

    let mut corrupted = None;
    let mut torn = None;
    let mut applied = 0;

    for page in header_at + layout.header_pages..committed {
        let outcome = match read_meta(nand, layout.nand.vpn(vbn, page), cfg.read_retries)? {
            PageRead::Valid(spare, meta) if spare.age == age => {
                apply(layout, &mut dir, MetaLoc::new(current, page), &spare, meta)
            }
            // What remains of an interrupted checkpoint
            PageRead::Valid(spare, _)
                if spare.kind == PageType::Header && spare.age.is_newer_than(age) =>
            {
                Outcome::Skipped
            }
            PageRead::Valid(..) | PageRead::Invalid | PageRead::Unreadable | PageRead::Clean => {
                Outcome::Bad
            }
        };

        match outcome {
            Outcome::Applied => applied += 1,
            Outcome::Skipped => debug!(page, "stale checkpoint page skipped"),
            Outcome::Bad if page + 1 == committed => {
                warn!(vbn, page, "torn terminal meta page skipped");
                torn = Some(page);
            }
            Outcome::Bad => {
                warn!(vbn, page, "corrupted meta page");
                corrupted.get_or_insert((vbn, page));
            }
        }
    }

    info!(current, applied, valid = dir.valid_total(), "directory replayed");
    Ok(Replayed {
        dir,
        cursor: MetaCursor {
            current,
            next_page: committed,
            age,
            header_page: header_at,
        },
        corrupted,
        torn,
    })
}

fn apply(
    layout: &MetaLayout,
    dir: &mut DirectoryHeader,
    loc: MetaLoc,
    spare: &MetaSpare,
    page: MetaPage,
) -> Outcome {
    let g = &layout.geometry;
    match page.payload {
        MetaPayload::Bmt(bmt)
            if bmt.lan < g.lan_count && bmt.entries.len() == g.blocks_per_lan as usize =>
        {
            dir.record(Structure::Bmt(bmt.lan), loc, loc.block);
        }
        MetaPayload::Pmt(groups)
            if !groups.is_empty()
                && groups.first().map(|g| g.dgn) == Some(spare.index)
                && groups.iter().all(|group| group.dgn < g.dgn_count()) =>
        {
            for group in &groups {
                let (min_ec, min_vbn) = group.min_cost();
                dir.record(Structure::Pmt(group.dgn), loc, loc.block);
                dir.set_pmt_cost(group.dgn, min_ec, min_vbn);
            }
        }
        MetaPayload::Context(_) => {
            dir.record(Structure::Context, loc, loc.block);
        }
        _ => return Outcome::Bad,
    }

    dir.apply(&page.side);
    Outcome::Applied
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::log_block::LogGroup;
    use crate::meta::mapping::BlockMapPage;
    use crate::meta::page::SideEffect;
    use crate::nand::{Fault, SimNand};
    use crate::recovery::scan::locate_header;
    use crate::testutil::{test_layout, TEST_NAND};
    use crate::zone::Zone;

    fn no_checkpoints() -> RecoveryConfig {
        RecoveryConfig {
            checkpoint_interval: 0,
            ..Default::default()
        }
    }

    fn reopen(nand: &mut SimNand, layout: &MetaLayout, cfg: &RecoveryConfig) -> Result<Replayed> {
        let located = locate_header(nand, layout, cfg)?;
        replay(nand, layout, located, cfg)
    }

    #[test]
    fn test_replay_matches_commit_path() -> Result<()> {
        for cfg in [no_checkpoints(), RecoveryConfig::default()] {
            let layout = test_layout();
            let mut nand = SimNand::new(TEST_NAND);
            let mut zone = Zone::format(&mut nand, 0, layout.clone(), &cfg)?;
            let groups: Vec<LogGroup> = (0..4).map(LogGroup::new).collect();

            for i in 0..250u32 {
                let mut writer = zone.writer(&mut nand);
                match i % 5 {
                    0 => {
                        let side = SideEffect::WlCost {
                            group: i % 2,
                            min_ec: i,
                            min_vbn: Some(6 + i % 20),
                        };
                        writer.write_bmt(&BlockMapPage::unallocated(i % 2, 8), side)?;
                    }
                    2 => writer.write_groups(&[&groups[(i % 4) as usize]], SideEffect::None)?,
                    _ => {
                        let side = SideEffect::MergeFlag {
                            dgn: i % 4,
                            set: i % 3 == 0,
                        };
                        writer.write_context(side)?;
                    }
                }

                if i % 37 == 0 {
                    let replayed = reopen(&mut nand, &layout, &cfg)?;
                    assert_eq!(replayed.dir, zone.dir);
                    assert_eq!(replayed.cursor, zone.cursor);
                    assert_eq!(
                        replayed.dir.valid_total() as usize,
                        replayed.dir.live_structures().len()
                    );
                    assert_eq!(replayed.corrupted, None);
                    assert_eq!(replayed.torn, None);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_torn_terminal_page() -> Result<()> {
        let layout = test_layout();
        let cfg = no_checkpoints();
        let mut nand = SimNand::new(TEST_NAND);
        let mut zone = Zone::format(&mut nand, 0, layout.clone(), &cfg)?;
        let before = zone.dir.clone();
        zone.writer(&mut nand).write_context(SideEffect::None)?;
        nand.flip_bit(TEST_NAND.vpn(2, 5), 30, 0)?;

        let replayed = reopen(&mut nand, &layout, &cfg)?;
        assert_eq!(replayed.torn, Some(5));
        assert_eq!(replayed.corrupted, None);
        assert_eq!(replayed.dir, before);
        assert_eq!(replayed.cursor.next_page, 6);
        Ok(())
    }

    #[test]
    fn test_corrupted_inner_page() -> Result<()> {
        let layout = test_layout();
        let cfg = no_checkpoints();
        let mut nand = SimNand::new(TEST_NAND);
        let mut zone = Zone::format(&mut nand, 0, layout.clone(), &cfg)?;
        zone.writer(&mut nand).write_context(SideEffect::None)?;

        // The only copy of the BMT of LAN 1
        nand.inject(TEST_NAND.vpn(2, 2), Fault::ReadError);
        let replayed = reopen(&mut nand, &layout, &cfg)?;
        assert_eq!(replayed.corrupted, Some((2, 2)));
        assert_eq!(replayed.torn, None);
        assert_eq!(replayed.dir.location(Structure::Bmt(1)), None);
        assert_eq!(
            replayed.dir.location(Structure::Context),
            Some(MetaLoc::new(0, 5))
        );
        assert_eq!(
            replayed.dir.valid_total() as usize,
            replayed.dir.live_structures().len()
        );
        Ok(())
    }

    #[test]
    fn test_read_error_after_tail_leaves_other_blocks_alone() -> Result<()> {
        let layout = test_layout();
        let cfg = no_checkpoints();
        let mut nand = SimNand::new(TEST_NAND);
        let mut zone = Zone::format(&mut nand, 0, layout.clone(), &cfg)?;

        // Move to block 1, then fill its pages 1..=5
        zone.writer(&mut nand).switch_block()?;
        assert_eq!(zone.cursor.current, 1);
        let mut writer = zone.writer(&mut nand);
        writer.write_bmt(&BlockMapPage::unallocated(0, 8), SideEffect::None)?;
        for _ in 0..4 {
            writer.write_context(SideEffect::None)?;
        }
        assert_eq!(zone.cursor.next_page, 6);
        let valid = zone.dir.valid.clone();

        nand.inject(TEST_NAND.vpn(3, 6), Fault::ReadError);
        let replayed = reopen(&mut nand, &layout, &cfg)?;
        assert_eq!(replayed.cursor.current, 1);
        assert_eq!(replayed.cursor.next_page, 6);
        assert_eq!(replayed.dir.valid[0], valid[0]);
        assert_eq!(replayed.dir.valid[2], valid[2]);
        assert_eq!(replayed.dir, zone.dir);
        Ok(())
    }
}
