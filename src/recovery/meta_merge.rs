//! Finishing a meta block reclaim that was interrupted by power loss.

use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::meta::context::ContextSnapshot;
use crate::meta::directory::DirectoryHeader;
use crate::meta::layout::MetaLayout;
use crate::meta::writer::{MetaCursor, MetaWriter};
use crate::nand::Nand;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MetaMergeOutcome {
    /// No reclaim was in flight
    NotDue,

    /// The reclaim of this block was finished
    Resumed(u16),

    /// The record named a block that cannot be reclaimed; it was cleared
    Dropped(u16),
}

/// Finish the reclaim recorded in `ctx`, the latest context snapshot
pub fn recover<N: Nand>(
    nand: &mut N,
    layout: &MetaLayout,
    dir: &mut DirectoryHeader,
    cursor: &mut MetaCursor,
    ctx: &mut ContextSnapshot,
    cfg: &RecoveryConfig,
) -> Result<MetaMergeOutcome> {
    let Some(merge) = ctx.meta_merge else {
        if dir.idle.is_empty() {
            debug!("idle pool empty, no reclaim in flight");
        }
        return Ok(MetaMergeOutcome::NotDue);
    };
    let victim = merge.victim;
    let stale = victim >= layout.meta_count() || victim == cursor.current;
    let mut writer = MetaWriter::new(nand, layout, dir, cursor, ctx, cfg);

    if stale {
        warn!(victim, "stale meta reclaim record dropped");
        writer.clear_reclaim_record()?;
        return Ok(MetaMergeOutcome::Dropped(victim));
    }

    writer.resume_reclaim(victim)?;
    info!(victim, "interrupted meta block reclaim finished");
    Ok(MetaMergeOutcome::Resumed(victim))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::meta::context::MetaMerge;
    use crate::meta::mapping::BlockMapPage;
    use crate::meta::page::SideEffect;
    use crate::nand::SimNand;
    use crate::recovery::context::peek_context;
    use crate::recovery::replay::replay;
    use crate::recovery::scan::locate_header;
    use crate::testutil::{test_layout, TEST_NAND};
    use crate::zone::Zone;

    fn no_checkpoints() -> RecoveryConfig {
        RecoveryConfig {
            checkpoint_interval: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_interrupted_reclaim() -> Result<()> {
        let layout = test_layout();
        let cfg = no_checkpoints();
        let mut nand = SimNand::new(TEST_NAND);
        let mut zone = Zone::format(&mut nand, 0, layout.clone(), &cfg)?;
        zone.writer(&mut nand).switch_block()?;

        // Record the reclaim of block 0 and move one of its structures, then lose power
        zone.ctx.meta_merge = Some(MetaMerge { victim: 0 });
        let mut writer = zone.writer(&mut nand);
        writer.write_context(SideEffect::None)?;
        writer.write_bmt(&BlockMapPage::unallocated(0, 8), SideEffect::None)?;
        assert_eq!(zone.dir.valid[0], 5);

        let located = locate_header(&mut nand, &layout, &cfg)?;
        let mut replayed = replay(&mut nand, &layout, located, &cfg)?;
        let mut ctx = peek_context(&mut nand, &layout, &replayed.dir, &cfg)?.unwrap();
        assert_eq!(ctx.meta_merge, Some(MetaMerge { victim: 0 }));

        let outcome = recover(
            &mut nand,
            &layout,
            &mut replayed.dir,
            &mut replayed.cursor,
            &mut ctx,
            &cfg,
        )?;
        assert_eq!(outcome, MetaMergeOutcome::Resumed(0));
        assert_eq!(replayed.dir.valid[0], 0);
        assert!(replayed.dir.idle.contains(0));
        assert_eq!(ctx.meta_merge, None);
        assert_eq!(
            replayed.dir.valid_total() as usize,
            replayed.dir.live_structures().len()
        );

        // The cleared record is what the next open finds
        let located = locate_header(&mut nand, &layout, &cfg)?;
        let again = replay(&mut nand, &layout, located, &cfg)?;
        assert_eq!(again.dir, replayed.dir);
        let ctx = peek_context(&mut nand, &layout, &again.dir, &cfg)?.unwrap();
        assert_eq!(ctx.meta_merge, None);
        Ok(())
    }

    #[test]
    fn test_nothing_due() -> Result<()> {
        let layout = test_layout();
        let cfg = RecoveryConfig::default();
        let mut nand = SimNand::new(TEST_NAND);
        let mut zone = Zone::format(&mut nand, 0, layout.clone(), &cfg)?;
        let before = zone.cursor;

        let outcome = recover(
            &mut nand,
            &layout,
            &mut zone.dir,
            &mut zone.cursor,
            &mut zone.ctx,
            &cfg,
        )?;
        assert_eq!(outcome, MetaMergeOutcome::NotDue);
        assert_eq!(zone.cursor, before);

        // A record naming the current block is dropped
        zone.ctx.meta_merge = Some(MetaMerge { victim: 0 });
        let outcome = recover(
            &mut nand,
            &layout,
            &mut zone.dir,
            &mut zone.cursor,
            &mut zone.ctx,
            &cfg,
        )?;
        assert_eq!(outcome, MetaMergeOutcome::Dropped(0));
        assert_eq!(zone.ctx.meta_merge, None);
        assert_eq!(zone.cursor.next_page, before.next_page + 1);
        Ok(())
    }
}
