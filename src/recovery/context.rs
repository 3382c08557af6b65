//! Loading the latest context snapshot, and settling a data merge that was in flight when power
//! was lost.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::log_block::LogGroup;
use crate::meta::context::{ContextSnapshot, FreeBlock};
use crate::meta::directory::DirectoryHeader;
use crate::meta::layout::MetaLayout;
use crate::meta::page::{MetaPayload, SideEffect};
use crate::meta::{read_meta_page, PageType};
use crate::nand::{Nand, Vbn};

/// Read the context snapshot the directory points at, without validating it
pub fn peek_context<N: Nand>(
    nand: &mut N,
    layout: &MetaLayout,
    dir: &DirectoryHeader,
    cfg: &RecoveryConfig,
) -> Result<Option<ContextSnapshot>> {
    let Some(loc) = dir.context else {
        return Ok(None);
    };
    let page = read_meta_page(nand, layout, loc, PageType::Context, cfg)?;
    Ok(page.and_then(|(_, page)| match page.payload {
        MetaPayload::Context(ctx) => Some(ctx),
        _ => None,
    }))
}

/// The outcome of loading the latest context
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LoadedContext {
    Valid(ContextSnapshot),

    /// Missing, unreadable or inconsistent; the zone cannot be written
    Corrupted {
        location: Option<(Vbn, u32)>,
        reason: String,
    },
}

/// Load and validate the latest context snapshot
pub fn load<N: Nand>(
    nand: &mut N,
    layout: &MetaLayout,
    dir: &DirectoryHeader,
    cfg: &RecoveryConfig,
) -> Result<LoadedContext> {
    let location = dir.context.and_then(|loc| {
        let vbn = layout.meta_vbn(loc.block)?;
        Some((vbn, u32::from(loc.page)))
    });

    let Some(ctx) = peek_context(nand, layout, dir, cfg)? else {
        warn!(?location, "context snapshot unreadable");
        return Ok(LoadedContext::Corrupted {
            location,
            reason: "unreadable".into(),
        });
    };

    if let Err(reason) = ctx.validate(layout) {
        warn!(?location, %reason, "context snapshot inconsistent");
        return Ok(LoadedContext::Corrupted { location, reason });
    }
    info!(
        free = ctx.free.len(),
        active = ctx.active.len(),
        buffer = ?ctx.buffer.map(|b| b.vbn),
        "context snapshot loaded"
    );
    Ok(LoadedContext::Valid(ctx))
}

/// How an in-flight data merge was settled
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MergeSettled {
    /// The mapping already points at the merge destination; the group's logs were freed
    RolledForward { dgn: u32 },

    /// The mapping was never switched; the destination went back to the free list. The next
    /// context write must carry `side` to clear the group's merge flag.
    RolledBack { dgn: u32, side: SideEffect },

    /// The record names a group the zone does not have; it was left in place
    UnknownGroup { dgn: u32 },
}

/// Settle the data merge recorded in `ctx`, if any
///
/// The merge-victim flag is set together with the merge record, and cleared by the mapping
/// update that completes the merge: a clear flag means the merge got past the point of no
/// return.
pub fn settle_merge(
    dir: &DirectoryHeader,
    ctx: &mut ContextSnapshot,
    groups: &mut BTreeMap<u32, LogGroup>,
) -> Option<MergeSettled> {
    let merge = ctx.merge_victim?;
    let Some(group) = groups.get_mut(&merge.dgn) else {
        warn!(dgn = merge.dgn, "data merge recorded for unknown group");
        return Some(MergeSettled::UnknownGroup { dgn: merge.dgn });
    };
    ctx.merge_victim = None;

    if dir.is_merge_victim(merge.dgn) {
        info!(dgn = merge.dgn, dest = merge.dest.vbn, "rolling back data merge");
        ctx.return_free(merge.dest);
        return Some(MergeSettled::RolledBack {
            dgn: merge.dgn,
            side: SideEffect::MergeFlag {
                dgn: merge.dgn,
                set: false,
            },
        });
    }

    info!(dgn = merge.dgn, dest = merge.dest.vbn, "rolling forward data merge");
    ctx.remove_free(merge.dest.vbn);
    let mut retired = Vec::with_capacity(group.logs.len());
    for mut log in group.logs.drain(..) {
        if let Err(e) = log.retire() {
            warn!(vbn = log.vbn, %e, "merged log was not in use");
        }
        retired.push(FreeBlock {
            vbn: log.vbn,
            ec: log.ec + 1,
        });
    }
    // Logs opened after the group's last snapshot were folded in too
    ctx.active.retain(|log| {
        if log.dgn != merge.dgn {
            return true;
        }
        retired.push(FreeBlock {
            vbn: log.vbn,
            ec: log.ec + 1,
        });
        false
    });
    for block in retired {
        ctx.return_free(block);
    }
    Some(MergeSettled::RolledForward { dgn: merge.dgn })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::log_block::{LogBlock, LogState};
    use crate::meta::context::{ActiveLog, MergeVictim};
    use crate::meta::writer::MetaCursor;
    use crate::nand::SimNand;
    use crate::testutil::{test_layout, TEST_NAND};
    use crate::zone::Zone;

    fn merging() -> (ContextSnapshot, BTreeMap<u32, LogGroup>) {
        let ctx = ContextSnapshot {
            free: vec![FreeBlock { vbn: 20, ec: 1 }],
            active: vec![ActiveLog {
                vbn: 30,
                dgn: 2,
                ec: 4,
                state: LogState::Active,
            }],
            merge_victim: Some(MergeVictim {
                dgn: 2,
                dest: FreeBlock { vbn: 21, ec: 0 },
            }),
            ..Default::default()
        };
        let mut group = LogGroup::new(2);
        let mut active = LogBlock::new(30, 4);
        active.state = LogState::Active;
        let mut full = LogBlock::new(31, 6);
        full.state = LogState::Inactive;
        group.logs.extend([active, full]);
        (ctx, BTreeMap::from([(2, group)]))
    }

    #[test]
    fn test_roll_forward() {
        let layout = test_layout();
        let dir = DirectoryHeader::new(&layout, 0);
        let (mut ctx, mut groups) = merging();

        let settled = settle_merge(&dir, &mut ctx, &mut groups);
        assert_eq!(settled, Some(MergeSettled::RolledForward { dgn: 2 }));
        assert!(groups[&2].logs.is_empty());
        assert!(ctx.active.is_empty());
        assert_eq!(ctx.merge_victim, None);
        assert_eq!(
            ctx.free,
            [
                FreeBlock { vbn: 20, ec: 1 },
                FreeBlock { vbn: 30, ec: 5 },
                FreeBlock { vbn: 31, ec: 7 },
            ]
        );
        assert_eq!(ctx.validate(&layout), Ok(()));
    }

    #[test]
    fn test_roll_back() {
        let layout = test_layout();
        let mut dir = DirectoryHeader::new(&layout, 0);
        dir.apply(&SideEffect::MergeFlag { dgn: 2, set: true });
        let (mut ctx, mut groups) = merging();
        let logs = groups[&2].logs.clone();

        let settled = settle_merge(&dir, &mut ctx, &mut groups);
        let Some(MergeSettled::RolledBack { dgn: 2, side }) = settled else {
            panic!("unexpected {settled:?}");
        };
        assert_eq!(side, SideEffect::MergeFlag { dgn: 2, set: false });
        assert_eq!(groups[&2].logs, logs);
        assert_eq!(ctx.active.len(), 1);
        assert!(ctx.free.contains(&FreeBlock { vbn: 21, ec: 0 }));
        assert_eq!(ctx.merge_victim, None);

        // No merge, nothing to do
        assert_eq!(settle_merge(&dir, &mut ctx, &mut groups), None);
    }

    #[test]
    fn test_unknown_group() {
        let layout = test_layout();
        let dir = DirectoryHeader::new(&layout, 0);
        let (mut ctx, _) = merging();
        let before = ctx.clone();

        let settled = settle_merge(&dir, &mut ctx, &mut BTreeMap::new());
        assert_eq!(settled, Some(MergeSettled::UnknownGroup { dgn: 2 }));
        assert_eq!(ctx, before);
    }

    #[test]
    fn test_load() -> Result<()> {
        let layout = test_layout();
        let cfg = RecoveryConfig::default();
        let mut nand = SimNand::new(TEST_NAND);
        let mut zone = Zone::format(&mut nand, 0, layout.clone(), &cfg)?;

        let LoadedContext::Valid(ctx) = load(&mut nand, &layout, &zone.dir, &cfg)? else {
            panic!("formatted context rejected");
        };
        assert_eq!(ctx, zone.ctx);

        // An inconsistent snapshot is rejected, with where it lives
        zone.ctx.free.push(FreeBlock { vbn: 2, ec: 0 });
        zone.writer(&mut nand).write_context(SideEffect::None)?;
        let loaded = load(&mut nand, &layout, &zone.dir, &cfg)?;
        let MetaCursor { next_page, .. } = zone.cursor;
        assert!(matches!(
            loaded,
            LoadedContext::Corrupted { location: Some((2, page)), .. } if page + 1 == next_page
        ));

        // So is a missing one
        zone.dir.context = None;
        assert!(matches!(
            load(&mut nand, &layout, &zone.dir, &cfg)?,
            LoadedContext::Corrupted { location: None, .. }
        ));
        Ok(())
    }
}
