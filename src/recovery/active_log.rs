//! Rebuilding the page maps of the log blocks that were open for writing at power loss.
//!
//! The last snapshot of a log group only knows the pages written before it; everything after
//! that is rediscovered from the data spares of the log block itself.

use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::log_block::{LogBlock, LogGroup, LogState};
use crate::meta::context::{ActiveLog, ContextSnapshot, FreeBlock};
use crate::meta::layout::MetaLayout;
use crate::nand::{Nand, Vbn};
use crate::recovery::{classify_data_page, DataPage};

/// Find the log block of an active entry in its group, adding it if the snapshot predates it
///
/// Returns the log's index in the group.
pub fn attach(group: &mut LogGroup, entry: &ActiveLog) -> Result<usize> {
    let index = match group.find(entry.vbn) {
        Some(index) => index,
        None => {
            debug!(dgn = group.dgn, vbn = entry.vbn, "active log missing from snapshot");
            group.logs.push(LogBlock::new(entry.vbn, entry.ec));
            group.logs.len() - 1
        }
    };

    let log = &mut group.logs[index];
    if !log.state.is_active() {
        log.state = log.state.activate()?;
    }
    if entry.state == LogState::ActiveRandom {
        log.state = log.state.mark_random()?;
    }
    Ok(index)
}

/// What scanning an active log found
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogScan {
    pub vbn: Vbn,

    /// First page scanned; `pages[i]` describes page `start + i`
    pub start: u32,
    pub pages: Vec<DataPage>,

    /// Last page replayed into the page map
    pub window_end: Option<u32>,

    /// Replaying needed a reliable read; the log must move to a fresh block
    pub needs_relocation: bool,
}

/// Scan an active log from its snapshot's committed offset, and replay what it finds
pub fn rebuild_log<N: Nand>(
    nand: &mut N,
    layout: &MetaLayout,
    log: &mut LogBlock,
    cfg: &RecoveryConfig,
) -> Result<LogScan> {
    let ppb = layout.nand.pages_per_block;
    let old = log.committed.min(ppb);
    // The MSB program after the snapshot may have damaged the LSB page written before it
    let start = match layout.nand.paired_lsb(old) {
        Some(lsb) if old < ppb => lsb,
        _ => old,
    };

    let mut pages = Vec::with_capacity((ppb - start) as usize);
    for page in start..ppb {
        let class = match classify_data_page(nand, log.vbn, page, cfg)? {
            DataPage::Valid { ref spare, .. } if spare.lpn >= layout.pages_per_group() => {
                warn!(vbn = log.vbn, page, lpn = spare.lpn, "log page outside its group");
                DataPage::Corrupted
            }
            class => class,
        };
        pages.push(class);
    }

    let last_programmed = pages.iter().rposition(DataPage::is_programmed);
    let terminal = last_programmed.filter(|&i| pages[i] == DataPage::Corrupted);
    let last_bad = (0..pages.len())
        .filter(|&i| pages[i] == DataPage::Corrupted && Some(i) != terminal)
        .max();
    let window_end = (0..pages.len())
        .filter(|&i| matches!(pages[i], DataPage::Valid { confirmed: true, .. }))
        .filter(|&i| last_bad.map_or(true, |bad| i > bad))
        .max();

    if let Some(i) = terminal {
        debug!(vbn = log.vbn, page = start + i as u32, "torn terminal log page");
    }

    let mut random = false;
    let mut needs_relocation = false;
    for (i, class) in pages.iter().enumerate() {
        let page = start + i as u32;
        let in_window = window_end.is_some_and(|end| i <= end);
        match class {
            DataPage::Valid {
                spare, recovered, ..
            } if in_window => {
                log.record(page, spare.lpn);
                needs_relocation |= recovered.is_some();
            }
            DataPage::Corrupted => {
                if page < old {
                    log.unrecord(page);
                }
                random |= in_window;
            }
            _ => (),
        }
    }

    if let Some(last) = last_programmed {
        let mut run = 0;
        for class in &pages[..last] {
            run = match class {
                DataPage::Clean => run + 1,
                _ => 0,
            };
            random |= run > cfg.skew_tolerance;
        }
        log.committed = log.committed.max(start + last as u32 + 1);
    }

    if random && log.state == LogState::Active {
        info!(vbn = log.vbn, "log block no longer sequential");
        log.state = log.state.mark_random()?;
    }

    let window_end = window_end.map(|i| start + i as u32);
    debug!(
        vbn = log.vbn,
        start,
        ?window_end,
        committed = log.committed,
        "active log rebuilt"
    );
    Ok(LogScan {
        vbn: log.vbn,
        start,
        pages,
        window_end,
        needs_relocation,
    })
}

/// Move a log whose pages needed a reliable read to a block from the free list
///
/// Pages keep their offsets: recovered pages are programmed from the recovered content, every
/// other readable page is copied on-device. The old block returns to the free list. Returns
/// false if no free block was available.
pub fn relocate<N: Nand>(
    nand: &mut N,
    log: &mut LogBlock,
    scan: &LogScan,
    ctx: &mut ContextSnapshot,
    cfg: &RecoveryConfig,
) -> Result<bool> {
    let Some(dest) = ctx.take_free_block() else {
        warn!(vbn = log.vbn, "no free block to relocate the log to");
        return Ok(false);
    };
    let layout = nand.layout();
    info!(from = log.vbn, to = dest.vbn, "relocating log block");
    nand.erase(dest.vbn)?;

    for page in 0..log.committed.min(layout.pages_per_block) {
        let scanned;
        let class = match page.checked_sub(scan.start) {
            Some(i) => &scan.pages[i as usize],
            None => {
                scanned = classify_data_page(nand, log.vbn, page, cfg)?;
                &scanned
            }
        };

        let dst = layout.vpn(dest.vbn, page);
        match class {
            DataPage::Clean => (),
            DataPage::Corrupted => log.unrecord(page),
            DataPage::Valid {
                recovered: Some(recovered),
                ..
            } => nand.program(dst, &recovered.data, &recovered.spare)?,
            DataPage::Valid { .. } => nand.copyback(layout.vpn(log.vbn, page), dst)?,
        }
    }

    ctx.return_free(FreeBlock {
        vbn: log.vbn,
        ec: log.ec + 1,
    });
    if let Some(index) = ctx.active_index(log.vbn) {
        ctx.active[index].vbn = dest.vbn;
        ctx.active[index].ec = dest.ec + 1;
    }
    log.vbn = dest.vbn;
    log.ec = dest.ec + 1;
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{Fault, ReadStatus, SimNand};
    use crate::testutil::{page_content, program_data_page, test_layout, TEST_NAND};

    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn active(vbn: Vbn) -> LogBlock {
        let mut log = LogBlock::new(vbn, 0);
        log.state = LogState::Active;
        log
    }

    #[test]
    fn test_attach() -> Result<()> {
        let mut group = LogGroup::new(1);
        group.logs.push(LogBlock::new(20, 3));

        let entry = ActiveLog {
            vbn: 20,
            dgn: 1,
            ec: 3,
            state: LogState::Active,
        };
        assert_eq!(attach(&mut group, &entry)?, 0);
        assert_eq!(group.logs[0].state, LogState::Active);

        let entry = ActiveLog {
            vbn: 21,
            dgn: 1,
            ec: 5,
            state: LogState::ActiveRandom,
        };
        assert_eq!(attach(&mut group, &entry)?, 1);
        assert_eq!(group.logs[1].state, LogState::ActiveRandom);
        assert_eq!(group.logs[1].ec, 5);

        // A log the snapshot already retired cannot be active
        group.logs[0].state = LogState::Inactive;
        assert!(attach(&mut group, &entry).is_ok());
        let entry = ActiveLog {
            vbn: 20,
            state: LogState::Active,
            ..entry
        };
        assert!(attach(&mut group, &entry).is_err());
        Ok(())
    }

    #[test]
    fn test_mlc_pair_recovered() -> Result<()> {
        let layout = test_layout();
        let cfg = RecoveryConfig::default();
        let mut nand = SimNand::new(TEST_NAND);
        for page in 0..10 {
            program_data_page(&mut nand, 8, page, 100 + page, page == 9)?;
        }
        // Page 7 (LSB) was damaged by the interrupted program of page 8 (MSB)
        nand.inject(TEST_NAND.vpn(8, 7), Fault::Recoverable);

        let mut log = active(8);
        let scan = rebuild_log(&mut nand, &layout, &mut log, &cfg)?;
        assert_eq!(scan.window_end, Some(9));
        assert!(scan.needs_relocation);
        assert_eq!(log.lookup(107), Some(7));
        assert_eq!(log.lookup(108), Some(8));
        assert_eq!(log.committed, 10);
        assert_eq!(log.state, LogState::Active);

        let mut ctx = ContextSnapshot {
            free: vec![FreeBlock { vbn: 12, ec: 2 }],
            active: vec![ActiveLog {
                vbn: 8,
                dgn: 0,
                ec: 0,
                state: LogState::Active,
            }],
            ..Default::default()
        };
        assert!(relocate(&mut nand, &mut log, &scan, &mut ctx, &cfg)?);
        assert_eq!((log.vbn, log.ec), (12, 3));
        assert_eq!((ctx.active[0].vbn, ctx.active[0].ec), (12, 3));
        assert_eq!(ctx.free, [FreeBlock { vbn: 8, ec: 1 }]);

        // The relocated copy reads back without any help
        let mut data = vec![0; 2048];
        let mut spare = vec![0; 64];
        for page in 0..10 {
            let status = nand.read(TEST_NAND.vpn(12, page), &mut data, &mut spare, true)?;
            assert_eq!(status, ReadStatus::Success);
            assert_eq!(data, page_content(8, page, 100 + page));
        }

        // Nowhere left to go
        let scan = rebuild_log(&mut nand, &layout, &mut log, &cfg)?;
        ctx.free.clear();
        assert!(!relocate(&mut nand, &mut log, &scan, &mut ctx, &cfg)?);
        Ok(())
    }

    #[test]
    fn test_torn_terminal_page() -> Result<()> {
        let layout = test_layout();
        let cfg = RecoveryConfig::default();
        let mut nand = SimNand::new(TEST_NAND);
        for page in 0..6 {
            program_data_page(&mut nand, 8, page, page, page == 4 || page == 5)?;
        }
        nand.flip_bit(TEST_NAND.vpn(8, 5), 10, 2)?;

        let mut log = active(8);
        let scan = rebuild_log(&mut nand, &layout, &mut log, &cfg)?;
        assert_eq!(scan.window_end, Some(4));
        assert_eq!(log.state, LogState::Active);
        assert_eq!(log.committed, 6);
        assert_eq!(log.lookup(5), None);
        assert_eq!(log.lookup(4), Some(4));
        Ok(())
    }

    #[test]
    fn test_inner_corruption_goes_random() -> Result<()> {
        let layout = test_layout();
        let cfg = RecoveryConfig::default();
        let mut nand = SimNand::new(TEST_NAND);
        for page in 0..6 {
            program_data_page(&mut nand, 8, page, page, page == 2 || page == 5)?;
        }
        nand.flip_bit(TEST_NAND.vpn(8, 2), 700, 0)?;

        let mut log = active(8);
        let scan = rebuild_log(&mut nand, &layout, &mut log, &cfg)?;
        assert_eq!(scan.window_end, Some(5));
        assert_eq!(log.state, LogState::ActiveRandom);
        assert_eq!(log.lookup(2), None);
        assert_eq!(log.lookup(3), Some(3));
        assert_eq!(log.next_write_offset(&TEST_NAND), Some(7));
        Ok(())
    }

    #[test]
    fn test_unconfirmed_tail_not_replayed() -> Result<()> {
        let layout = test_layout();
        let cfg = RecoveryConfig::default();
        let mut nand = SimNand::new(TEST_NAND);
        // A snapshot taken after page 3; the transaction in pages 4..6 never completed
        let mut log = active(8);
        for page in 0..7 {
            program_data_page(&mut nand, 8, page, 50 + page, page == 3)?;
            if page < 4 {
                log.record(page, 50 + page);
            }
        }
        log.committed = 4;

        let scan = rebuild_log(&mut nand, &layout, &mut log, &cfg)?;
        assert_eq!(scan.start, 3);
        assert_eq!(scan.window_end, Some(3));
        assert_eq!(log.lookup(55), None);
        assert_eq!(log.lookup(53), Some(3));
        assert_eq!(log.committed, 7);
        assert_eq!(log.state, LogState::Active);
        Ok(())
    }

    #[test]
    fn test_skew() -> Result<()> {
        let layout = test_layout();
        let mut nand = SimNand::new(TEST_NAND);
        for page in [0, 1, 3, 4] {
            program_data_page(&mut nand, 8, page, page, page == 4)?;
        }
        let cfg = RecoveryConfig::default();
        let mut log = active(8);
        rebuild_log(&mut nand, &layout, &mut log, &cfg)?;
        assert_eq!(log.state, LogState::Active);

        // A longer hole is more than device skew
        let mut nand = SimNand::new(TEST_NAND);
        for page in [0, 1, 4, 5] {
            program_data_page(&mut nand, 8, page, page, page == 5)?;
        }
        let mut log = active(8);
        rebuild_log(&mut nand, &layout, &mut log, &cfg)?;
        assert_eq!(log.state, LogState::ActiveRandom);
        assert_eq!(log.committed, 6);
        Ok(())
    }

    proptest! {
        #[test]
        fn sequential_log_converges(lpos in proptest::collection::vec(0u32..40, 1..32)) {
            let layout = test_layout();
            let cfg = RecoveryConfig::default();
            let mut nand = SimNand::new(TEST_NAND);
            let mut expected = BTreeMap::new();
            for (page, &lpo) in (0..).zip(&lpos) {
                let last = page as usize + 1 == lpos.len();
                program_data_page(&mut nand, 8, page, lpo, last).unwrap();
                expected.insert(lpo, page);
            }

            let mut log = active(8);
            let scan = rebuild_log(&mut nand, &layout, &mut log, &cfg).unwrap();
            prop_assert_eq!(log.l2p(), &expected);
            prop_assert_eq!(log.committed, lpos.len() as u32);
            prop_assert_eq!(log.state, LogState::Active);
            prop_assert!(!scan.needs_relocation);
        }
    }
}
