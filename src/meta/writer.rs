//! The meta commit path: appends pages to the current meta block, moves to a fresh block when
//! the current one fills, and reclaims meta blocks before the idle pool runs dry.
//!
//! Every page is bookkept exactly the way directory replay bookkeeps it at open, so a zone that
//! is closed and reopened ends up with the same directory it had in RAM.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::config::RecoveryConfig;
use crate::error::{FtlError, Result};
use crate::log_block::LogGroup;
use crate::meta::context::{ContextSnapshot, MetaMerge};
use crate::meta::directory::{DirectoryHeader, Structure};
use crate::meta::layout::MetaLayout;
use crate::meta::mapping::BlockMapPage;
use crate::meta::page::{program_meta, MetaPage, MetaPayload, SideEffect};
use crate::meta::{read_meta_page, Age, MetaLoc, PageType};
use crate::nand::Nand;

/// Where the next meta page goes
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MetaCursor {
    /// Index of the current meta block
    pub current: u16,

    /// First unwritten page of the current block
    pub next_page: u32,

    /// Age of the latest header copy in the current block; every page after it carries it
    pub age: Age,

    /// Page where the latest header copy starts
    pub header_page: u32,
}

pub struct MetaWriter<'a, N: Nand> {
    nand: &'a mut N,
    layout: &'a MetaLayout,
    dir: &'a mut DirectoryHeader,
    cursor: &'a mut MetaCursor,
    ctx: &'a mut ContextSnapshot,
    cfg: &'a RecoveryConfig,

    /// A reclaim is running, and may use the pages reserved for it
    reclaiming: bool,
}

impl<'a, N: Nand> MetaWriter<'a, N> {
    pub fn new(
        nand: &'a mut N,
        layout: &'a MetaLayout,
        dir: &'a mut DirectoryHeader,
        cursor: &'a mut MetaCursor,
        ctx: &'a mut ContextSnapshot,
        cfg: &'a RecoveryConfig,
    ) -> Self {
        Self {
            nand,
            layout,
            dir,
            cursor,
            ctx,
            cfg,
            reclaiming: false,
        }
    }

    fn free_pages(&self) -> u32 {
        self.layout
            .nand
            .pages_per_block
            .saturating_sub(self.cursor.next_page)
    }

    fn current_vbn(&self) -> u32 {
        self.layout.meta_vbn(self.cursor.current).unwrap_or(u32::MAX)
    }

    /// Pages that must stay free in the current block so the next reclaim can complete
    fn reclaim_room(&self) -> u32 {
        if !self.dir.idle.is_empty() {
            return 0;
        }
        let live = self
            .dir
            .reclaim_victim(self.cursor.current)
            .map_or(0, |v| u32::from(self.dir.valid[usize::from(v)]));
        live + self.cfg.meta_reserve
    }

    /// Program a copy of the directory header at page `at` of the current block
    fn program_header(&mut self, at: u32, age: Age) -> Result<()> {
        let blob = self.dir.encode();
        let payload = self.layout.payload_size();
        let parts = self.layout.header_pages;

        for part in 0..parts {
            let start = (part as usize * payload).min(blob.len());
            let end = (start + payload).min(blob.len());
            let page = MetaPage::new(MetaPayload::Header {
                part,
                parts: parts as u16,
                bytes: blob[start..end].to_vec(),
            });
            let loc = MetaLoc::new(self.cursor.current, at + part);
            let vpn = self.layout.meta_vpn(loc).ok_or(FtlError::MetaFull(self.current_vbn()))?;
            program_meta(self.nand, vpn, age, &page)?;
        }
        Ok(())
    }

    /// Erase meta block `block` and make it current, opening it with a header copy of age `age`
    pub fn start_block(&mut self, block: u16, age: Age) -> Result<()> {
        let vbn = self
            .layout
            .meta_vbn(block)
            .ok_or_else(|| FtlError::InvalidArgument(format!("meta block index {block}")))?;
        self.nand.erase(vbn)?;

        *self.cursor = MetaCursor {
            current: block,
            next_page: 0,
            age,
            header_page: 0,
        };
        self.program_header(0, age)?;
        self.cursor.next_page = self.layout.header_pages;
        Ok(())
    }

    /// Move to the oldest idle meta block
    pub fn switch_block(&mut self) -> Result<()> {
        let Some(next) = self.dir.idle.pop() else {
            return Err(FtlError::MetaFull(self.current_vbn()));
        };

        let old = self.cursor.current;
        if self.dir.valid.get(usize::from(old)) == Some(&0) {
            self.dir.idle.push(old);
        }

        info!(from = old, to = next, "switching meta block");
        self.start_block(next, self.cursor.age.next_block())
    }

    /// Write a fresh header copy into the current block, so the next open replays less
    pub fn checkpoint(&mut self) -> Result<()> {
        let age = self.cursor.age.next_header();
        let at = self.cursor.next_page;
        self.program_header(at, age)?;

        debug!(page = at, ?age, "header checkpoint");
        self.cursor.age = age;
        self.cursor.header_page = at;
        self.cursor.next_page = at + self.layout.header_pages;
        Ok(())
    }

    /// Put a fresh header copy after a torn page, so the next open never replays across it
    ///
    /// Moves to a new meta block instead when the current one has no room for the copy.
    pub fn seal(&mut self) -> Result<()> {
        if self.free_pages() >= self.layout.header_pages + self.reclaim_room() {
            return self.checkpoint();
        }
        if self.dir.idle.is_empty() {
            if let Some(victim) = self.dir.reclaim_victim(self.cursor.current) {
                self.reclaim(victim)?;
            }
        }
        self.switch_block()
    }

    fn maybe_checkpoint(&mut self) -> Result<()> {
        let interval = self.cfg.checkpoint_interval;
        if interval == 0 || self.reclaiming {
            return Ok(());
        }

        let since = self.cursor.next_page - self.cursor.header_page - self.layout.header_pages;
        let needed = self.layout.header_pages + 1 + self.reclaim_room();
        if since >= interval && self.free_pages() >= needed {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Make sure one more page fits, switching or reclaiming meta blocks as needed
    fn make_room(&mut self) -> Result<()> {
        loop {
            let free = self.free_pages();

            if self.reclaiming || !self.dir.idle.is_empty() {
                if free >= 1 {
                    return Ok(());
                }
                self.switch_block()?;
                continue;
            }

            let Some(victim) = self.dir.reclaim_victim(self.cursor.current) else {
                // Every live structure is in the current block
                return match free {
                    0 => Err(FtlError::MetaFull(self.current_vbn())),
                    _ => Ok(()),
                };
            };

            if free > self.reclaim_room() {
                return Ok(());
            }
            self.reclaim(victim)?;
            if self.dir.idle.is_empty() {
                return Err(FtlError::MetaFull(self.current_vbn()));
            }
        }
    }

    fn append(&mut self, page: &MetaPage) -> Result<MetaLoc> {
        self.maybe_checkpoint()?;
        self.make_room()?;

        let loc = MetaLoc::new(self.cursor.current, self.cursor.next_page);
        let vpn = self
            .layout
            .meta_vpn(loc)
            .ok_or(FtlError::MetaFull(self.current_vbn()))?;
        program_meta(self.nand, vpn, self.cursor.age, page)?;
        self.cursor.next_page += 1;

        debug!(?loc, kind = page.kind().name(), "meta page written");
        Ok(loc)
    }

    pub fn write_bmt(&mut self, bmt: &BlockMapPage, side: SideEffect) -> Result<MetaLoc> {
        let page = MetaPage::new(MetaPayload::Bmt(bmt.clone())).with_side(side);
        let loc = self.append(&page)?;

        self.dir.record(Structure::Bmt(bmt.lan), loc, self.cursor.current);
        self.dir.apply(&side);
        Ok(loc)
    }

    /// Write snapshots of `groups`, as many per page as fit; `side` goes with the first page
    pub fn write_groups(&mut self, groups: &[&LogGroup], side: SideEffect) -> Result<()> {
        let payload = self.layout.payload_size();
        let mut batches: Vec<Vec<LogGroup>> = Vec::new();
        let mut used = payload;

        for &group in groups {
            let mut record = Vec::new();
            group.encode_record(&mut record);
            if used + record.len() > payload {
                batches.push(Vec::new());
                used = 0;
            }
            used += record.len();
            if let Some(batch) = batches.last_mut() {
                batch.push(group.clone());
            }
        }

        let mut side = side;
        for batch in batches {
            let page = MetaPage::new(MetaPayload::Pmt(batch.clone())).with_side(side);
            let loc = self.append(&page)?;

            for group in &batch {
                let (min_ec, min_vbn) = group.min_cost();
                self.dir.record(Structure::Pmt(group.dgn), loc, self.cursor.current);
                self.dir.set_pmt_cost(group.dgn, min_ec, min_vbn);
            }
            self.dir.apply(&side);
            side = SideEffect::None;
        }
        Ok(())
    }

    /// Write the context snapshot this writer holds
    pub fn write_context(&mut self, side: SideEffect) -> Result<MetaLoc> {
        let page = MetaPage::new(MetaPayload::Context(self.ctx.clone())).with_side(side);
        let loc = self.append(&page)?;

        self.dir.record(Structure::Context, loc, self.cursor.current);
        self.dir.apply(&side);
        Ok(loc)
    }

    /// Empty meta block `victim` by moving its live structures into the current block
    ///
    /// The reclaim is recorded in a context page before anything moves and cleared after, so an
    /// interrupted reclaim is finished at the next open.
    pub fn reclaim(&mut self, victim: u16) -> Result<()> {
        info!(victim, "reclaiming meta block");
        self.reclaiming = true;
        let result = self.reclaim_steps(victim, true);
        self.reclaiming = false;
        result
    }

    /// Finish a reclaim whose record was found in the latest context
    pub fn resume_reclaim(&mut self, victim: u16) -> Result<()> {
        info!(victim, "resuming interrupted meta block reclaim");
        self.reclaiming = true;
        let result = self.reclaim_steps(victim, false);
        self.reclaiming = false;
        result?;
        self.settle()
    }

    /// Drop a reclaim record that cannot be acted on
    pub fn clear_reclaim_record(&mut self) -> Result<()> {
        self.ctx.meta_merge = None;
        self.write_context(SideEffect::None)?;
        Ok(())
    }

    fn reclaim_steps(&mut self, victim: u16, record: bool) -> Result<()> {
        if record {
            self.ctx.meta_merge = Some(MetaMerge { victim });
            self.write_context(SideEffect::None)?;
        }

        self.migrate(victim)?;

        self.ctx.meta_merge = None;
        self.write_context(SideEffect::None)?;
        Ok(())
    }

    /// Re-append every structure still live in `victim`, read back from flash, without its
    /// side effect
    fn migrate(&mut self, victim: u16) -> Result<()> {
        let mut by_page: BTreeMap<MetaLoc, Vec<Structure>> = BTreeMap::new();
        for (structure, loc) in self.dir.live_in(victim) {
            by_page.entry(loc).or_default().push(structure);
        }

        for (loc, structures) in by_page {
            if structures.contains(&Structure::Context) {
                self.write_context(SideEffect::None)?;
                continue;
            }

            let kind = match structures.first() {
                Some(Structure::Bmt(_)) => PageType::Bmt,
                _ => PageType::Pmt,
            };
            let vbn = self.layout.meta_vbn(loc.block).unwrap_or(u32::MAX);
            let corrupted = move || FtlError::Corrupted {
                what: kind.name(),
                vbn,
                page: u32::from(loc.page),
            };
            let Some((_, page)) = read_meta_page(self.nand, self.layout, loc, kind, self.cfg)?
            else {
                return Err(corrupted());
            };

            match page.payload {
                MetaPayload::Bmt(bmt) if structures.contains(&Structure::Bmt(bmt.lan)) => {
                    self.write_bmt(&bmt, SideEffect::None)?;
                }
                MetaPayload::Pmt(groups) => {
                    let live: Vec<&LogGroup> = groups
                        .iter()
                        .filter(|g| structures.contains(&Structure::Pmt(g.dgn)))
                        .collect();
                    if live.len() != structures.len() {
                        return Err(corrupted());
                    }
                    self.write_groups(&live, SideEffect::None)?;
                }
                _ => return Err(corrupted()),
            }
        }

        match self.dir.valid.get(usize::from(victim)) {
            Some(0) => Ok(()),
            _ => Err(FtlError::MetaFull(self.current_vbn())),
        }
    }

    /// After a resumed reclaim, move on to an idle block if the current one cannot hold another
    /// reclaim
    fn settle(&mut self) -> Result<()> {
        if self.dir.idle.is_empty() {
            return Ok(());
        }
        let live = self
            .dir
            .reclaim_victim(self.cursor.current)
            .map_or(0, |v| u32::from(self.dir.valid[usize::from(v)]));
        if self.free_pages() < live + self.cfg.meta_reserve {
            self.switch_block()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::meta::page::{read_meta, PageRead};
    use crate::nand::SimNand;
    use crate::testutil::{test_layout, TEST_NAND};

    struct Fixture {
        nand: SimNand,
        layout: MetaLayout,
        dir: DirectoryHeader,
        cursor: MetaCursor,
        ctx: ContextSnapshot,
        cfg: RecoveryConfig,
    }

    impl Fixture {
        fn new(cfg: RecoveryConfig) -> Result<Self> {
            let layout = test_layout();
            let mut fixture = Self {
                nand: SimNand::new(TEST_NAND),
                dir: DirectoryHeader::new(&layout, 0),
                layout,
                cursor: MetaCursor {
                    current: 0,
                    next_page: 0,
                    age: Age::INITIAL,
                    header_page: 0,
                },
                ctx: ContextSnapshot::default(),
                cfg,
            };
            fixture.writer().start_block(0, Age::INITIAL)?;
            Ok(fixture)
        }

        fn writer(&mut self) -> MetaWriter<'_, SimNand> {
            MetaWriter::new(
                &mut self.nand,
                &self.layout,
                &mut self.dir,
                &mut self.cursor,
                &mut self.ctx,
                &self.cfg,
            )
        }

        fn write_everything(&mut self) -> Result<()> {
            let groups: Vec<LogGroup> = (0..4).map(LogGroup::new).collect();
            let refs: Vec<&LogGroup> = groups.iter().collect();
            let mut writer = self.writer();
            for lan in 0..2 {
                writer.write_bmt(&BlockMapPage::unallocated(lan, 8), SideEffect::None)?;
            }
            writer.write_groups(&refs, SideEffect::None)?;
            writer.write_context(SideEffect::None)?;
            Ok(())
        }
    }

    fn no_checkpoints() -> RecoveryConfig {
        RecoveryConfig {
            checkpoint_interval: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_append_bookkeeping() -> Result<()> {
        let mut f = Fixture::new(no_checkpoints())?;
        f.write_everything()?;

        // Four empty groups pack into one page
        assert_eq!(f.cursor.next_page, 1 + 2 + 1 + 1);
        assert_eq!(f.dir.valid_total(), 7);
        assert_eq!(f.dir.valid[0], 7);
        assert_eq!(f.dir.location(Structure::Pmt(3)), Some(MetaLoc::new(0, 3)));
        assert_eq!(f.dir.location(Structure::Context), Some(MetaLoc::new(0, 4)));

        match read_meta(&mut f.nand, f.layout.nand.vpn(2, 4), 3)? {
            PageRead::Valid(spare, page) => {
                assert_eq!(spare.age, Age::INITIAL);
                assert_eq!(page.kind(), PageType::Context);
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_switch_and_reclaim() -> Result<()> {
        let mut f = Fixture::new(no_checkpoints())?;
        f.write_everything()?;

        // Rewriting the context over and over walks through every meta block; reclaims must
        // keep the zone writable indefinitely
        for _ in 0..400 {
            f.writer().write_context(SideEffect::None)?;
            assert_eq!(f.dir.valid_total(), 7);
            assert!(f.cursor.next_page <= 32);
        }
        assert!(f.ctx.meta_merge.is_none());
        assert_eq!(f.dir.valid_total() as usize, f.dir.live_structures().len());

        // Every live structure is still readable where the directory says it is
        for (structure, loc) in f.dir.live_structures() {
            let kind = match structure {
                Structure::Bmt(_) => PageType::Bmt,
                Structure::Pmt(_) => PageType::Pmt,
                Structure::Context => PageType::Context,
            };
            assert!(read_meta_page(&mut f.nand, &f.layout, loc, kind, &f.cfg)?.is_some());
        }
        Ok(())
    }

    #[test]
    fn test_reclaim_moves_live_structures() -> Result<()> {
        let mut f = Fixture::new(no_checkpoints())?;
        f.write_everything()?;
        f.writer().switch_block()?;
        assert_eq!(f.cursor.current, 1);
        assert_eq!(f.cursor.age, Age::INITIAL.next_block());

        f.writer().reclaim(0)?;
        assert_eq!(f.dir.valid[0], 0);
        assert_eq!(f.dir.valid[1], 7);
        assert!(f.dir.idle.contains(0));
        assert!(f.ctx.meta_merge.is_none());

        // Intent, one page per BMT, the packed PMT page, and the clearing context
        assert_eq!(f.cursor.next_page, 1 + 1 + 2 + 1 + 1);
        Ok(())
    }

    #[test]
    fn test_mixed_writes_stay_writable() -> Result<()> {
        let mut f = Fixture::new(no_checkpoints())?;
        f.write_everything()?;
        let groups: Vec<LogGroup> = (0..4).map(LogGroup::new).collect();

        for i in 0..300u32 {
            let mut writer = f.writer();
            match i % 7 {
                0 => {
                    writer.write_bmt(&BlockMapPage::unallocated(i % 2, 8), SideEffect::None)?;
                }
                3 => writer.write_groups(&[&groups[(i % 4) as usize]], SideEffect::None)?,
                _ => {
                    writer.write_context(SideEffect::None)?;
                }
            }
            assert_eq!(f.dir.valid_total(), 7);
        }
        assert!(f.ctx.meta_merge.is_none());
        Ok(())
    }

    #[test]
    fn test_checkpoints() -> Result<()> {
        let cfg = RecoveryConfig {
            checkpoint_interval: 4,
            ..Default::default()
        };
        let mut f = Fixture::new(cfg)?;
        f.write_everything()?;
        for _ in 0..6 {
            f.writer().write_context(SideEffect::None)?;
        }
        assert!(f.cursor.header_page > 0);
        assert!(f.cursor.age.is_newer_than(Age::INITIAL));
        assert_eq!(f.cursor.age.high, Age::INITIAL.high);
        Ok(())
    }

    #[test]
    fn test_side_effect_applied() -> Result<()> {
        let mut f = Fixture::new(no_checkpoints())?;
        f.write_everything()?;
        f.writer()
            .write_context(SideEffect::MergeFlag { dgn: 1, set: true })?;
        assert!(f.dir.is_merge_victim(1));
        Ok(())
    }
}
