//! A zone: one independently mapped range of the logical address space, with its own meta
//! blocks and data area.
//!
//! [Zone::open] runs the recovery stages of [`crate::recovery`] in order and commits whatever
//! they changed; [Zone::format] lays down an empty zone.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, info, warn};

use crate::config::{OpenFlags, RecoveryConfig};
use crate::error::{FtlError, Result};
use crate::log_block::LogGroup;
use crate::meta::context::{BufferBlock, BufferState, ContextSnapshot, FreeBlock};
use crate::meta::directory::DirectoryHeader;
use crate::meta::layout::MetaLayout;
use crate::meta::mapping::{BlockMapPage, MappingCache};
use crate::meta::page::SideEffect;
use crate::meta::writer::{MetaCursor, MetaWriter};
use crate::meta::Age;
use crate::nand::{Nand, Vbn};
use crate::recovery::buffer::BufferIndex;
use crate::recovery::context::{LoadedContext, MergeSettled};
use crate::recovery::mapping::Loaded;
use crate::recovery::replay::Replayed;
use crate::recovery::{active_log, buffer, context, mapping, meta_merge, replay, scan};

/// Why a zone refuses writes
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReadOnlyReason {
    /// Opened with [OpenFlags::read_only]
    Requested,

    /// A meta page before the end of the current block's log failed validation
    MetaCorrupted { vbn: Vbn, page: u32 },

    ContextCorrupted {
        location: Option<(Vbn, u32)>,
        reason: String,
    },

    MappingCorrupted { vbn: Vbn, page: u32 },

    GroupCorrupted { dgn: u32, vbn: Vbn, page: u32 },

    /// The context and a log group snapshot disagree about a log block
    LogInconsistent { dgn: u32, vbn: Vbn },

    /// A log needing relocation had no free block to move to
    NoFreeBlock { vbn: Vbn },
}

impl fmt::Display for ReadOnlyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "opened read-only"),
            Self::MetaCorrupted { vbn, page } => write!(f, "meta page {vbn}:{page} corrupted"),
            Self::ContextCorrupted {
                location: Some((vbn, page)),
                reason,
            } => write!(f, "context at {vbn}:{page} {reason}"),
            Self::ContextCorrupted {
                location: None,
                reason,
            } => write!(f, "context {reason}"),
            Self::MappingCorrupted { vbn, page } => {
                write!(f, "block mapping table {vbn}:{page} corrupted")
            }
            Self::GroupCorrupted { dgn, vbn, page } => {
                write!(f, "log group {dgn} snapshot {vbn}:{page} corrupted")
            }
            Self::LogInconsistent { dgn, vbn } => {
                write!(f, "log block {vbn} of group {dgn} inconsistent")
            }
            Self::NoFreeBlock { vbn } => write!(f, "no free block to relocate log {vbn}"),
        }
    }
}

/// The recovered RAM state of one zone
#[derive(Debug, Clone)]
pub struct Zone {
    pub id: u32,
    pub layout: MetaLayout,
    pub dir: DirectoryHeader,
    pub cursor: MetaCursor,
    pub ctx: ContextSnapshot,
    pub mapping: MappingCache,
    pub groups: BTreeMap<u32, LogGroup>,
    pub buffer_index: BufferIndex,

    /// Set once the zone must not be written anymore; only the first reason is kept
    pub read_only: Option<ReadOnlyReason>,

    dirty_groups: BTreeSet<u32>,
    ctx_dirty: bool,

    /// Carried by the next context write
    pending_side: SideEffect,

    cfg: RecoveryConfig,
}

impl Zone {
    fn new(
        id: u32,
        layout: MetaLayout,
        dir: DirectoryHeader,
        cursor: MetaCursor,
        cfg: &RecoveryConfig,
    ) -> Self {
        Self {
            id,
            layout,
            dir,
            cursor,
            ctx: ContextSnapshot::default(),
            mapping: MappingCache::default(),
            groups: BTreeMap::new(),
            buffer_index: BufferIndex::default(),
            read_only: None,
            dirty_groups: BTreeSet::new(),
            ctx_dirty: false,
            pending_side: SideEffect::None,
            cfg: *cfg,
        }
    }

    /// Erase the zone's blocks and write an empty zone: every LAN unallocated, every group
    /// without logs, the first data block as buffer and the rest free
    pub fn format<N: Nand>(
        nand: &mut N,
        id: u32,
        layout: MetaLayout,
        cfg: &RecoveryConfig,
    ) -> Result<Self> {
        let g = layout.geometry.clone();
        let rpt = howudoin::new()
            .label(format!("Formatting zone {id}"))
            .set_len(u64::from(g.data_count) + g.meta_blocks.len() as u64);

        for &vbn in &g.meta_blocks {
            nand.erase(vbn)?;
            rpt.inc();
        }
        for vbn in g.data_blocks() {
            nand.erase(vbn)?;
            rpt.inc();
        }
        rpt.close();

        let dir = DirectoryHeader::new(&layout, 0);
        let cursor = MetaCursor {
            current: 0,
            next_page: 0,
            age: Age::INITIAL,
            header_page: 0,
        };
        let mut zone = Self::new(id, layout, dir, cursor, cfg);

        let mut data = g.data_blocks();
        zone.ctx.buffer = data.next().map(|vbn| BufferBlock {
            vbn,
            ec: 0,
            committed: 0,
            state: BufferState::Empty,
        });
        zone.ctx.free = data.map(|vbn| FreeBlock { vbn, ec: 0 }).collect();
        zone.mapping.pages = (0..g.lan_count)
            .map(|lan| BlockMapPage::unallocated(lan, g.blocks_per_lan))
            .collect();
        zone.groups = (0..g.dgn_count()).map(|dgn| (dgn, LogGroup::new(dgn))).collect();

        let Zone {
            layout,
            dir,
            cursor,
            ctx,
            mapping,
            groups,
            cfg,
            ..
        } = &mut zone;
        let mut writer = MetaWriter::new(nand, layout, dir, cursor, ctx, cfg);
        writer.start_block(0, Age::INITIAL)?;
        for bmt in &mapping.pages {
            writer.write_bmt(bmt, SideEffect::None)?;
        }
        let groups: Vec<&LogGroup> = groups.values().collect();
        writer.write_groups(&groups, SideEffect::None)?;
        writer.write_context(SideEffect::None)?;

        info!(zone = id, free = zone.ctx.free.len(), "zone formatted");
        Ok(zone)
    }

    /// Recover the zone from flash
    ///
    /// Physical-layer failures and a missing directory header fail the open; corruption found
    /// once the directory is known leaves the zone open but read-only.
    pub fn open<N: Nand>(
        nand: &mut N,
        id: u32,
        layout: MetaLayout,
        flags: OpenFlags,
        cfg: &RecoveryConfig,
    ) -> Result<Self> {
        let located = scan::locate_header(nand, &layout, cfg)?;
        let Replayed {
            dir,
            cursor,
            corrupted,
            torn,
        } = replay::replay(nand, &layout, located, cfg)?;

        let mut zone = Self::new(id, layout, dir, cursor, cfg);
        if let Some((vbn, page)) = corrupted {
            zone.mark_read_only(ReadOnlyReason::MetaCorrupted { vbn, page });
        }
        if flags.read_only {
            zone.mark_read_only(ReadOnlyReason::Requested);
        }

        match context::load(nand, &zone.layout, &zone.dir, cfg)? {
            LoadedContext::Valid(ctx) => {
                zone.ctx = ctx;
                if zone.is_writable() && torn.is_some() {
                    let sealed = zone.writer(nand).seal();
                    zone.degrade_on_corruption(sealed)?;
                }
                if zone.is_writable() {
                    let resumed = meta_merge::recover(
                        nand,
                        &zone.layout,
                        &mut zone.dir,
                        &mut zone.cursor,
                        &mut zone.ctx,
                        cfg,
                    );
                    zone.degrade_on_corruption(resumed.map(drop))?;
                }
            }
            LoadedContext::Corrupted { location, reason } => {
                zone.mark_read_only(ReadOnlyReason::ContextCorrupted { location, reason });
            }
        }

        let (cache, corrupted) = mapping::load_all(nand, &zone.layout, &zone.dir, cfg)?;
        zone.mapping = cache;
        if let Some((vbn, page)) = corrupted {
            zone.mark_read_only(ReadOnlyReason::MappingCorrupted { vbn, page });
        }

        zone.load_groups(nand)?;
        zone.settle_merge();
        zone.rebuild_active_logs(nand)?;
        zone.recover_buffer(nand)?;

        if zone.is_writable() {
            let committed = zone.commit(nand);
            zone.degrade_on_corruption(committed)?;
        }
        match &zone.read_only {
            Some(reason) => warn!(zone = id, %reason, "zone opened read-only"),
            None => info!(zone = id, "zone opened"),
        }
        Ok(zone)
    }

    fn load_groups<N: Nand>(&mut self, nand: &mut N) -> Result<()> {
        for dgn in 0..self.layout.geometry.dgn_count() {
            let group = match mapping::load_group(nand, &self.layout, &self.dir, dgn, &self.cfg)? {
                Loaded::Found(group) => group,
                Loaded::Corrupted { vbn, page } => {
                    self.mark_read_only(ReadOnlyReason::GroupCorrupted { dgn, vbn, page });
                    LogGroup::new(dgn)
                }
            };
            self.groups.insert(dgn, group);
        }
        Ok(())
    }

    fn settle_merge(&mut self) {
        match context::settle_merge(&self.dir, &mut self.ctx, &mut self.groups) {
            Some(MergeSettled::RolledBack { dgn, side }) => {
                self.pending_side = side;
                self.dirty_groups.insert(dgn);
            }
            Some(MergeSettled::RolledForward { dgn }) => {
                self.dirty_groups.insert(dgn);
            }
            Some(MergeSettled::UnknownGroup { dgn }) => {
                let location = self.dir.context.and_then(|loc| {
                    let vbn = self.layout.meta_vbn(loc.block)?;
                    Some((vbn, u32::from(loc.page)))
                });
                self.mark_read_only(ReadOnlyReason::ContextCorrupted {
                    location,
                    reason: format!("merge of unknown group {dgn}"),
                });
                return;
            }
            None => return,
        }
        self.ctx_dirty = true;
    }

    fn rebuild_active_logs<N: Nand>(&mut self, nand: &mut N) -> Result<()> {
        let mut groups = std::mem::take(&mut self.groups);

        for entry in self.ctx.active.clone() {
            let group = groups
                .entry(entry.dgn)
                .or_insert_with(|| LogGroup::new(entry.dgn));
            let before = group.clone();

            let index = match active_log::attach(group, &entry) {
                Ok(index) => index,
                Err(FtlError::LogTransition { from, .. }) => {
                    warn!(dgn = entry.dgn, vbn = entry.vbn, ?from, "active log is retired");
                    self.mark_read_only(ReadOnlyReason::LogInconsistent {
                        dgn: entry.dgn,
                        vbn: entry.vbn,
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };
            let log = &mut group.logs[index];
            let scan = active_log::rebuild_log(nand, &self.layout, log, &self.cfg)?;

            if scan.needs_relocation && self.is_writable() {
                if active_log::relocate(nand, log, &scan, &mut self.ctx, &self.cfg)? {
                    self.ctx_dirty = true;
                } else {
                    self.mark_read_only(ReadOnlyReason::NoFreeBlock { vbn: entry.vbn });
                }
            }

            if let Some(i) = self.ctx.active_index(log.vbn) {
                if self.ctx.active[i].state != log.state {
                    self.ctx.active[i].state = log.state;
                    self.ctx_dirty = true;
                }
            }
            if *group != before {
                self.dirty_groups.insert(entry.dgn);
            }
        }

        self.groups = groups;
        Ok(())
    }

    fn recover_buffer<N: Nand>(&mut self, nand: &mut N) -> Result<()> {
        let Some(mut block) = self.ctx.buffer else {
            return Ok(());
        };
        self.buffer_index = buffer::recover(nand, &self.layout, &mut block, &self.cfg)?;
        if self.ctx.buffer != Some(block) {
            self.ctx.buffer = Some(block);
            self.ctx_dirty = true;
        }
        Ok(())
    }

    pub fn is_writable(&self) -> bool {
        self.read_only.is_none()
    }

    pub fn mark_read_only(&mut self, reason: ReadOnlyReason) {
        if self.read_only.is_none() {
            warn!(zone = self.id, %reason, "zone degraded to read-only");
            self.read_only = Some(reason);
        }
    }

    /// A live meta page that a recovery write had to read back leaves the zone read-only; the
    /// open goes on
    fn degrade_on_corruption(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Err(FtlError::Corrupted { what, vbn, page }) => {
                warn!(zone = self.id, what, vbn, page, "live meta page lost during recovery");
                self.mark_read_only(ReadOnlyReason::MetaCorrupted { vbn, page });
                Ok(())
            }
            other => other,
        }
    }

    /// Is there recovered state not yet written to flash?
    pub fn is_dirty(&self) -> bool {
        !self.dirty_groups.is_empty() || self.ctx_dirty || self.pending_side != SideEffect::None
    }

    #[cfg(test)]
    pub(crate) fn mark_context_dirty(&mut self) {
        self.ctx_dirty = true;
    }

    /// A meta writer over this zone's directory, cursor and context
    pub fn writer<'a, N: Nand>(&'a mut self, nand: &'a mut N) -> MetaWriter<'a, N> {
        MetaWriter::new(
            nand,
            &self.layout,
            &mut self.dir,
            &mut self.cursor,
            &mut self.ctx,
            &self.cfg,
        )
    }

    /// Write every changed log group snapshot, then the context
    ///
    /// Nothing is forgotten when a write fails; a live meta page that a reclaim could not read
    /// back also leaves the zone read-only.
    pub fn commit<N: Nand>(&mut self, nand: &mut N) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        if !self.is_writable() {
            return Err(FtlError::ReadOnly(self.id));
        }

        let Zone {
            layout,
            dir,
            cursor,
            ctx,
            groups,
            dirty_groups,
            pending_side,
            cfg,
            ..
        } = &mut *self;
        let groups: Vec<&LogGroup> = dirty_groups
            .iter()
            .filter_map(|dgn| groups.get(dgn))
            .collect();
        let mut writer = MetaWriter::new(nand, layout, dir, cursor, ctx, cfg);
        let mut written = Ok(());
        if !groups.is_empty() {
            written = writer.write_groups(&groups, SideEffect::None);
        }
        let written = written.and_then(|()| writer.write_context(*pending_side));

        if let Err(FtlError::Corrupted { vbn, page, .. }) = &written {
            let reason = ReadOnlyReason::MetaCorrupted {
                vbn: *vbn,
                page: *page,
            };
            self.mark_read_only(reason);
        }
        written?;

        let groups = std::mem::take(&mut self.dirty_groups).len();
        self.pending_side = SideEffect::None;
        self.ctx_dirty = false;
        debug!(zone = self.id, groups, "recovered state committed");
        Ok(())
    }

    /// Flush anything still dirty and release the zone
    pub fn close<N: Nand>(mut self, nand: &mut N) -> Result<()> {
        if self.is_writable() {
            self.commit(nand)?;
        }
        debug!(zone = self.id, "zone closed");
        Ok(())
    }
}
