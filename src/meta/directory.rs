//! The directory header: where every live structure of a zone currently lives, plus the
//! bookkeeping that decides which meta blocks can be reused.

use std::collections::VecDeque;

use bytes::BufMut;
use tracing::warn;

use crate::meta::layout::{MetaLayout, ZoneGeometry};
use crate::meta::page::SideEffect;
use crate::meta::MetaLoc;
use crate::nand::Vbn;
use crate::util::{opt_u32, BufExt, NONE_U32};

/// Per-group flag: a data merge of this group is in flight
pub const MERGE_VICTIM: u8 = 1;

/// A structure the directory tracks
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Structure {
    /// Block mapping table of a LAN
    Bmt(u32),

    /// Page mapping table (log group snapshot) of a DGN
    Pmt(u32),

    Context,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PmtEntry {
    pub loc: Option<MetaLoc>,

    /// Cached lowest erase count among the group's log blocks, and the block that has it
    pub min_ec: u32,
    pub min_vbn: Option<Vbn>,
}

impl PmtEntry {
    pub const EMPTY: PmtEntry = PmtEntry {
        loc: None,
        min_ec: u32::MAX,
        min_vbn: None,
    };
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WlGroup {
    pub min_ec: u32,
    pub min_vbn: Option<Vbn>,
}

impl WlGroup {
    pub const EMPTY: WlGroup = WlGroup {
        min_ec: u32::MAX,
        min_vbn: None,
    };
}

/// Meta blocks holding no live structure, in the order they became idle
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct IdleList(VecDeque<u16>);

impl IdleList {
    pub fn push(&mut self, block: u16) {
        if !self.0.contains(&block) {
            self.0.push_back(block);
        }
    }

    pub fn pop(&mut self) -> Option<u16> {
        self.0.pop_front()
    }

    pub fn remove(&mut self, block: u16) {
        self.0.retain(|&b| b != block);
    }

    pub fn contains(&self, block: u16) -> bool {
        self.0.contains(&block)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DirectoryHeader {
    pub bmt: Vec<Option<MetaLoc>>,
    pub pmt: Vec<PmtEntry>,

    /// Per-DGN flags
    pub flags: Vec<u8>,

    /// Live structures per meta block
    pub valid: Vec<u16>,

    pub idle: IdleList,
    pub wl: Vec<WlGroup>,
    pub context: Option<MetaLoc>,
}

impl DirectoryHeader {
    /// An empty directory with `current` as the current meta block, and every other block idle
    pub fn new(layout: &MetaLayout, current: u16) -> Self {
        let g = &layout.geometry;
        let mut idle = IdleList::default();
        for block in (0..layout.meta_count()).filter(|&b| b != current) {
            idle.push(block);
        }

        Self {
            bmt: vec![None; g.lan_count as usize],
            pmt: vec![PmtEntry::EMPTY; g.dgn_count() as usize],
            flags: vec![0; g.dgn_count() as usize],
            valid: vec![0; usize::from(layout.meta_count())],
            idle,
            wl: vec![WlGroup::EMPTY; g.wl_groups as usize],
            context: None,
        }
    }

    pub fn location(&self, structure: Structure) -> Option<MetaLoc> {
        match structure {
            Structure::Bmt(lan) => self.bmt.get(lan as usize).copied().flatten(),
            Structure::Pmt(dgn) => self.pmt.get(dgn as usize).and_then(|e| e.loc),
            Structure::Context => self.context,
        }
    }

    /// Point `structure` at `loc`, a page just written to (or replayed from) block `current`
    ///
    /// Returns false, changing nothing, if the structure does not exist in this zone.
    pub fn record(&mut self, structure: Structure, loc: MetaLoc, current: u16) -> bool {
        let slot = match structure {
            Structure::Bmt(lan) => self.bmt.get_mut(lan as usize),
            Structure::Pmt(dgn) => self.pmt.get_mut(dgn as usize).map(|e| &mut e.loc),
            Structure::Context => Some(&mut self.context),
        };
        let Some(slot) = slot else {
            return false;
        };

        let previous = slot.replace(loc);
        if let Some(previous) = previous {
            self.release(previous, current);
        }
        if let Some(count) = self.valid.get_mut(usize::from(loc.block)) {
            *count += 1;
        }
        self.idle.remove(loc.block);
        true
    }

    /// Drop one live structure from `loc`'s block; a block other than `current` that is left
    /// with none becomes idle
    pub fn release(&mut self, loc: MetaLoc, current: u16) {
        let Some(count) = self.valid.get_mut(usize::from(loc.block)) else {
            return;
        };
        if *count == 0 {
            warn!(block = loc.block, "valid count underflow");
            return;
        }
        *count -= 1;
        if *count == 0 && loc.block != current {
            self.idle.push(loc.block);
        }
    }

    pub fn is_merge_victim(&self, dgn: u32) -> bool {
        self.flags
            .get(dgn as usize)
            .is_some_and(|f| f & MERGE_VICTIM != 0)
    }

    /// Replay the side effect recorded with a page
    pub fn apply(&mut self, side: &SideEffect) {
        match *side {
            SideEffect::None => (),
            SideEffect::MergeFlag { dgn, set } => match self.flags.get_mut(dgn as usize) {
                Some(flags) if set => *flags |= MERGE_VICTIM,
                Some(flags) => *flags &= !MERGE_VICTIM,
                None => warn!(dgn, "merge flag for unknown group"),
            },
            SideEffect::WlCost {
                group,
                min_ec,
                min_vbn,
            } => match self.wl.get_mut(group as usize) {
                Some(wl) => *wl = WlGroup { min_ec, min_vbn },
                None => warn!(group, "WL cost for unknown group"),
            },
        }
    }

    /// Refresh a group's cached wear-leveling cost
    pub fn set_pmt_cost(&mut self, dgn: u32, min_ec: u32, min_vbn: Option<Vbn>) {
        if let Some(entry) = self.pmt.get_mut(dgn as usize) {
            entry.min_ec = min_ec;
            entry.min_vbn = min_vbn;
        }
    }

    /// Every live structure and where it is
    pub fn live_structures(&self) -> Vec<(Structure, MetaLoc)> {
        let bmt = (0..)
            .zip(&self.bmt)
            .filter_map(|(lan, loc)| Some((Structure::Bmt(lan), (*loc)?)));
        let pmt = (0..)
            .zip(&self.pmt)
            .filter_map(|(dgn, entry)| Some((Structure::Pmt(dgn), entry.loc?)));
        let context = self.context.map(|loc| (Structure::Context, loc));

        bmt.chain(pmt).chain(context).collect()
    }

    /// Live structures stored in `block`
    pub fn live_in(&self, block: u16) -> Vec<(Structure, MetaLoc)> {
        let mut live: Vec<_> = self
            .live_structures()
            .into_iter()
            .filter(|(_, loc)| loc.block == block)
            .collect();
        live.sort_by_key(|(_, loc)| *loc);
        live
    }

    pub fn valid_total(&self) -> u32 {
        self.valid.iter().map(|&v| u32::from(v)).sum()
    }

    /// The block a reclaim should empty: the non-current block holding the fewest live
    /// structures
    pub fn reclaim_victim(&self, current: u16) -> Option<u16> {
        (0..)
            .zip(&self.valid)
            .filter(|&(block, &valid)| block != current && valid > 0)
            .min_by_key(|&(_, &valid)| valid)
            .map(|(block, _)| block)
    }

    /// Upper bound on the encoded size of a header for `g`
    pub fn max_encoded_len(g: &ZoneGeometry) -> usize {
        let lans = g.lan_count as usize;
        let dgns = g.dgn_count() as usize;
        let metas = g.meta_blocks.len();
        4 + 8 + 4 * lans + 13 * dgns + 2 * metas + 2 + 2 * metas + 8 * g.wl_groups as usize + 4
    }

    /// Encode, prefixed with the encoded length
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.put_u16_le(self.bmt.len() as u16);
        body.put_u16_le(self.pmt.len() as u16);
        body.put_u16_le(self.valid.len() as u16);
        body.put_u16_le(self.wl.len() as u16);

        for &loc in &self.bmt {
            body.put_u32_le(MetaLoc::encode(loc));
        }
        for entry in &self.pmt {
            body.put_u32_le(MetaLoc::encode(entry.loc));
            body.put_u32_le(entry.min_ec);
            body.put_u32_le(entry.min_vbn.unwrap_or(NONE_U32));
        }
        body.put_slice(&self.flags);
        for &valid in &self.valid {
            body.put_u16_le(valid);
        }
        body.put_u16_le(self.idle.len() as u16);
        for block in self.idle.iter() {
            body.put_u16_le(block);
        }
        for wl in &self.wl {
            body.put_u32_le(wl.min_ec);
            body.put_u32_le(wl.min_vbn.unwrap_or(NONE_U32));
        }
        body.put_u32_le(MetaLoc::encode(self.context));

        let mut out = Vec::with_capacity(body.len() + 4);
        out.put_u32_le(body.len() as u32);
        out.extend_from_slice(&body);
        out
    }

    /// Decode a header, which must describe the zone laid out by `layout`
    pub fn decode(bytes: &[u8], layout: &MetaLayout) -> Option<Self> {
        let mut buf = bytes;
        let len = buf.try_u32_le()? as usize;
        let mut buf = buf.get(..len)?;

        let g = &layout.geometry;
        let lans = buf.try_u16_le()?;
        let dgns = buf.try_u16_le()?;
        let metas = buf.try_u16_le()?;
        let wls = buf.try_u16_le()?;
        if (u32::from(lans), u32::from(dgns), metas, u32::from(wls))
            != (g.lan_count, g.dgn_count(), layout.meta_count(), g.wl_groups)
        {
            return None;
        }

        let bmt = (0..lans)
            .map(|_| Some(MetaLoc::decode(buf.try_u32_le()?)))
            .collect::<Option<Vec<_>>>()?;
        let pmt = (0..dgns)
            .map(|_| {
                Some(PmtEntry {
                    loc: MetaLoc::decode(buf.try_u32_le()?),
                    min_ec: buf.try_u32_le()?,
                    min_vbn: opt_u32(buf.try_u32_le()?),
                })
            })
            .collect::<Option<Vec<_>>>()?;
        let flags = buf.try_bytes(usize::from(dgns))?;
        let valid = (0..metas)
            .map(|_| buf.try_u16_le())
            .collect::<Option<Vec<_>>>()?;

        let mut idle = IdleList::default();
        for _ in 0..buf.try_u16_le()? {
            let block = buf.try_u16_le()?;
            if block >= metas {
                return None;
            }
            idle.push(block);
        }

        let wl = (0..wls)
            .map(|_| {
                Some(WlGroup {
                    min_ec: buf.try_u32_le()?,
                    min_vbn: opt_u32(buf.try_u32_le()?),
                })
            })
            .collect::<Option<Vec<_>>>()?;
        let context = MetaLoc::decode(buf.try_u32_le()?);

        Some(Self {
            bmt,
            pmt,
            flags,
            valid,
            idle,
            wl,
            context,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::RecoveryConfig;
    use crate::testutil::{test_geometry, TEST_NAND};

    fn layout() -> MetaLayout {
        MetaLayout::new(test_geometry(), TEST_NAND, &RecoveryConfig::default()).unwrap()
    }

    #[test]
    fn test_record_and_release() {
        let layout = layout();
        let mut dir = DirectoryHeader::new(&layout, 0);
        assert_eq!(dir.idle.iter().collect::<Vec<_>>(), [1, 2, 3]);

        // Everything lands in block 0 first
        for lan in 0..2 {
            assert!(dir.record(Structure::Bmt(lan), MetaLoc::new(0, 1 + lan), 0));
        }
        assert!(dir.record(Structure::Context, MetaLoc::new(0, 3), 0));
        assert!(!dir.record(Structure::Bmt(2), MetaLoc::new(0, 4), 0));
        assert_eq!(dir.valid, [3, 0, 0, 0]);

        // Block 1 becomes current and takes over everything; block 0 goes idle
        dir.idle.remove(1);
        dir.record(Structure::Bmt(0), MetaLoc::new(1, 1), 1);
        dir.record(Structure::Bmt(1), MetaLoc::new(1, 2), 1);
        assert!(!dir.idle.contains(0));
        dir.record(Structure::Context, MetaLoc::new(1, 3), 1);
        assert_eq!(dir.valid, [0, 3, 0, 0]);
        assert_eq!(dir.idle.iter().collect::<Vec<_>>(), [2, 3, 0]);

        assert_eq!(dir.valid_total() as usize, dir.live_structures().len());
        assert_eq!(dir.reclaim_victim(2), Some(1));
        assert_eq!(dir.reclaim_victim(1), None);
        assert_eq!(dir.live_in(1).len(), 3);
    }

    #[test]
    fn test_current_block_never_idle() {
        let layout = layout();
        let mut dir = DirectoryHeader::new(&layout, 0);
        dir.record(Structure::Context, MetaLoc::new(0, 1), 0);
        dir.record(Structure::Context, MetaLoc::new(0, 2), 0);
        assert_eq!(dir.valid[0], 1);
        dir.release(MetaLoc::new(0, 2), 0);
        assert_eq!(dir.valid[0], 0);
        assert!(!dir.idle.contains(0));
    }

    #[test]
    fn test_side_effects() {
        let layout = layout();
        let mut dir = DirectoryHeader::new(&layout, 0);
        dir.apply(&SideEffect::MergeFlag { dgn: 2, set: true });
        assert!(dir.is_merge_victim(2));
        dir.apply(&SideEffect::MergeFlag { dgn: 2, set: false });
        assert!(!dir.is_merge_victim(2));

        dir.apply(&SideEffect::WlCost {
            group: 1,
            min_ec: 9,
            min_vbn: Some(33),
        });
        assert_eq!(
            dir.wl[1],
            WlGroup {
                min_ec: 9,
                min_vbn: Some(33)
            }
        );

        // Out of range side effects are ignored
        dir.apply(&SideEffect::MergeFlag { dgn: 99, set: true });
        assert_eq!(dir.flags, [0, 0, 0, 0]);
    }

    #[test]
    fn test_codec() {
        let layout = layout();
        let mut dir = DirectoryHeader::new(&layout, 2);
        dir.record(Structure::Pmt(3), MetaLoc::new(2, 5), 2);
        dir.set_pmt_cost(3, 4, Some(17));
        dir.apply(&SideEffect::MergeFlag { dgn: 1, set: true });

        let bytes = dir.encode();
        assert!(bytes.len() <= DirectoryHeader::max_encoded_len(&layout.geometry));
        assert_eq!(DirectoryHeader::decode(&bytes, &layout), Some(dir));

        // Trailing erased bytes (the rest of the page) are ignored
        let mut padded = bytes.clone();
        padded.resize(2000, 0xFF);
        assert!(DirectoryHeader::decode(&padded, &layout).is_some());
        assert!(DirectoryHeader::decode(&bytes[..bytes.len() - 1], &layout).is_none());
    }
}
