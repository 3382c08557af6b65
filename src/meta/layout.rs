//! Per-zone constant geometry, and the derived meta layout that every stage works against.

use bytes::BufMut;

use crate::bitmap::{SECTOR_SIZE, MAX_SECTORS};
use crate::config::RecoveryConfig;
use crate::error::{FtlError, Result};
use crate::log_block::LogGroup;
use crate::meta::context::ContextSnapshot;
use crate::meta::directory::DirectoryHeader;
use crate::meta::page::PAGE_HEADER_SIZE;
use crate::meta::MetaLoc;
use crate::nand::{NandLayout, Vbn, Vpn};
use crate::spare::{DataSpare, MetaSpare};
use crate::util::BufExt;

/// The geometry of one zone, as recorded in the cluster's root info
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ZoneGeometry {
    /// Blocks dedicated to meta pages, in the order meta locations index them
    pub meta_blocks: Vec<Vbn>,

    /// First block of the zone's data area
    pub data_first: Vbn,
    pub data_count: u32,

    /// Logical address ranges; each one has its own block mapping table page
    pub lan_count: u32,
    pub blocks_per_lan: u32,

    /// Data groups per LAN; each one has its own log group
    pub groups_per_lan: u32,
    pub logs_per_group: u32,
    pub max_active_logs: u32,

    pub wl_groups: u32,
}

impl ZoneGeometry {
    pub fn dgn_count(&self) -> u32 {
        self.lan_count * self.groups_per_lan
    }

    pub fn blocks_per_group(&self) -> u32 {
        self.blocks_per_lan / self.groups_per_lan
    }

    pub fn logical_blocks(&self) -> u32 {
        self.lan_count * self.blocks_per_lan
    }

    pub fn data_blocks(&self) -> std::ops::Range<Vbn> {
        self.data_first..self.data_first + self.data_count
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u16_le(self.meta_blocks.len() as u16);
        for &vbn in &self.meta_blocks {
            buf.put_u32_le(vbn);
        }
        for value in [
            self.data_first,
            self.data_count,
            self.lan_count,
            self.blocks_per_lan,
            self.groups_per_lan,
            self.logs_per_group,
            self.max_active_logs,
            self.wl_groups,
        ] {
            buf.put_u32_le(value);
        }
    }

    pub fn decode(buf: &mut &[u8]) -> Option<Self> {
        let meta_count = buf.try_u16_le()?;
        let meta_blocks = (0..meta_count)
            .map(|_| buf.try_u32_le())
            .collect::<Option<Vec<_>>>()?;

        Some(Self {
            meta_blocks,
            data_first: buf.try_u32_le()?,
            data_count: buf.try_u32_le()?,
            lan_count: buf.try_u32_le()?,
            blocks_per_lan: buf.try_u32_le()?,
            groups_per_lan: buf.try_u32_le()?,
            logs_per_group: buf.try_u32_le()?,
            max_active_logs: buf.try_u32_le()?,
            wl_groups: buf.try_u32_le()?,
        })
    }
}

/// A zone's geometry, checked against the device it lives on
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MetaLayout {
    pub geometry: ZoneGeometry,
    pub nand: NandLayout,

    /// Pages taken by one copy of the directory header
    pub header_pages: u32,
}

impl MetaLayout {
    pub fn new(geometry: ZoneGeometry, nand: NandLayout, cfg: &RecoveryConfig) -> Result<Self> {
        let bad = |msg: String| Err(FtlError::Geometry(msg));
        let g = &geometry;

        if g.meta_blocks.len() < 2 || g.meta_blocks.len() >= usize::from(u16::MAX) {
            return bad(format!("{} meta blocks", g.meta_blocks.len()));
        }
        if g.lan_count == 0 || g.blocks_per_lan == 0 || g.groups_per_lan == 0 {
            return bad("empty logical address space".into());
        }
        if g.blocks_per_lan % g.groups_per_lan != 0 {
            return bad("LAN size not a multiple of the group count".into());
        }
        if g.logs_per_group == 0 || g.max_active_logs == 0 || g.wl_groups == 0 {
            return bad("zone needs log blocks and a WL group".into());
        }
        if g.dgn_count() > MetaSpare::MAX_INDEX {
            return bad(format!("{} data groups", g.dgn_count()));
        }

        let data = g.data_blocks();
        if data.end > nand.blocks || data.start >= data.end {
            return bad(format!("data area {data:?} outside device"));
        }
        // Buffer block, active logs and one spare for relocation
        if g.data_count < g.max_active_logs + 2 {
            return bad(format!("{} data blocks is too few", g.data_count));
        }
        for (i, &vbn) in g.meta_blocks.iter().enumerate() {
            if vbn >= nand.blocks || data.contains(&vbn) || g.meta_blocks[..i].contains(&vbn) {
                return bad(format!("meta block {vbn} unusable"));
            }
        }

        let sectors = nand.sectors_per_page();
        if nand.bytes_per_page % SECTOR_SIZE != 0 || sectors == 0 || sectors > MAX_SECTORS {
            return bad(format!("{}-byte pages", nand.bytes_per_page));
        }
        if nand.spare_bytes < MetaSpare::SIZE.max(DataSpare::size(sectors)) {
            return bad(format!("{}-byte spare area", nand.spare_bytes));
        }

        let payload = nand.bytes_per_page - PAGE_HEADER_SIZE;
        let header_len = DirectoryHeader::max_encoded_len(g);
        let header_pages = header_len.div_ceil(payload) as u32;

        let largest = [
            ("BMT page", 8 * g.blocks_per_lan as usize),
            (
                "context",
                ContextSnapshot::max_encoded_len(g.data_count, g.max_active_logs),
            ),
            (
                "group record",
                LogGroup::max_record_len(g.logs_per_group, nand.pages_per_block),
            ),
        ];
        for (what, len) in largest {
            if len > payload {
                return bad(format!("{what} of {len} bytes exceeds a page"));
            }
        }

        // Room for every structure, the reclaim bookkeeping, and one torn page
        let structures = g.lan_count + g.dgn_count() + 1;
        let usable = nand.pages_per_block.saturating_sub(header_pages);
        if usable < structures + cfg.meta_reserve + 1 {
            return bad(format!(
                "{usable} usable pages per meta block cannot hold {structures} structures"
            ));
        }

        Ok(Self {
            geometry,
            nand,
            header_pages,
        })
    }

    pub fn meta_count(&self) -> u16 {
        self.geometry.meta_blocks.len() as u16
    }

    pub fn meta_vbn(&self, block: u16) -> Option<Vbn> {
        self.geometry.meta_blocks.get(usize::from(block)).copied()
    }

    pub fn meta_vpn(&self, loc: MetaLoc) -> Option<Vpn> {
        if u32::from(loc.page) >= self.nand.pages_per_block {
            return None;
        }
        Some(self.nand.vpn(self.meta_vbn(loc.block)?, u32::from(loc.page)))
    }

    /// Bytes available to a payload in one meta page
    pub fn payload_size(&self) -> usize {
        self.nand.bytes_per_page - PAGE_HEADER_SIZE
    }

    /// Meta pages needed per block for every live structure
    pub fn structures(&self) -> u32 {
        self.geometry.lan_count + self.geometry.dgn_count() + 1
    }

    /// Logical pages addressed by one data group
    pub fn pages_per_group(&self) -> u32 {
        self.geometry.blocks_per_group() * self.nand.pages_per_block
    }

    /// Logical pages addressed by the whole zone
    pub fn zone_pages(&self) -> u32 {
        self.geometry.logical_blocks() * self.nand.pages_per_block
    }

    pub fn is_data_block(&self, vbn: Vbn) -> bool {
        self.geometry.data_blocks().contains(&vbn)
    }
}
