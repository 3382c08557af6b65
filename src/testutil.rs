//! Fixtures shared by the unit tests.

use crate::bitmap::SectorBitmap;
use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::meta::layout::{MetaLayout, ZoneGeometry};
use crate::nand::{CellType, Nand, NandLayout, Vbn};
use crate::spare::DataSpare;

pub const TEST_NAND: NandLayout = NandLayout {
    blocks: 64,
    pages_per_block: 32,
    bytes_per_page: 2048,
    spare_bytes: 64,
    cell: CellType::Mlc,
};

/// One zone: meta blocks 2..6, data blocks 6..64
pub fn test_geometry() -> ZoneGeometry {
    ZoneGeometry {
        meta_blocks: vec![2, 3, 4, 5],
        data_first: 6,
        data_count: 58,
        lan_count: 2,
        blocks_per_lan: 8,
        groups_per_lan: 2,
        logs_per_group: 3,
        max_active_logs: 4,
        wl_groups: 2,
    }
}

/// Two zones sharing the device after the root blocks 0 and 1
pub fn two_zones() -> Vec<ZoneGeometry> {
    let first = ZoneGeometry {
        data_count: 28,
        ..test_geometry()
    };
    let second = ZoneGeometry {
        meta_blocks: vec![34, 35, 36, 37],
        data_first: 38,
        data_count: 26,
        ..test_geometry()
    };
    vec![first, second]
}

pub fn test_layout() -> MetaLayout {
    MetaLayout::new(test_geometry(), TEST_NAND, &RecoveryConfig::default()).unwrap()
}

/// Page content that identifies the page it was written for
pub fn page_content(vbn: Vbn, page: u32, lpn: u32) -> Vec<u8> {
    (0..TEST_NAND.bytes_per_page)
        .map(|i| (i as u32 ^ vbn.wrapping_mul(31) ^ page.wrapping_mul(7) ^ lpn) as u8)
        .collect()
}

/// Program a full data page for `lpn` as the steady-state write path would
pub fn program_data_page<N: Nand>(
    nand: &mut N,
    vbn: Vbn,
    page: u32,
    lpn: u32,
    confirm: bool,
) -> Result<Vec<u8>> {
    let layout = nand.layout();
    program_sectors(nand, vbn, page, lpn, SectorBitmap::full(layout.sectors_per_page()), confirm)
}

/// Program a data page holding only `sectors` of `lpn`
pub fn program_sectors<N: Nand>(
    nand: &mut N,
    vbn: Vbn,
    page: u32,
    lpn: u32,
    sectors: SectorBitmap,
    confirm: bool,
) -> Result<Vec<u8>> {
    let layout = nand.layout();
    let data = page_content(vbn, page, lpn);
    let mut spare = vec![0xFF; layout.spare_bytes];
    DataSpare::new(lpn, sectors, confirm, &data).encode(&mut spare)?;
    nand.program(layout.vpn(vbn, page), &data, &spare)?;
    Ok(data)
}
