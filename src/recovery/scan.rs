//! Finding the newest valid root info and directory header copies.
//!
//! Every candidate block keeps its first page for a copy of the structure it holds. The newest
//! structurally valid copy wins; within the winning meta block, mid-block header checkpoints
//! may supersede the copy at page 0.

use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::error::{FtlError, Result};
use crate::meta::directory::DirectoryHeader;
use crate::meta::layout::MetaLayout;
use crate::meta::page::{read_meta, MetaPayload, PageRead};
use crate::meta::root::RootInfo;
use crate::meta::{Age, PageType};
use crate::nand::{Nand, Vbn};

/// What the first page of a candidate block holds
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Candidate {
    /// Never programmed
    Clean,

    /// The page failed ECC. The block is never considered again during this open.
    Corrupted,

    /// Programmed, but not a valid copy of the structure scanned for
    Invalid,

    Valid(Age),
}

/// Classify the first page of every block in `vbns`
pub fn scan_candidates<N: Nand>(
    nand: &mut N,
    vbns: &[Vbn],
    kind: PageType,
    cfg: &RecoveryConfig,
) -> Result<Vec<Candidate>> {
    let layout = nand.layout();
    let rpt = howudoin::new()
        .label(format!("Scanning for {}", kind.name()))
        .set_len(vbns.len() as u64);

    let mut candidates = Vec::with_capacity(vbns.len());
    for &vbn in vbns {
        let candidate = match read_meta(nand, layout.vpn(vbn, 0), cfg.read_retries)? {
            PageRead::Clean => Candidate::Clean,
            PageRead::Unreadable => {
                warn!(vbn, "first page unreadable; candidate dropped");
                Candidate::Corrupted
            }
            PageRead::Valid(spare, _) if spare.kind == kind && spare.index == 0 => {
                Candidate::Valid(spare.age)
            }
            PageRead::Valid(..) | PageRead::Invalid => Candidate::Invalid,
        };
        debug!(vbn, ?candidate, "candidate scanned");
        candidates.push(candidate);
        rpt.inc();
    }

    rpt.close();
    Ok(candidates)
}

/// Indices of the valid candidates, newest first
pub fn newest_first(candidates: &[Candidate]) -> Vec<usize> {
    let mut valid: Vec<(usize, Age)> = candidates
        .iter()
        .enumerate()
        .filter_map(|(i, c)| match *c {
            Candidate::Valid(age) => Some((i, age)),
            _ => None,
        })
        .collect();

    let newest = valid
        .iter()
        .map(|&(_, age)| age)
        .reduce(|a, b| if b.is_newer_than(a) { b } else { a });
    let Some(newest) = newest else {
        return Vec::new();
    };

    // Distance from the newest age orders the rest, even across a wrap
    valid.sort_by_key(|&(_, age)| (age.high.wrapping_sub(newest.high), age.low));
    valid.into_iter().map(|(i, _)| i).collect()
}

/// Locate the cluster's root info among its root blocks
pub fn locate_root<N: Nand>(
    nand: &mut N,
    root_blocks: &[Vbn],
    cfg: &RecoveryConfig,
) -> Result<(Age, RootInfo)> {
    let layout = nand.layout();
    let candidates = scan_candidates(nand, root_blocks, PageType::Root, cfg)?;

    for index in newest_first(&candidates) {
        let vbn = root_blocks[index];
        if let PageRead::Valid(spare, page) = read_meta(nand, layout.vpn(vbn, 0), cfg.read_retries)?
        {
            if let MetaPayload::Root(root) = page.payload {
                info!(vbn, age = ?spare.age, cluster = root.cluster, "root info found");
                return Ok((spare.age, root));
            }
        }
        warn!(vbn, "root info changed between scan and read");
    }

    Err(FtlError::Unformatted(PageType::Root.name()))
}

/// Read the header copy starting at page `at` of meta block `block`
///
/// Every part must be valid and carry the same age. Returns `None` for an incomplete or
/// otherwise unusable copy.
pub fn read_header_copy<N: Nand>(
    nand: &mut N,
    layout: &MetaLayout,
    block: u16,
    at: u32,
    cfg: &RecoveryConfig,
) -> Result<Option<(Age, DirectoryHeader)>> {
    let Some(vbn) = layout.meta_vbn(block) else {
        return Ok(None);
    };
    if at + layout.header_pages > layout.nand.pages_per_block {
        return Ok(None);
    }

    let mut age = None;
    let mut blob = Vec::new();
    for part in 0..layout.header_pages {
        let PageRead::Valid(spare, page) =
            read_meta(nand, layout.nand.vpn(vbn, at + part), cfg.read_retries)?
        else {
            return Ok(None);
        };
        let MetaPayload::Header { parts, bytes, .. } = page.payload else {
            return Ok(None);
        };
        if spare.index != part || u32::from(parts) != layout.header_pages {
            return Ok(None);
        }
        if *age.get_or_insert(spare.age) != spare.age {
            return Ok(None);
        }
        blob.extend_from_slice(&bytes);
    }

    let Some(age) = age else {
        return Ok(None);
    };
    Ok(DirectoryHeader::decode(&blob, layout).map(|dir| (age, dir)))
}

/// The authoritative directory header copy of a zone, and where its block's log ends
#[derive(Debug, Clone)]
pub struct LocatedHeader {
    /// Index of the current meta block
    pub current: u16,

    /// Age of the copy at page 0 of the current block
    pub block_age: Age,

    /// First page of the authoritative copy, and its age
    pub header_at: u32,
    pub age: Age,

    /// First page of the current block that was never written
    pub committed: u32,

    pub dir: DirectoryHeader,

    /// How every meta block's first page scanned
    pub candidates: Vec<Candidate>,
}

/// Find the current meta block, its authoritative header copy and its committed offset
pub fn locate_header<N: Nand>(
    nand: &mut N,
    layout: &MetaLayout,
    cfg: &RecoveryConfig,
) -> Result<LocatedHeader> {
    let mut candidates =
        scan_candidates(nand, &layout.geometry.meta_blocks, PageType::Header, cfg)?;

    let mut winner = None;
    for index in newest_first(&candidates) {
        let block = index as u16;
        match read_header_copy(nand, layout, block, 0, cfg)? {
            Some((age, dir)) => {
                winner = Some((block, age, dir));
                break;
            }
            None => {
                warn!(block, "incomplete header copy; trying an older block");
                candidates[index] = Candidate::Invalid;
            }
        }
    }
    let Some((current, block_age, dir)) = winner else {
        return Err(FtlError::Unformatted(PageType::Header.name()));
    };

    let mut located = LocatedHeader {
        current,
        block_age,
        header_at: 0,
        age: block_age,
        committed: layout.nand.pages_per_block,
        dir,
        candidates,
    };
    scan_tail(nand, layout, &mut located, cfg)?;

    info!(
        current,
        age = ?located.age,
        header_at = located.header_at,
        committed = located.committed,
        "directory header located"
    );
    Ok(located)
}

/// Walk the current block up to its first clean page, adopting newer complete header
/// checkpoints along the way
fn scan_tail<N: Nand>(
    nand: &mut N,
    layout: &MetaLayout,
    located: &mut LocatedHeader,
    cfg: &RecoveryConfig,
) -> Result<()> {
    let ppb = layout.nand.pages_per_block;
    let vbn = layout.meta_vbn(located.current).unwrap_or(u32::MAX);

    let mut page = layout.header_pages;
    while page < ppb {
        match read_meta(nand, layout.nand.vpn(vbn, page), cfg.read_retries)? {
            PageRead::Clean => {
                located.committed = page;
                return Ok(());
            }
            PageRead::Unreadable => {
                // Most likely the page being programmed when power was lost
                let next_clean = page + 1 == ppb
                    || read_meta(nand, layout.nand.vpn(vbn, page + 1), cfg.read_retries)?
                        == PageRead::Clean;
                if next_clean {
                    warn!(vbn, page, "unreadable tail page taken as unwritten");
                    located.committed = page;
                    return Ok(());
                }
            }
            PageRead::Valid(spare, _)
                if spare.kind == PageType::Header
                    && spare.index == 0
                    && spare.age.high == located.age.high
                    && spare.age.is_newer_than(located.age) =>
            {
                if let Some((age, dir)) =
                    read_header_copy(nand, layout, located.current, page, cfg)?
                {
                    debug!(page, ?age, "header checkpoint adopted");
                    located.header_at = page;
                    located.age = age;
                    located.dir = dir;
                    page += layout.header_pages;
                    continue;
                }
            }
            PageRead::Valid(..) | PageRead::Invalid => (),
        }
        page += 1;
    }

    located.committed = ppb;
    Ok(())
}
