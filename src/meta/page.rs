//! The meta page codec: a fixed page header followed by a payload whose interpretation depends on
//! the page type in the spare area.

use deku::{DekuContainerRead, DekuContainerWrite, DekuRead, DekuUpdate, DekuWrite};

use crate::error::{FtlError, Result};
use crate::integrity::read_checked;
use crate::log_block::LogGroup;
use crate::meta::context::ContextSnapshot;
use crate::meta::mapping::BlockMapPage;
use crate::meta::root::RootInfo;
use crate::meta::{Age, PageType};
use crate::nand::{Nand, ReadStatus, Vbn, Vpn};
use crate::spare::MetaSpare;
use crate::util::{opt_u32, NONE_U32};

pub const PAGE_MAGIC: u32 = u32::from_le_bytes(*b"FTLM");
pub const PAGE_HEADER_SIZE: usize = 20;

#[derive(Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct RawPageHeader {
    magic: u32,
    kind: u8,
    side: u8,
    count: u16,
    side_a: u32,
    side_b: u32,
    side_c: u32,
}

/// A directory update recorded along with a meta page, replayed when the page is
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum SideEffect {
    #[default]
    None,

    /// Set or clear the merge-victim flag of a data group
    MergeFlag { dgn: u32, set: bool },

    /// Update the cached wear-leveling cost of a WL group
    WlCost {
        group: u32,
        min_ec: u32,
        min_vbn: Option<Vbn>,
    },
}

impl SideEffect {
    fn to_raw(self) -> (u8, [u32; 3]) {
        match self {
            SideEffect::None => (0, [0; 3]),
            SideEffect::MergeFlag { dgn, set: true } => (1, [dgn, 0, 0]),
            SideEffect::MergeFlag { dgn, set: false } => (2, [dgn, 0, 0]),
            SideEffect::WlCost {
                group,
                min_ec,
                min_vbn,
            } => (3, [group, min_ec, min_vbn.unwrap_or(NONE_U32)]),
        }
    }

    fn from_raw(side: u8, [a, b, c]: [u32; 3]) -> Option<Self> {
        match side {
            0 => Some(SideEffect::None),
            1 => Some(SideEffect::MergeFlag { dgn: a, set: true }),
            2 => Some(SideEffect::MergeFlag { dgn: a, set: false }),
            3 => Some(SideEffect::WlCost {
                group: a,
                min_ec: b,
                min_vbn: opt_u32(c),
            }),
            _ => None,
        }
    }
}

/// What a meta page holds, keyed by its page type
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MetaPayload {
    Root(RootInfo),

    /// One page of a directory header copy; `bytes` is the page's whole payload area
    Header { part: u32, parts: u16, bytes: Vec<u8> },

    Bmt(BlockMapPage),

    /// Snapshots of one or more log groups
    Pmt(Vec<LogGroup>),

    Context(ContextSnapshot),
}

/// A decoded meta page
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MetaPage {
    pub side: SideEffect,
    pub payload: MetaPayload,
}

impl MetaPage {
    pub fn new(payload: MetaPayload) -> Self {
        Self {
            side: SideEffect::None,
            payload,
        }
    }

    pub fn with_side(mut self, side: SideEffect) -> Self {
        self.side = side;
        self
    }

    pub fn kind(&self) -> PageType {
        match self.payload {
            MetaPayload::Root(_) => PageType::Root,
            MetaPayload::Header { .. } => PageType::Header,
            MetaPayload::Bmt(_) => PageType::Bmt,
            MetaPayload::Pmt(_) => PageType::Pmt,
            MetaPayload::Context(_) => PageType::Context,
        }
    }

    /// The index stored in the spare tag
    pub fn index(&self) -> u32 {
        match &self.payload {
            MetaPayload::Header { part, .. } => *part,
            MetaPayload::Bmt(bmt) => bmt.lan,
            MetaPayload::Pmt(groups) => groups.first().map_or(0, |g| g.dgn),
            MetaPayload::Root(_) | MetaPayload::Context(_) => 0,
        }
    }

    /// Produce the full data area of a page of `page_size` bytes
    pub fn encode(&self, page_size: usize) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        let count = match &self.payload {
            MetaPayload::Root(root) => {
                root.encode(&mut payload);
                1
            }
            MetaPayload::Header { parts, bytes, .. } => {
                payload.extend_from_slice(bytes);
                *parts
            }
            MetaPayload::Bmt(bmt) => {
                bmt.encode(&mut payload);
                bmt.entries.len() as u16
            }
            MetaPayload::Pmt(groups) => {
                for group in groups {
                    group.encode_record(&mut payload);
                }
                groups.len() as u16
            }
            MetaPayload::Context(ctx) => {
                ctx.encode(&mut payload);
                1
            }
        };

        let (side, [side_a, side_b, side_c]) = self.side.to_raw();
        let header = RawPageHeader {
            magic: PAGE_MAGIC,
            kind: self.kind().into(),
            side,
            count,
            side_a,
            side_b,
            side_c,
        }
        .to_bytes()?;

        if header.len() + payload.len() > page_size {
            return Err(FtlError::Geometry(format!(
                "{} payload of {} bytes exceeds a page",
                self.kind().name(),
                payload.len()
            )));
        }

        let mut data = Vec::with_capacity(page_size);
        data.extend_from_slice(&header);
        data.extend_from_slice(&payload);
        data.resize(page_size, 0xFF);
        Ok(data)
    }

    /// Decode a data area tagged `kind`/`index` in its spare
    pub fn decode(kind: PageType, index: u32, data: &[u8]) -> Option<Self> {
        let ((rest, _), raw) = RawPageHeader::from_bytes((data, 0)).ok()?;
        if raw.magic != PAGE_MAGIC || PageType::try_from(raw.kind).ok()? != kind {
            return None;
        }
        let side = SideEffect::from_raw(raw.side, [raw.side_a, raw.side_b, raw.side_c])?;
        let mut buf = rest;

        let payload = match kind {
            PageType::Root => MetaPayload::Root(RootInfo::decode(&mut buf)?),
            PageType::Header => MetaPayload::Header {
                part: index,
                parts: raw.count,
                bytes: rest.to_vec(),
            },
            PageType::Bmt => {
                let bmt = BlockMapPage::decode(&mut buf, index, usize::from(raw.count))?;
                MetaPayload::Bmt(bmt)
            }
            PageType::Pmt => {
                let groups = (0..raw.count)
                    .map(|_| LogGroup::decode_record(&mut buf))
                    .collect::<Option<Vec<_>>>()?;
                MetaPayload::Pmt(groups)
            }
            PageType::Context => MetaPayload::Context(ContextSnapshot::decode(&mut buf)?),
        };

        Some(Self { side, payload })
    }
}

/// What reading a meta page found
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PageRead {
    /// Never programmed
    Clean,

    /// ECC failed
    Unreadable,

    /// Programmed, but the spare, checksum or page header is not valid
    Invalid,

    Valid(MetaSpare, MetaPage),
}

/// Read and validate one meta page
pub fn read_meta<N: Nand>(nand: &mut N, vpn: Vpn, retries: usize) -> Result<PageRead> {
    let layout = nand.layout();
    let mut data = vec![0; layout.bytes_per_page];
    let mut spare = vec![0; layout.spare_bytes];

    match read_checked(nand, vpn, &mut data, &mut spare, true, retries)? {
        ReadStatus::Clean => return Ok(PageRead::Clean),
        ReadStatus::ReadError => return Ok(PageRead::Unreadable),
        ReadStatus::Success | ReadStatus::Disturbance => (),
    }

    let Some(meta) = MetaSpare::decode(&spare) else {
        return Ok(PageRead::Invalid);
    };
    if !meta.matches(&data) {
        return Ok(PageRead::Invalid);
    }

    Ok(match MetaPage::decode(meta.kind, meta.index, &data) {
        Some(page) => PageRead::Valid(meta, page),
        None => PageRead::Invalid,
    })
}

/// Program one meta page with `age`
pub fn program_meta<N: Nand>(nand: &mut N, vpn: Vpn, age: Age, page: &MetaPage) -> Result<()> {
    let layout = nand.layout();
    let data = page.encode(layout.bytes_per_page)?;

    let mut spare = vec![0xFF; layout.spare_bytes];
    MetaSpare::for_page(age, page.kind(), page.index(), &data).encode(&mut spare)?;

    nand.program(vpn, &data, &spare)?;
    Ok(())
}
