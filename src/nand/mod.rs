//! Abstractions and code to access raw NAND flash, including the out-of-band (spare) area
//!
//! VBNs handed to this layer are assumed to be already translated by the bad-block-aware layer
//! underneath; a [Nand] therefore never reports a block as bad.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{bail, ensure};

#[cfg(target_os = "linux")]
pub mod mtd;

/// Virtual block number: an erase block, after bad-block translation
pub type Vbn = u32;

/// Virtual page number: `vbn * pages_per_block + page`
pub type Vpn = u32;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// How many bits each cell of the device stores
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CellType {
    /// One bit per cell; every page is independent
    Slc,

    /// Two bits per cell. Page 0 is an unpaired LSB page; every odd page `p` is an LSB page
    /// sharing its cells with the MSB page `p + 1`. Interrupting the MSB program can destroy the
    /// already-written LSB page.
    Mlc,
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub spare_bytes: usize,
    pub cell: CellType,
}

impl NandLayout {
    pub fn vpn(&self, vbn: Vbn, page: u32) -> Vpn {
        vbn * self.pages_per_block + page
    }

    /// Split a [Vpn] into `(vbn, page)`
    pub fn split(&self, vpn: Vpn) -> (Vbn, u32) {
        (vpn / self.pages_per_block, vpn % self.pages_per_block)
    }

    pub fn sectors_per_page(&self) -> usize {
        self.bytes_per_page / crate::bitmap::SECTOR_SIZE
    }

    pub fn is_lsb_page(&self, page: u32) -> bool {
        match self.cell {
            CellType::Slc => true,
            CellType::Mlc => page == 0 || page % 2 == 1,
        }
    }

    /// The MSB page sharing cells with LSB page `page`, if any
    pub fn paired_msb(&self, page: u32) -> Option<u32> {
        match self.cell {
            CellType::Mlc if page % 2 == 1 && page + 1 < self.pages_per_block => Some(page + 1),
            _ => None,
        }
    }

    /// The LSB page sharing cells with MSB page `page`, if any
    pub fn paired_lsb(&self, page: u32) -> Option<u32> {
        match self.cell {
            CellType::Mlc if page != 0 && page % 2 == 0 => Some(page - 1),
            _ => None,
        }
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES+SPARE", optionally suffixed with ":mlc"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (dims, cell) = match s.split_once(':') {
            None => (s, CellType::Slc),
            Some((dims, "slc")) => (dims, CellType::Slc),
            Some((dims, "mlc")) => (dims, CellType::Mlc),
            Some((_, other)) => bail!("unknown cell type `{other}`"),
        };
        let (dims, spare_bytes) = dims
            .split_once('+')
            .ok_or(anyhow::anyhow!("expected #x#x#+#"))?;
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = dims
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#+#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;
        let spare_bytes = spare_bytes.parse()?;

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
            spare_bytes,
            cell,
        })
    }
}

/// Outcome of a page read that reached the flash
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadStatus {
    /// Data (and spare) read and corrected successfully
    Success,

    /// The page is erased; only reported when the caller asked for a clean check
    Clean,

    /// ECC could not correct the page
    ReadError,

    /// ECC corrected the page, but close to its limit; reading again may succeed cleanly
    Disturbance,
}

/// Represents a NAND flash device
///
/// An `Err` from any method is a physical-layer failure and aborts whatever operation is in
/// progress; recoverable page conditions are reported through [ReadStatus].
pub trait Nand {
    /// Get the layout of the NAND
    fn layout(&self) -> NandLayout;

    /// Read one page and its spare area
    ///
    /// With `clean_check`, an erased page reports [ReadStatus::Clean] instead of returning
    /// all-0xFF content.
    fn read(
        &mut self,
        vpn: Vpn,
        data: &mut [u8],
        spare: &mut [u8],
        clean_check: bool,
    ) -> anyhow::Result<ReadStatus>;

    /// Program one page and its spare area
    ///
    /// Pages within a block must be programmed in increasing order; programming a page makes it
    /// and all skipped pages nonwritable until the next erase.
    fn program(&mut self, vpn: Vpn, data: &[u8], spare: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self, vbn: Vbn) -> anyhow::Result<()>;

    /// Copy a page, spare included, without transferring it to the host
    fn copyback(&mut self, src: Vpn, dst: Vpn) -> anyhow::Result<()> {
        let layout = self.layout();
        let mut data = vec![0; layout.bytes_per_page];
        let mut spare = vec![0; layout.spare_bytes];
        match self.read(src, &mut data, &mut spare, false)? {
            ReadStatus::Success | ReadStatus::Disturbance => self.program(dst, &data, &spare),
            status => bail!("copyback source {src} unreadable: {status:?}"),
        }
    }

    /// Device-specific recovery read of an LSB page, exploiting the redundancy of its paired MSB
    /// page. Devices without such a mechanism report [ReadStatus::ReadError].
    fn reliable_read(
        &mut self,
        _vpn: Vpn,
        _data: &mut [u8],
        _spare: &mut [u8],
    ) -> anyhow::Result<ReadStatus> {
        Ok(ReadStatus::ReadError)
    }

    fn is_lsb_page(&self, page: u32) -> bool {
        self.layout().is_lsb_page(page)
    }
}

/// A fault the simulated device injects when a page is read
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fault {
    /// Every read fails ECC
    ReadError,

    /// Every normal read fails ECC, but [Nand::reliable_read] recovers the stored content
    Recoverable,

    /// The next `n` reads report disturbance, after which reads succeed
    Disturb(u32),

    /// The device itself fails the read
    DeviceError,

    /// The device fails the next program of the page
    ProgramError,
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
    faults: HashMap<Vpn, Fault>,
}

/// A block of SimNand
#[derive(Debug, Clone)]
struct SimBlock {
    /// All bytes (data then spare, per page) of all written pages (legally, can only append)
    data: Vec<u8>,

    /// Total bytes per page, including the spare area
    raw_page_size: usize,

    page_count: u32,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self {
            blocks,
            layout,
            faults: Default::default(),
        }
    }

    /// Make reads of `vpn` misbehave until it is programmed or erased again
    pub fn inject(&mut self, vpn: Vpn, fault: Fault) {
        self.faults.insert(vpn, fault);
    }

    /// Flip one bit of a stored page, `offset` counting data bytes then spare bytes
    pub fn flip_bit(&mut self, vpn: Vpn, offset: usize, bit: u8) -> anyhow::Result<()> {
        let (vbn, page) = self.layout.split(vpn);
        let block = self.block_mut(vbn)?;
        ensure!(offset < block.raw_page_size, "offset {offset} outside page");
        let index = page as usize * block.raw_page_size + offset;
        let byte = block
            .data
            .get_mut(index)
            .ok_or(anyhow::anyhow!("page {vpn} is not programmed"))?;
        *byte ^= 1 << (bit % 8);
        Ok(())
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let raw_page_size = self.layout.bytes_per_page + self.layout.spare_bytes;
        let mut buf = vec![0; raw_page_size * self.layout.pages_per_block as usize];

        for block in self.blocks.iter_mut() {
            read.read_exact(&mut buf)?;
            block.data.clear();
            for (page, content) in (0..).zip(buf.chunks_exact(raw_page_size)) {
                block.write_page(page, content)?;
            }
        }
        self.faults.clear();

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let raw_page_size = self.layout.bytes_per_page + self.layout.spare_bytes;
        let mut buf = vec![0; raw_page_size];

        for block in self.blocks.iter() {
            for page in 0..block.page_count {
                block.read_page(page, &mut buf)?;
                write.write_all(&buf)?;
            }
        }

        Ok(())
    }

    fn block_mut(&mut self, vbn: Vbn) -> anyhow::Result<&mut SimBlock> {
        self.blocks
            .get_mut(vbn as usize)
            .ok_or(anyhow::anyhow!("block {vbn} out of range"))
    }

    fn read_raw(&mut self, vpn: Vpn, data: &mut [u8], spare: &mut [u8]) -> anyhow::Result<()> {
        ensure!(data.len() == self.layout.bytes_per_page, "data not page-sized");
        ensure!(spare.len() == self.layout.spare_bytes, "spare not spare-sized");
        let (vbn, page) = self.layout.split(vpn);
        let bytes_per_page = self.layout.bytes_per_page;
        let block = self.block_mut(vbn)?;

        let mut raw = vec![0; block.raw_page_size];
        block.read_page(page, &mut raw)?;
        let (raw_data, raw_spare) = raw.split_at(bytes_per_page);
        data.copy_from_slice(raw_data);
        spare.copy_from_slice(raw_spare);
        Ok(())
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            data: Default::default(),
            raw_page_size: layout.bytes_per_page + layout.spare_bytes,
            page_count: layout.pages_per_block,
        }
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.raw_page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.raw_page_size;

        ensure!(begin >= self.data.len(), "write in already-written area");

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.raw_page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.raw_page_size;
        let end = begin + self.raw_page_size;

        if let Some(page) = self.data.get(begin..end) {
            content.copy_from_slice(page);
        } else {
            content.fill(0xFF);
        }

        Ok(())
    }
}

impl Nand for SimNand {
    fn layout(&self) -> NandLayout {
        self.layout
    }

    fn read(
        &mut self,
        vpn: Vpn,
        data: &mut [u8],
        spare: &mut [u8],
        clean_check: bool,
    ) -> anyhow::Result<ReadStatus> {
        self.read_raw(vpn, data, spare)?;

        let status = match self.faults.get_mut(&vpn) {
            Some(Fault::DeviceError) => bail!("simulated device failure reading page {vpn}"),
            Some(Fault::ReadError | Fault::Recoverable) => ReadStatus::ReadError,
            Some(Fault::Disturb(0) | Fault::ProgramError) | None => ReadStatus::Success,
            Some(Fault::Disturb(n)) => {
                *n -= 1;
                ReadStatus::Disturbance
            }
        };

        if status == ReadStatus::Success && clean_check && data.is_erased() && spare.is_erased()
        {
            return Ok(ReadStatus::Clean);
        }
        Ok(status)
    }

    fn program(&mut self, vpn: Vpn, data: &[u8], spare: &[u8]) -> anyhow::Result<()> {
        ensure!(data.len() == self.layout.bytes_per_page, "data not page-sized");
        ensure!(spare.len() == self.layout.spare_bytes, "spare not spare-sized");
        let (vbn, page) = self.layout.split(vpn);
        if let Some(Fault::ProgramError) = self.faults.remove(&vpn) {
            bail!("simulated program failure at page {vpn}");
        }

        let mut raw = Vec::with_capacity(data.len() + spare.len());
        raw.extend_from_slice(data);
        raw.extend_from_slice(spare);
        self.block_mut(vbn)?.write_page(page, &raw)?;
        self.faults.remove(&vpn);
        Ok(())
    }

    fn erase(&mut self, vbn: Vbn) -> anyhow::Result<()> {
        self.block_mut(vbn)?.data.clear();

        let layout = self.layout;
        self.faults
            .retain(|&vpn, _| layout.split(vpn).0 != vbn);
        Ok(())
    }

    fn reliable_read(
        &mut self,
        vpn: Vpn,
        data: &mut [u8],
        spare: &mut [u8],
    ) -> anyhow::Result<ReadStatus> {
        self.read_raw(vpn, data, spare)?;
        match self.faults.get(&vpn) {
            Some(Fault::DeviceError) => bail!("simulated device failure reading page {vpn}"),
            Some(Fault::ReadError) => Ok(ReadStatus::ReadError),
            _ => Ok(ReadStatus::Success),
        }
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 512,
    spare_bytes: 16,
    cell: CellType::Mlc,
};

#[test]
fn test_parse_layout() {
    let layout: NandLayout = "64x32x2048+64:mlc".parse().unwrap();
    assert_eq!(layout.blocks, 64);
    assert_eq!(layout.pages_per_block, 32);
    assert_eq!(layout.bytes_per_page, 2048);
    assert_eq!(layout.spare_bytes, 64);
    assert_eq!(layout.cell, CellType::Mlc);
    assert_eq!(layout.sectors_per_page(), 4);

    assert_eq!("8x4x512+16".parse::<NandLayout>().unwrap().cell, CellType::Slc);
    assert!("8x4x512".parse::<NandLayout>().is_err());
    assert!("8x4x512+16:qlc".parse::<NandLayout>().is_err());
}

#[test]
fn test_pairing() {
    assert!(TEST_LAYOUT.is_lsb_page(0));
    assert!(TEST_LAYOUT.is_lsb_page(7));
    assert!(!TEST_LAYOUT.is_lsb_page(8));
    assert_eq!(TEST_LAYOUT.paired_msb(7), Some(8));
    assert_eq!(TEST_LAYOUT.paired_lsb(8), Some(7));
    assert_eq!(TEST_LAYOUT.paired_msb(0), None);
    assert_eq!(TEST_LAYOUT.paired_msb(15), None);

    let slc = NandLayout {
        cell: CellType::Slc,
        ..TEST_LAYOUT
    };
    assert!(slc.is_lsb_page(8));
    assert_eq!(slc.paired_msb(7), None);
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; TEST_LAYOUT.bytes_per_page];
    let spare_in = vec![0x5Au8; TEST_LAYOUT.spare_bytes];
    let mut data_out = data_in.clone();
    let mut spare_out = spare_in.clone();

    nand.program(2, &data_in, &spare_in).unwrap();
    assert!(nand.program(1, &data_in, &spare_in).is_err());

    let status = nand.read(1, &mut data_out, &mut spare_out, true).unwrap();
    assert_eq!(status, ReadStatus::Clean);

    let status = nand.read(1, &mut data_out, &mut spare_out, false).unwrap();
    assert_eq!(status, ReadStatus::Success);
    assert!(data_out.is_erased());

    nand.read(2, &mut data_out, &mut spare_out, true).unwrap();
    assert_eq!(data_out, data_in);
    assert_eq!(spare_out, spare_in);

    nand.erase(0).unwrap();
    let status = nand.read(2, &mut data_out, &mut spare_out, true).unwrap();
    assert_eq!(status, ReadStatus::Clean);
}

#[test]
fn test_sim_faults() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let data_in = vec![0x11u8; TEST_LAYOUT.bytes_per_page];
    let spare_in = vec![0x22u8; TEST_LAYOUT.spare_bytes];
    let mut data = data_in.clone();
    let mut spare = spare_in.clone();

    nand.program(3, &data_in, &spare_in).unwrap();
    nand.inject(3, Fault::Disturb(2));
    assert_eq!(nand.read(3, &mut data, &mut spare, true).unwrap(), ReadStatus::Disturbance);
    assert_eq!(nand.read(3, &mut data, &mut spare, true).unwrap(), ReadStatus::Disturbance);
    assert_eq!(nand.read(3, &mut data, &mut spare, true).unwrap(), ReadStatus::Success);

    nand.inject(3, Fault::Recoverable);
    assert_eq!(nand.read(3, &mut data, &mut spare, true).unwrap(), ReadStatus::ReadError);
    data.fill(0);
    assert_eq!(nand.reliable_read(3, &mut data, &mut spare).unwrap(), ReadStatus::Success);
    assert_eq!(data, data_in);

    nand.inject(3, Fault::DeviceError);
    assert!(nand.read(3, &mut data, &mut spare, true).is_err());

    nand.erase(0).unwrap();
    assert_eq!(nand.read(3, &mut data, &mut spare, true).unwrap(), ReadStatus::Clean);

    // A failed program leaves the page erased, and the next one goes through
    nand.inject(3, Fault::ProgramError);
    assert!(nand.program(3, &data_in, &spare_in).is_err());
    assert_eq!(nand.read(3, &mut data, &mut spare, true).unwrap(), ReadStatus::Clean);
    nand.program(3, &data_in, &spare_in).unwrap();
    assert_eq!(nand.read(3, &mut data, &mut spare, true).unwrap(), ReadStatus::Success);
}

#[test]
fn test_sim_copyback_and_flip() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let data_in = vec![0x0Fu8; TEST_LAYOUT.bytes_per_page];
    let spare_in = vec![0xF0u8; TEST_LAYOUT.spare_bytes];
    let mut data = data_in.clone();
    let mut spare = spare_in.clone();

    nand.program(0, &data_in, &spare_in).unwrap();
    nand.copyback(0, TEST_LAYOUT.vpn(1, 0)).unwrap();
    nand.read(TEST_LAYOUT.vpn(1, 0), &mut data, &mut spare, true).unwrap();
    assert_eq!((data.clone(), spare.clone()), (data_in.clone(), spare_in.clone()));

    nand.flip_bit(0, 0, 0).unwrap();
    nand.read(0, &mut data, &mut spare, true).unwrap();
    assert_eq!(data[0], 0x0E);
    assert!(nand.flip_bit(5, 0, 0).is_err());
}

#[test]
fn test_sim_save_load() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let data_in = vec![0x42u8; TEST_LAYOUT.bytes_per_page];
    let spare_in = vec![0x24u8; TEST_LAYOUT.spare_bytes];
    nand.program(TEST_LAYOUT.vpn(3, 4), &data_in, &spare_in).unwrap();

    let mut image = Vec::new();
    nand.save(&mut image).unwrap();

    let mut copy = SimNand::new(TEST_LAYOUT);
    copy.load(&mut &image[..]).unwrap();

    let mut data = vec![0; TEST_LAYOUT.bytes_per_page];
    let mut spare = vec![0; TEST_LAYOUT.spare_bytes];
    let vpn = TEST_LAYOUT.vpn(3, 4);
    assert_eq!(copy.read(vpn, &mut data, &mut spare, true).unwrap(), ReadStatus::Success);
    assert_eq!(data, data_in);
    assert_eq!(copy.read(vpn - 1, &mut data, &mut spare, true).unwrap(), ReadStatus::Clean);
}
