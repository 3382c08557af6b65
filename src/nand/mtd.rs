//! NAND abstraction layer implementation over the Linux MTD subsystem
//!
//! Data is read with `pread`, whose errno distinguishes corrected (`EUCLEAN`) from uncorrectable
//! (`EBADMSG`) ECC results. The spare area is accessed through the OOB ioctls in raw placement,
//! so the FTL sees exactly the bytes it programmed.

use super::{Nand, NandLayout, PageUtil, ReadStatus, Vbn, Vpn};

use anyhow::{bail, ensure};
use nix::errno::Errno;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    ///
    /// MTD does not report how cells are paired, so the caller supplies the cell type.
    pub fn open<P: AsRef<Path>>(path: P, cell: super::CellType) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let info = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        };
        let layout = info.into_layout(cell)?;

        Ok(Self { file, layout })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str, cell: super::CellType) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                if let Some(mtd_dev) = line.split(':').next() {
                    return Self::open(Path::new("/dev").join(mtd_dev), cell);
                }
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Compute the byte offset of the first byte of a page, checking bounds
    fn offset_for(&self, vpn: Vpn) -> anyhow::Result<u64> {
        let (vbn, _) = self.layout.split(vpn);
        ensure!(vbn < self.layout.blocks, "block {vbn} out of range");
        Ok(u64::from(vpn) * self.layout.bytes_per_page as u64)
    }

    fn read_oob(&self, offset: u64, spare: &mut [u8]) -> anyhow::Result<()> {
        let mut req = ioctl::mtd_oob_buf64 {
            start: offset,
            pad: 0,
            length: spare.len() as u32,
            usr_ptr: spare.as_mut_ptr() as u64,
        };
        unsafe {
            ioctl::memreadoob64(self.file.as_raw_fd(), &mut req)?;
        }
        Ok(())
    }
}

impl Nand for MtdNand {
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
        let offset = self.offset_for(vpn)?;
        let status = match self.file.read_exact_at(data, offset) {
            Ok(()) => ReadStatus::Success,
            Err(e) if e.raw_os_error() == Some(Errno::EUCLEAN as i32) => ReadStatus::Disturbance,
            Err(e) if e.raw_os_error() == Some(Errno::EBADMSG as i32) => {
                return Ok(ReadStatus::ReadError)
            }
            Err(e) => return Err(e.into()),
        };
        self.read_oob(offset, spare)?;

        if status == ReadStatus::Success && clean_check && data.is_erased() && spare.is_erased()
        {
            return Ok(ReadStatus::Clean);
        }
        Ok(status)
    }

    fn program(&mut self, vpn: Vpn, data: &[u8], spare: &[u8]) -> anyhow::Result<()> {
        ensure!(data.len() == self.layout.bytes_per_page, "data not page-sized");
        let mut req = ioctl::mtd_write_req {
            start: self.offset_for(vpn)?,
            len: data.len() as u64,
            ooblen: spare.len() as u64,
            usr_data: data.as_ptr() as u64,
            usr_oob: spare.as_ptr() as u64,
            mode: ioctl::MTD_OPS_RAW_OOB,
            padding: [0; 7],
        };
        unsafe {
            ioctl::memwrite(self.file.as_raw_fd(), &mut req)?;
        }
        Ok(())
    }

    fn erase(&mut self, vbn: Vbn) -> anyhow::Result<()> {
        ensure!(vbn < self.layout.blocks, "block {vbn} out of range");
        let size = self.layout.pages_per_block * self.layout.bytes_per_page as u32;
        let erase_info = ioctl::erase_info_user {
            start: size * vbn,
            length: size,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::super::{CellType, NandLayout};

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    /// `enum mtd_ops_mode`: OOB data placed exactly as given, without ECC layout translation
    pub const MTD_OPS_RAW_OOB: u8 = 0;

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl mtd_info_user {
        pub fn into_layout(self, cell: CellType) -> anyhow::Result<NandLayout> {
            ensure!(self.writesize > 1, "MTD device is not page-addressed");
            ensure!(self.oobsize > 0, "MTD device has no spare area");
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            Ok(NandLayout {
                blocks: self.size / self.erasesize,
                pages_per_block: self.erasesize / self.writesize,
                bytes_per_page: self.writesize as usize,
                spare_bytes: self.oobsize as usize,
                cell,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    #[repr(C)]
    pub struct mtd_oob_buf64 {
        pub start: u64,
        pub pad: u32,
        pub length: u32,
        pub usr_ptr: u64,
    }
    ioctl_readwrite!(memreadoob64, MTD_IOC_MAGIC, 22, mtd_oob_buf64);

    #[repr(C)]
    pub struct mtd_write_req {
        pub start: u64,
        pub len: u64,
        pub ooblen: u64,
        pub usr_data: u64,
        pub usr_oob: u64,
        pub mode: u8,
        pub padding: [u8; 7],
    }
    ioctl_readwrite!(memwrite, MTD_IOC_MAGIC, 24, mtd_write_req);
}
