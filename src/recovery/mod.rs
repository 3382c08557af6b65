//! The open-time recovery stages, in the order the zone orchestrator runs them:
//!
//! 1. [scan]: find the current meta block and its authoritative directory header copy
//! 2. [replay]: replay the meta pages written after that copy
//! 3. [meta_merge]: finish an interrupted meta block reclaim
//! 4. [mapping]: load every block mapping table
//! 5. [context]: load the latest context snapshot and settle an in-flight data merge
//! 6. [active_log]: rebuild the page maps of the open log blocks
//! 7. [buffer]: rebuild the index of the buffer block

pub mod active_log;
pub mod buffer;
pub mod context;
pub mod mapping;
pub mod meta_merge;
pub mod replay;
pub mod scan;

use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::integrity::read_checked;
use crate::nand::{Nand, ReadStatus, Vbn};
use crate::spare::{DataSpare, SpareValidity};

/// Content of a page recovered through a reliable read
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Recovered {
    pub data: Vec<u8>,
    pub spare: Vec<u8>,
}

/// What a data page (in a log block or the buffer block) holds
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DataPage {
    Clean,

    Valid {
        spare: DataSpare,
        confirmed: bool,

        /// Set when the page was only readable through its paired MSB page
        recovered: Option<Recovered>,
    },

    Corrupted,
}

impl DataPage {
    pub fn is_programmed(&self) -> bool {
        !matches!(self, DataPage::Clean)
    }
}

/// Classify page `page` of data block `vbn`
///
/// An LSB page that fails ECC is retried through [Nand::reliable_read] when its paired MSB page
/// still decodes: the interrupted program that damaged it was the MSB program, and the device
/// can still reconstruct the LSB data.
pub fn classify_data_page<N: Nand>(
    nand: &mut N,
    vbn: Vbn,
    page: u32,
    cfg: &RecoveryConfig,
) -> Result<DataPage> {
    let layout = nand.layout();
    let sectors = layout.sectors_per_page();
    let mut data = vec![0; layout.bytes_per_page];
    let mut spare = vec![0; layout.spare_bytes];

    let status = read_checked(
        nand,
        layout.vpn(vbn, page),
        &mut data,
        &mut spare,
        true,
        cfg.read_retries,
    )?;

    let (validity, recovered) = match status {
        ReadStatus::Clean => return Ok(DataPage::Clean),
        ReadStatus::Success | ReadStatus::Disturbance => {
            (SpareValidity::of(&data, &spare, sectors), None)
        }
        ReadStatus::ReadError => {
            let Some(msb) = layout.paired_msb(page) else {
                return Ok(DataPage::Corrupted);
            };
            if !msb_decodes(nand, vbn, msb, cfg)? {
                return Ok(DataPage::Corrupted);
            }
            let vpn = layout.vpn(vbn, page);
            if nand.reliable_read(vpn, &mut data, &mut spare)? != ReadStatus::Success {
                return Ok(DataPage::Corrupted);
            }
            let validity = SpareValidity::of(&data, &spare, sectors);
            (validity, Some(Recovered { data, spare }))
        }
    };

    Ok(match validity {
        SpareValidity::Corrupted => DataPage::Corrupted,
        SpareValidity::Confirmed(spare) => DataPage::Valid {
            spare,
            confirmed: true,
            recovered,
        },
        SpareValidity::Plain(spare) => DataPage::Valid {
            spare,
            confirmed: false,
            recovered,
        },
    })
}

fn msb_decodes<N: Nand>(nand: &mut N, vbn: Vbn, page: u32, cfg: &RecoveryConfig) -> Result<bool> {
    let layout = nand.layout();
    let mut data = vec![0; layout.bytes_per_page];
    let mut spare = vec![0; layout.spare_bytes];
    let status = read_checked(
        nand,
        layout.vpn(vbn, page),
        &mut data,
        &mut spare,
        true,
        cfg.read_retries,
    )?;

    Ok(matches!(status, ReadStatus::Success | ReadStatus::Disturbance)
        && SpareValidity::of(&data, &spare, layout.sectors_per_page()) != SpareValidity::Corrupted)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{Fault, SimNand};
    use crate::testutil::{program_data_page, TEST_NAND};

    #[test]
    fn test_classify() -> Result<()> {
        let cfg = RecoveryConfig::default();
        let mut nand = SimNand::new(TEST_NAND);
        for page in 0..10 {
            program_data_page(&mut nand, 8, page, page * 3, page % 2 == 0)?;
        }

        match classify_data_page(&mut nand, 8, 2, &cfg)? {
            DataPage::Valid {
                spare,
                confirmed,
                recovered,
            } => {
                assert_eq!(spare.lpn, 6);
                assert!(confirmed);
                assert!(recovered.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(classify_data_page(&mut nand, 8, 10, &cfg)?, DataPage::Clean);

        // LSB page 7 fails ECC, but its MSB partner 8 decodes
        nand.inject(TEST_NAND.vpn(8, 7), Fault::Recoverable);
        assert!(matches!(
            classify_data_page(&mut nand, 8, 7, &cfg)?,
            DataPage::Valid {
                recovered: Some(_),
                ..
            }
        ));

        // Without a readable partner there is nothing to recover from
        nand.inject(TEST_NAND.vpn(8, 8), Fault::ReadError);
        assert_eq!(classify_data_page(&mut nand, 8, 7, &cfg)?, DataPage::Corrupted);

        // MSB pages are never recovered
        nand.inject(TEST_NAND.vpn(8, 4), Fault::Recoverable);
        assert_eq!(classify_data_page(&mut nand, 8, 4, &cfg)?, DataPage::Corrupted);
        Ok(())
    }
}
