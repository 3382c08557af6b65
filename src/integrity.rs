//! Integrity primitives: CRC32 over sector payloads, the zero-bit count (ZBC) checksum over meta
//! pages, redundant value/complement pairs, and the integrity-checked read used by every stage.

use crc::{Crc, CRC_32_ISO_HDLC};
use retry::{delay::Fixed, retry, OperationResult};
use tracing::warn;

use crate::error::{FtlError, Result};
use crate::nand::{Nand, ReadStatus, Vpn};

pub const FTL_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC32 of a sector payload
pub fn crc32(bytes: &[u8]) -> u32 {
    FTL_CRC.checksum(bytes)
}

/// Zero bits in every possible byte value
const ZERO_BITS: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).count_zeros() as u8;
        i += 1;
    }
    table
};

/// Count the zero bits of a buffer
///
/// Whole 8-byte words go through the population count; the trailing bytes go through a table.
pub fn zero_bits(bytes: &[u8]) -> u32 {
    let words = bytes.chunks_exact(8);
    let tail = words.remainder();

    let word_zeros: u32 = words
        .map(|w| {
            let mut word = [0u8; 8];
            word.copy_from_slice(w);
            u64::from_le_bytes(word).count_zeros()
        })
        .sum();
    let tail_zeros: u32 = tail.iter().map(|&b| u32::from(ZERO_BITS[b as usize])).sum();

    word_zeros + tail_zeros
}

/// A value stored alongside its bitwise complement
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Redundant {
    pub value: u32,
    pub inverse: u32,
}

impl Redundant {
    pub fn new(value: u32) -> Self {
        Self {
            value,
            inverse: !value,
        }
    }

    /// The value, if the pair are exact complements
    pub fn get(self) -> Option<u32> {
        (self.value == !self.inverse).then_some(self.value)
    }
}

/// Read a page, retrying read disturbance
///
/// Disturbance that persists beyond `retries` attempts is accepted: the data was still
/// corrected. All other outcomes are returned as they are.
pub fn read_checked<N: Nand>(
    nand: &mut N,
    vpn: Vpn,
    data: &mut [u8],
    spare: &mut [u8],
    clean_check: bool,
    retries: usize,
) -> Result<ReadStatus> {
    let outcome = retry(Fixed::from_millis(0).take(retries), || {
        match nand.read(vpn, data, spare, clean_check) {
            Ok(ReadStatus::Disturbance) => OperationResult::Retry(None),
            Ok(status) => OperationResult::Ok(status),
            Err(e) => OperationResult::Err(Some(e)),
        }
    });

    match outcome {
        Ok(status) => Ok(status),
        Err(failure) => match failure.error {
            Some(e) => Err(FtlError::Device(e)),
            None => {
                warn!(vpn, "read disturbance persisted through {retries} retries");
                Ok(ReadStatus::Success)
            }
        },
    }
}
