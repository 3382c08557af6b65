//! The error type shared by every recovery stage.
//!
//! Physical-layer failures arrive from the [`crate::nand`] layer as `anyhow::Error`s and are
//! wrapped, unchanged, in [`FtlError::Device`]. Everything else is classified here so that the
//! proximate cause of a failed open survives propagation through every intermediate step.

use thiserror::Error;

use crate::log_block::LogState;

pub type Result<T, E = FtlError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum FtlError {
    /// No structurally valid, signature-tagged copy of a root or directory header exists
    #[error("no valid {0} found; the media is unformatted")]
    Unformatted(&'static str),

    /// The requested geometry cannot be laid out on this device
    #[error("invalid geometry: {0}")]
    Geometry(String),

    /// The caller asked for something inconsistent with what is on flash
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown cluster {0}")]
    UnknownCluster(u32),

    #[error("cluster {0} is busy")]
    ClusterBusy(u32),

    /// Every meta block is full and none can be reclaimed; carries the current meta VBN
    #[error("meta area exhausted at block {0}")]
    MetaFull(u32),

    /// A meta page that must be readable could not be validated
    #[error("corrupted {what} at VBN {vbn} page {page}")]
    Corrupted {
        what: &'static str,
        vbn: u32,
        page: u32,
    },

    #[error("illegal log block transition {from:?} -> {to:?}")]
    LogTransition { from: LogState, to: LogState },

    #[error("zone {0} is read-only")]
    ReadOnly(u32),

    #[error(transparent)]
    Encoding(#[from] deku::DekuError),

    /// Any error reported by the flash device itself; always fatal
    #[error(transparent)]
    Device(#[from] anyhow::Error),
}

impl FtlError {
    /// A distinct, stable result code for every kind of failure
    pub fn code(&self) -> u32 {
        match self {
            FtlError::Unformatted(_) => 1,
            FtlError::Geometry(_) => 2,
            FtlError::InvalidArgument(_) => 3,
            FtlError::UnknownCluster(_) => 4,
            FtlError::ClusterBusy(_) => 5,
            FtlError::MetaFull(_) => 6,
            FtlError::Corrupted { .. } => 7,
            FtlError::LogTransition { .. } => 8,
            FtlError::ReadOnly(_) => 9,
            FtlError::Encoding(_) => 10,
            FtlError::Device(_) => 11,
        }
    }
}

#[test]
fn test_codes_distinct() {
    let errors = [
        FtlError::Unformatted("root info"),
        FtlError::Geometry(String::new()),
        FtlError::InvalidArgument(String::new()),
        FtlError::UnknownCluster(0),
        FtlError::ClusterBusy(0),
        FtlError::MetaFull(0),
        FtlError::Corrupted {
            what: "page",
            vbn: 0,
            page: 0,
        },
        FtlError::LogTransition {
            from: LogState::Free,
            to: LogState::Inactive,
        },
        FtlError::ReadOnly(0),
        FtlError::Device(anyhow::anyhow!("boom")),
    ];

    let mut codes: Vec<u32> = errors.iter().map(FtlError::code).collect();
    codes.sort_unstable();
    codes.dedup();
    assert_eq!(codes.len(), errors.len());
}
