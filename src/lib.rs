//! Open-time recovery for a NAND flash translation layer: rebuilds the RAM state of every zone of
//! a cluster from the meta blocks and data spares left on flash by an unclean shutdown.

pub mod bitmap;
pub mod cluster;
pub mod config;
pub mod error;
pub mod integrity;
pub mod log_block;
pub mod meta;
pub mod nand;
pub mod recovery;
pub mod spare;
pub mod zone;

mod util;

#[cfg(test)]
mod testutil;

pub use cluster::Registry;
pub use config::{OpenFlags, RecoveryConfig};
pub use error::{FtlError, Result};
