//! Tunables for the recovery engine and the per-open flags.

/// Parameters that are tied to the device or to the meta commit policy rather than to the
/// on-flash format. Changing these never breaks compatibility with existing media.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RecoveryConfig {
    /// Longest run of clean pages inside a log that is still considered sequential. Multi-plane
    /// devices may commit the pages of a stripe out of order, leaving short holes at power loss.
    pub skew_tolerance: u32,

    /// How many times a read reporting disturbance is retried before its data is taken as-is
    pub read_retries: usize,

    /// Pages kept free in the current meta block for reclaim bookkeeping once the idle pool is
    /// empty: one records the reclaim, one clears it, one absorbs a torn write
    pub meta_reserve: u32,

    /// Write a fresh header copy into the current meta block after this many pages, bounding
    /// the replay done at open; 0 disables checkpoints
    pub checkpoint_interval: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            skew_tolerance: 1,
            read_retries: 3,
            meta_reserve: 3,
            checkpoint_interval: 16,
        }
    }
}

/// Flags accepted by [`crate::Registry::open_cluster`]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct OpenFlags {
    /// Rebuild RAM state only; never program or erase anything during the open
    pub read_only: bool,
}
