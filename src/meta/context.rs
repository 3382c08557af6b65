//! The context snapshot: a zone's transient runtime state (free blocks, open logs, buffer block
//! and in-flight merges), persisted so it survives power loss.

use std::collections::BTreeSet;

use bytes::BufMut;

use crate::log_block::LogState;
use crate::meta::layout::MetaLayout;
use crate::nand::Vbn;
use crate::util::{opt_u16, opt_u32, BufExt, NONE_U16, NONE_U32};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FreeBlock {
    pub vbn: Vbn,
    pub ec: u32,
}

/// A log block open for writing
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ActiveLog {
    pub vbn: Vbn,
    pub dgn: u32,
    pub ec: u32,
    pub state: LogState,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BufferState {
    Empty,
    Filling,
    Full,

    /// Holds corrupted pages; must be compacted before any further write
    Dirty,
}

impl From<BufferState> for u8 {
    fn from(value: BufferState) -> Self {
        match value {
            BufferState::Empty => 0,
            BufferState::Filling => 1,
            BufferState::Full => 2,
            BufferState::Dirty => 3,
        }
    }
}

impl TryFrom<u8> for BufferState {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(BufferState::Empty),
            1 => Ok(BufferState::Filling),
            2 => Ok(BufferState::Full),
            3 => Ok(BufferState::Dirty),
            _ => Err(()),
        }
    }
}

/// The block absorbing sub-page writes
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BufferBlock {
    pub vbn: Vbn,
    pub ec: u32,
    pub committed: u32,
    pub state: BufferState,
}

/// A data merge in flight: the group's logs are being folded into `dest`
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MergeVictim {
    pub dgn: u32,
    pub dest: FreeBlock,
}

/// A meta block reclaim in flight
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MetaMerge {
    pub victim: u16,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ContextSnapshot {
    pub free: Vec<FreeBlock>,
    pub active: Vec<ActiveLog>,
    pub buffer: Option<BufferBlock>,
    pub merge_victim: Option<MergeVictim>,
    pub meta_merge: Option<MetaMerge>,
}

impl ContextSnapshot {
    pub fn max_encoded_len(data_count: u32, max_active_logs: u32) -> usize {
        2 + 8 * data_count as usize + 2 + 16 * max_active_logs as usize + 16 + 12 + 4
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u16_le(self.free.len() as u16);
        for free in &self.free {
            buf.put_u32_le(free.vbn);
            buf.put_u32_le(free.ec);
        }

        buf.put_u16_le(self.active.len() as u16);
        for log in &self.active {
            buf.put_u32_le(log.vbn);
            buf.put_u32_le(log.dgn);
            buf.put_u32_le(log.ec);
            buf.put_u8(log.state.into());
            buf.put_bytes(0xFF, 3);
        }

        match self.buffer {
            Some(b) => {
                buf.put_u32_le(b.vbn);
                buf.put_u32_le(b.ec);
                buf.put_u32_le(b.committed);
                buf.put_u8(b.state.into());
            }
            None => {
                buf.put_u32_le(NONE_U32);
                buf.put_bytes(0xFF, 9);
            }
        }
        buf.put_bytes(0xFF, 3);

        match self.merge_victim {
            Some(m) => {
                buf.put_u32_le(m.dgn);
                buf.put_u32_le(m.dest.vbn);
                buf.put_u32_le(m.dest.ec);
            }
            None => buf.put_bytes(0xFF, 12),
        }

        buf.put_u16_le(self.meta_merge.map_or(NONE_U16, |m| m.victim));
        buf.put_u16_le(NONE_U16);
    }

    pub fn decode(buf: &mut &[u8]) -> Option<Self> {
        let free = (0..buf.try_u16_le()?)
            .map(|_| {
                Some(FreeBlock {
                    vbn: buf.try_u32_le()?,
                    ec: buf.try_u32_le()?,
                })
            })
            .collect::<Option<Vec<_>>>()?;

        let active = (0..buf.try_u16_le()?)
            .map(|_| {
                let log = ActiveLog {
                    vbn: buf.try_u32_le()?,
                    dgn: buf.try_u32_le()?,
                    ec: buf.try_u32_le()?,
                    state: LogState::try_from(buf.try_u8()?).ok()?,
                };
                buf.try_bytes(3)?;
                Some(log)
            })
            .collect::<Option<Vec<_>>>()?;

        let vbn = buf.try_u32_le()?;
        let ec = buf.try_u32_le()?;
        let committed = buf.try_u32_le()?;
        let state = buf.try_u8()?;
        buf.try_bytes(3)?;
        let buffer = match opt_u32(vbn) {
            Some(vbn) => Some(BufferBlock {
                vbn,
                ec,
                committed,
                state: BufferState::try_from(state).ok()?,
            }),
            None => None,
        };

        let dgn = buf.try_u32_le()?;
        let dest = FreeBlock {
            vbn: buf.try_u32_le()?,
            ec: buf.try_u32_le()?,
        };
        let merge_victim = opt_u32(dgn).map(|dgn| MergeVictim { dgn, dest });

        let meta_merge = opt_u16(buf.try_u16_le()?).map(|victim| MetaMerge { victim });
        buf.try_u16_le()?;

        Some(Self {
            free,
            active,
            buffer,
            merge_victim,
            meta_merge,
        })
    }

    /// Check the snapshot against the zone's layout
    ///
    /// Every referenced block must lie in the data area, and no block may be referenced twice.
    pub fn validate(&self, layout: &MetaLayout) -> Result<(), String> {
        let g = &layout.geometry;
        let mut seen = BTreeSet::new();
        let mut claim = |vbn: Vbn, what: &str| {
            if !layout.is_data_block(vbn) {
                return Err(format!("{what} block {vbn} outside the data area"));
            }
            if !seen.insert(vbn) {
                return Err(format!("{what} block {vbn} referenced twice"));
            }
            Ok(())
        };

        for free in &self.free {
            claim(free.vbn, "free")?;
        }
        for log in &self.active {
            claim(log.vbn, "active log")?;
        }
        if let Some(buffer) = self.buffer {
            claim(buffer.vbn, "buffer")?;
        }
        if let Some(merge) = self.merge_victim {
            claim(merge.dest.vbn, "merge destination")?;
        }

        if self.active.len() > g.max_active_logs as usize {
            return Err(format!("{} active logs", self.active.len()));
        }
        for log in &self.active {
            if log.dgn >= g.dgn_count() {
                return Err(format!("active log {} in unknown group {}", log.vbn, log.dgn));
            }
            if !matches!(log.state, LogState::Active | LogState::ActiveRandom) {
                return Err(format!("active log {} in state {:?}", log.vbn, log.state));
            }
        }
        if let Some(merge) = self.merge_victim {
            if merge.dgn >= g.dgn_count() {
                return Err(format!("merge of unknown group {}", merge.dgn));
            }
        }
        if let Some(buffer) = self.buffer {
            if buffer.committed > layout.nand.pages_per_block {
                return Err(format!("buffer committed offset {}", buffer.committed));
            }
        }
        if let Some(meta_merge) = self.meta_merge {
            if meta_merge.victim >= layout.meta_count() {
                return Err(format!("meta merge of unknown block {}", meta_merge.victim));
            }
        }

        Ok(())
    }

    /// Take the free block with the lowest erase count
    pub fn take_free_block(&mut self) -> Option<FreeBlock> {
        let (index, _) = self
            .free
            .iter()
            .enumerate()
            .min_by_key(|(_, block)| block.ec)?;
        Some(self.free.remove(index))
    }

    /// Return a block to the free list
    pub fn return_free(&mut self, block: FreeBlock) {
        if !self.free.iter().any(|b| b.vbn == block.vbn) {
            self.free.push(block);
        }
    }

    pub fn remove_free(&mut self, vbn: Vbn) -> Option<FreeBlock> {
        let index = self.free.iter().position(|b| b.vbn == vbn)?;
        Some(self.free.remove(index))
    }

    pub fn active_index(&self, vbn: Vbn) -> Option<usize> {
        self.active.iter().position(|log| log.vbn == vbn)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::RecoveryConfig;
    use crate::testutil::{test_geometry, TEST_NAND};

    fn sample() -> ContextSnapshot {
        ContextSnapshot {
            free: vec![
                FreeBlock { vbn: 20, ec: 5 },
                FreeBlock { vbn: 21, ec: 2 },
                FreeBlock { vbn: 22, ec: 2 },
            ],
            active: vec![ActiveLog {
                vbn: 30,
                dgn: 1,
                ec: 0,
                state: LogState::ActiveRandom,
            }],
            buffer: Some(BufferBlock {
                vbn: 6,
                ec: 1,
                committed: 4,
                state: BufferState::Filling,
            }),
            merge_victim: Some(MergeVictim {
                dgn: 3,
                dest: FreeBlock { vbn: 40, ec: 7 },
            }),
            meta_merge: Some(MetaMerge { victim: 2 }),
        }
    }

    #[test]
    fn test_codec() {
        let layout = MetaLayout::new(test_geometry(), TEST_NAND, &RecoveryConfig::default())
            .unwrap();
        let ctx = sample();
        let mut buf = Vec::new();
        ctx.encode(&mut buf);
        assert!(buf.len() <= ContextSnapshot::max_encoded_len(58, 4));
        assert_eq!(ContextSnapshot::decode(&mut &buf[..]), Some(ctx.clone()));
        assert_eq!(ctx.validate(&layout), Ok(()));

        let empty = ContextSnapshot::default();
        buf.clear();
        empty.encode(&mut buf);
        assert_eq!(ContextSnapshot::decode(&mut &buf[..]), Some(empty));
    }

    #[test]
    fn test_validate_disjoint() {
        let layout = MetaLayout::new(test_geometry(), TEST_NAND, &RecoveryConfig::default())
            .unwrap();

        let mut ctx = sample();
        ctx.free.push(FreeBlock { vbn: 30, ec: 0 });
        assert!(ctx.validate(&layout).is_err());

        let mut ctx = sample();
        ctx.free.push(FreeBlock { vbn: 3, ec: 0 });
        assert!(ctx.validate(&layout).is_err());

        let mut ctx = sample();
        ctx.active[0].state = LogState::Inactive;
        assert!(ctx.validate(&layout).is_err());
    }

    #[test]
    fn test_free_list() {
        let mut ctx = sample();
        assert_eq!(ctx.take_free_block(), Some(FreeBlock { vbn: 21, ec: 2 }));
        ctx.return_free(FreeBlock { vbn: 21, ec: 3 });
        ctx.return_free(FreeBlock { vbn: 21, ec: 3 });
        assert_eq!(ctx.free.len(), 3);
        assert_eq!(ctx.take_free_block(), Some(FreeBlock { vbn: 22, ec: 2 }));
        assert_eq!(ctx.remove_free(20), Some(FreeBlock { vbn: 20, ec: 5 }));
        assert_eq!(ctx.remove_free(20), None);
    }
}
