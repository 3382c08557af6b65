//! Log blocks and log groups: the page-mapped blocks absorbing writes to a data group, and the
//! snapshots of them persisted in page mapping table pages.

use std::collections::BTreeMap;

use bytes::BufMut;

use crate::error::{FtlError, Result};
use crate::integrity::{zero_bits, Redundant};
use crate::nand::{NandLayout, Vbn};
use crate::util::{opt_u32, BufExt, NONE_U32};

/// The states of a log block
///
/// `Free -> Active -> ActiveRandom -> Inactive -> Free`, and `Active -> Inactive`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LogState {
    Free,

    /// Open for writing, pages appended sequentially
    Active,

    /// Open for writing after a page was skipped or lost; only changes where the next write
    /// goes
    ActiveRandom,

    /// Out of the active window, still holding live pages
    Inactive,
}

impl LogState {
    fn to(self, to: LogState, allowed: bool) -> Result<LogState> {
        if allowed {
            Ok(to)
        } else {
            Err(FtlError::LogTransition { from: self, to })
        }
    }

    pub fn activate(self) -> Result<LogState> {
        self.to(LogState::Active, self == LogState::Free)
    }

    pub fn mark_random(self) -> Result<LogState> {
        self.to(
            LogState::ActiveRandom,
            matches!(self, LogState::Active | LogState::ActiveRandom),
        )
    }

    pub fn deactivate(self) -> Result<LogState> {
        self.to(LogState::Inactive, self.is_active())
    }

    pub fn reclaim(self) -> Result<LogState> {
        self.to(LogState::Free, self == LogState::Inactive)
    }

    pub fn is_active(self) -> bool {
        matches!(self, LogState::Active | LogState::ActiveRandom)
    }
}

impl From<LogState> for u8 {
    fn from(value: LogState) -> Self {
        match value {
            LogState::Free => 0,
            LogState::Active => 1,
            LogState::ActiveRandom => 2,
            LogState::Inactive => 3,
        }
    }
}

impl TryFrom<u8> for LogState {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, ()> {
        match value {
            0 => Ok(LogState::Free),
            1 => Ok(LogState::Active),
            2 => Ok(LogState::ActiveRandom),
            3 => Ok(LogState::Inactive),
            _ => Err(()),
        }
    }
}

/// One log block and its logical<->physical page maps
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogBlock {
    pub vbn: Vbn,
    pub ec: u32,

    /// First page never written
    pub committed: u32,
    pub state: LogState,

    /// Logical page offset held by each physical page
    p2l: Vec<Option<u32>>,

    /// Newest physical page of each logical page offset
    l2p: BTreeMap<u32, u32>,
}

impl LogBlock {
    pub fn new(vbn: Vbn, ec: u32) -> Self {
        Self {
            vbn,
            ec,
            committed: 0,
            state: LogState::Free,
            p2l: Vec::new(),
            l2p: BTreeMap::new(),
        }
    }

    /// Take the log out of use once its group was merged; an active log is deactivated first
    pub fn retire(&mut self) -> Result<()> {
        if self.state.is_active() {
            self.state = self.state.deactivate()?;
        }
        self.state = self.state.reclaim()?;
        Ok(())
    }

    /// Physical page `page` holds logical page offset `lpo`
    pub fn record(&mut self, page: u32, lpo: u32) {
        let index = page as usize;
        if self.p2l.len() <= index {
            self.p2l.resize(index + 1, None);
        }
        if let Some(old) = self.p2l[index].replace(lpo) {
            if old != lpo {
                self.forget(page, old);
            }
        }

        let newest = self.l2p.entry(lpo).or_insert(page);
        if *newest < page {
            *newest = page;
        }
    }

    /// Physical page `page` no longer holds anything
    pub fn unrecord(&mut self, page: u32) {
        if let Some(lpo) = self.p2l.get_mut(page as usize).and_then(Option::take) {
            self.forget(page, lpo);
        }
    }

    /// `page` stopped holding `lpo`; fall back to the next-newest copy
    fn forget(&mut self, page: u32, lpo: u32) {
        if self.l2p.get(&lpo) != Some(&page) {
            return;
        }
        let fallback = (0..)
            .zip(&self.p2l)
            .filter(|&(p, held)| p != page && *held == Some(lpo))
            .map(|(p, _)| p)
            .max();
        match fallback {
            Some(p) => self.l2p.insert(lpo, p),
            None => self.l2p.remove(&lpo),
        };
    }

    pub fn lookup(&self, lpo: u32) -> Option<u32> {
        self.l2p.get(&lpo).copied()
    }

    pub fn p2l(&self) -> &[Option<u32>] {
        &self.p2l
    }

    pub fn l2p(&self) -> &BTreeMap<u32, u32> {
        &self.l2p
    }

    /// Where the next write to this log goes, if it has room
    ///
    /// A random-mode log on MLC skips to the next LSB page, so no write can ever disturb a page
    /// holding data.
    pub fn next_write_offset(&self, layout: &NandLayout) -> Option<u32> {
        let next = match self.state {
            LogState::ActiveRandom => {
                (self.committed..layout.pages_per_block).find(|&p| layout.is_lsb_page(p))?
            }
            _ => self.committed,
        };
        (next < layout.pages_per_block).then_some(next)
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.vbn);
        buf.put_u32_le(self.ec);
        buf.put_u16_le(self.committed as u16);
        buf.put_u8(self.state.into());
        buf.put_u8(0xFF);
        buf.put_u16_le(self.p2l.len() as u16);
        buf.put_u16_le(0xFFFF);
        for lpo in &self.p2l {
            buf.put_u32_le(lpo.unwrap_or(NONE_U32));
        }
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        let mut log = Self::new(buf.try_u32_le()?, buf.try_u32_le()?);
        log.committed = u32::from(buf.try_u16_le()?);
        log.state = LogState::try_from(buf.try_u8()?).ok()?;
        buf.try_u8()?;
        let len = buf.try_u16_le()?;
        buf.try_u16_le()?;

        for page in 0..u32::from(len) {
            match opt_u32(buf.try_u32_le()?) {
                Some(lpo) => log.record(page, lpo),
                None => log.p2l.push(None),
            }
        }
        Some(log)
    }
}

/// The log blocks of one data group
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogGroup {
    pub dgn: u32,
    pub logs: Vec<LogBlock>,
}

impl LogGroup {
    pub fn new(dgn: u32) -> Self {
        Self {
            dgn,
            logs: Vec::new(),
        }
    }

    /// Search the group for the log block at `vbn`
    pub fn find(&self, vbn: Vbn) -> Option<usize> {
        self.logs.iter().position(|log| log.vbn == vbn)
    }

    /// The lowest erase count among the group's logs, and the block that has it
    pub fn min_cost(&self) -> (u32, Option<Vbn>) {
        self.logs
            .iter()
            .min_by_key(|log| log.ec)
            .map_or((u32::MAX, None), |log| (log.ec, Some(log.vbn)))
    }

    pub fn max_record_len(logs_per_group: u32, pages_per_block: u32) -> usize {
        16 + 4 + logs_per_group as usize * (16 + 4 * pages_per_block as usize)
    }

    /// Encode as a group record: the DGN and body length, a redundant ZBC of the body, and the
    /// body itself
    pub fn encode_record(&self, buf: &mut Vec<u8>) {
        let mut body = Vec::new();
        body.put_u16_le(self.logs.len() as u16);
        body.put_u16_le(0xFFFF);
        for log in &self.logs {
            log.encode(&mut body);
        }

        let zbc = Redundant::new(zero_bits(&body));
        buf.put_u32_le(self.dgn);
        buf.put_u32_le(body.len() as u32);
        buf.put_u32_le(zbc.value);
        buf.put_u32_le(zbc.inverse);
        buf.extend_from_slice(&body);
    }

    pub fn decode_record(buf: &mut &[u8]) -> Option<Self> {
        let dgn = buf.try_u32_le()?;
        let len = buf.try_u32_le()? as usize;
        let zbc = Redundant {
            value: buf.try_u32_le()?,
            inverse: buf.try_u32_le()?,
        }
        .get()?;
        let body = buf.try_bytes(len)?;
        if zero_bits(&body) != zbc {
            return None;
        }

        let mut body = &body[..];
        let count = body.try_u16_le()?;
        body.try_u16_le()?;
        let logs = (0..count)
            .map(|_| LogBlock::decode(&mut body))
            .collect::<Option<Vec<_>>>()?;

        Some(Self { dgn, logs })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::TEST_NAND;

    #[test]
    fn test_transitions() -> Result<()> {
        let state = LogState::Free.activate()?;
        assert_eq!(state, LogState::Active);
        let state = state.mark_random()?.mark_random()?;
        assert_eq!(state, LogState::ActiveRandom);
        let state = state.deactivate()?;
        assert_eq!(state.reclaim()?, LogState::Free);
        assert_eq!(LogState::Active.deactivate()?, LogState::Inactive);

        assert!(matches!(
            LogState::Inactive.mark_random(),
            Err(FtlError::LogTransition { .. })
        ));
        assert!(LogState::Active.activate().is_err());
        assert!(LogState::Free.deactivate().is_err());
        assert!(LogState::Active.reclaim().is_err());
        Ok(())
    }

    #[test]
    fn test_retire() -> Result<()> {
        let mut log = LogBlock::new(9, 1);
        assert!(log.retire().is_err());

        for state in [LogState::Active, LogState::ActiveRandom, LogState::Inactive] {
            log.state = state;
            log.retire()?;
            assert_eq!(log.state, LogState::Free);
        }
        Ok(())
    }

    #[test]
    fn test_maps() {
        let mut log = LogBlock::new(9, 1);
        log.record(0, 5);
        log.record(1, 6);
        log.record(2, 5);
        assert_eq!(log.lookup(5), Some(2));
        assert_eq!(log.lookup(6), Some(1));

        // Losing the newest copy falls back to the previous one
        log.unrecord(2);
        assert_eq!(log.lookup(5), Some(0));
        log.unrecord(0);
        assert_eq!(log.lookup(5), None);
        assert_eq!(log.p2l(), [None, Some(6), None]);

        // Re-recording an older page never hides a newer one
        log.record(4, 6);
        log.record(1, 6);
        assert_eq!(log.lookup(6), Some(4));
    }

    #[test]
    fn test_next_write_offset() {
        let mut log = LogBlock::new(9, 1);
        log.state = LogState::Active;
        log.committed = 8;
        assert_eq!(log.next_write_offset(&TEST_NAND), Some(8));
        log.state = LogState::ActiveRandom;
        assert_eq!(log.next_write_offset(&TEST_NAND), Some(9));
        log.committed = 32;
        assert_eq!(log.next_write_offset(&TEST_NAND), None);
    }

    #[test]
    fn test_record_codec() {
        let mut group = LogGroup::new(3);
        let mut log = LogBlock::new(12, 4);
        log.state = LogState::Active;
        log.committed = 4;
        log.record(0, 10);
        log.record(2, 11);
        log.record(3, 10);
        group.logs.push(log);
        group.logs.push(LogBlock::new(13, 2));
        assert_eq!(group.min_cost(), (2, Some(13)));

        let mut buf = Vec::new();
        group.encode_record(&mut buf);
        assert!(buf.len() <= LogGroup::max_record_len(3, 32));
        let decoded = LogGroup::decode_record(&mut &buf[..]);
        assert_eq!(decoded.as_ref(), Some(&group));
        assert_eq!(decoded.and_then(|g| g.logs[0].lookup(10)), Some(3));

        // A flipped bit in the body breaks the record's checksum
        let last = buf.len() - 1;
        buf[last] ^= 4;
        assert_eq!(LogGroup::decode_record(&mut &buf[..]), None);
    }
}
