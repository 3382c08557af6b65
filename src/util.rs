//! Useful traits and other utilities that don't really belong anywhere else.

use bytes::Buf;

/// Fallible little-endian accessors for [Buf]. The `get_*` methods of [Buf] panic on short
/// input, which is unacceptable when decoding pages that may be torn.
pub trait BufExt: Buf {
    fn try_u8(&mut self) -> Option<u8> {
        (self.remaining() >= 1).then(|| self.get_u8())
    }

    fn try_u16_le(&mut self) -> Option<u16> {
        (self.remaining() >= 2).then(|| self.get_u16_le())
    }

    fn try_u32_le(&mut self) -> Option<u32> {
        (self.remaining() >= 4).then(|| self.get_u32_le())
    }

    /// Take exactly `len` bytes, or nothing if fewer remain
    fn try_bytes(&mut self, len: usize) -> Option<Vec<u8>> {
        if self.remaining() < len {
            return None;
        }
        let mut out = vec![0; len];
        self.copy_to_slice(&mut out);
        Some(out)
    }
}

impl<T: Buf> BufExt for T {}

/// Encoding of "no value" in 32-bit on-flash fields (the erased-flash pattern)
pub const NONE_U32: u32 = u32::MAX;

/// Encoding of "no value" in 16-bit on-flash fields
pub const NONE_U16: u16 = u16::MAX;

pub fn opt_u32(raw: u32) -> Option<u32> {
    (raw != NONE_U32).then_some(raw)
}

pub fn opt_u16(raw: u16) -> Option<u16> {
    (raw != NONE_U16).then_some(raw)
}

#[test]
fn test_short_reads() {
    let mut buf: &[u8] = &[1, 2, 3];
    assert_eq!(buf.try_u16_le(), Some(0x0201));
    assert_eq!(buf.try_u32_le(), None);
    assert_eq!(buf.try_u8(), Some(3));
    assert_eq!(buf.try_u8(), None);
    assert_eq!(buf.try_bytes(0), Some(vec![]));
}
