//! Root info: the cluster-wide record, stored in the first page of every root block, that names
//! the cluster's zones and their geometry.

use bytes::BufMut;

use crate::meta::layout::ZoneGeometry;
use crate::util::BufExt;

pub const ROOT_SIGNATURE: &[u8; 8] = b"NANDFTL\x01";

const FLAG_GLOBAL_WL: u32 = 1;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RootInfo {
    pub cluster: u32,

    /// Do the zones share one wear-leveling domain?
    pub global_wl: bool,

    pub zones: Vec<ZoneGeometry>,
}

impl RootInfo {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_slice(ROOT_SIGNATURE);
        buf.put_u32_le(self.cluster);
        buf.put_u32_le(if self.global_wl { FLAG_GLOBAL_WL } else { 0 });
        buf.put_u16_le(self.zones.len() as u16);
        for zone in &self.zones {
            zone.encode(buf);
        }
    }

    pub fn decode(buf: &mut &[u8]) -> Option<Self> {
        if buf.try_bytes(ROOT_SIGNATURE.len())? != ROOT_SIGNATURE {
            return None;
        }
        let cluster = buf.try_u32_le()?;
        let flags = buf.try_u32_le()?;
        let zone_count = buf.try_u16_le()?;
        let zones = (0..zone_count)
            .map(|_| ZoneGeometry::decode(buf))
            .collect::<Option<Vec<_>>>()?;

        Some(Self {
            cluster,
            global_wl: flags & FLAG_GLOBAL_WL != 0,
            zones,
        })
    }
}

#[test]
fn test_root_codec() {
    let root = RootInfo {
        cluster: 7,
        global_wl: true,
        zones: vec![crate::testutil::test_geometry()],
    };
    let mut buf = Vec::new();
    root.encode(&mut buf);
    assert_eq!(RootInfo::decode(&mut &buf[..]), Some(root));

    buf[0] = b'X';
    assert_eq!(RootInfo::decode(&mut &buf[..]), None);
}
