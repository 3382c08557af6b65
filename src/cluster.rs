//! The caller-owned registry of volumes and the clusters living on them.
//!
//! A cluster is a set of zones sharing one root region on a volume. Opening a cluster recovers
//! every zone, or none: a fatal error in any zone closes the zones already opened.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{OpenFlags, RecoveryConfig};
use crate::error::{FtlError, Result};
use crate::meta::layout::{MetaLayout, ZoneGeometry};
use crate::meta::page::{program_meta, MetaPage, MetaPayload};
use crate::meta::root::RootInfo;
use crate::meta::Age;
use crate::nand::{Nand, Vbn};
use crate::recovery::scan;
use crate::zone::Zone;

struct Cluster {
    volume: usize,
    root_blocks: Vec<Vbn>,
    open: Option<OpenCluster>,
}

struct OpenCluster {
    root: RootInfo,
    zones: Vec<Zone>,
    flags: OpenFlags,
    opens: u32,
}

pub struct Registry<N: Nand> {
    volumes: Vec<Mutex<N>>,
    clusters: BTreeMap<u32, Cluster>,
    cfg: RecoveryConfig,
}

impl<N: Nand> Default for Registry<N> {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

impl<N: Nand> Registry<N> {
    pub fn new(cfg: RecoveryConfig) -> Self {
        Self {
            volumes: Vec::new(),
            clusters: BTreeMap::new(),
            cfg,
        }
    }

    /// Take ownership of a device; returns its volume index
    pub fn add_volume(&mut self, nand: N) -> usize {
        self.volumes.push(Mutex::new(nand));
        self.volumes.len() - 1
    }

    /// Run `f` with exclusive access to a volume's device
    pub fn with_volume<R>(&self, volume: usize, f: impl FnOnce(&mut N) -> R) -> Result<R> {
        let volume = self
            .volumes
            .get(volume)
            .ok_or_else(|| FtlError::InvalidArgument(format!("unknown volume {volume}")))?;
        Ok(f(&mut volume.lock()))
    }

    /// Give back every device, closing nothing
    pub fn into_volumes(self) -> Vec<N> {
        self.volumes.into_iter().map(Mutex::into_inner).collect()
    }

    /// Declare that cluster `cluster` keeps its root info in `root_blocks` of `volume`
    pub fn register(&mut self, cluster: u32, volume: usize, root_blocks: Vec<Vbn>) -> Result<()> {
        if volume >= self.volumes.len() {
            return Err(FtlError::InvalidArgument(format!("unknown volume {volume}")));
        }
        if root_blocks.is_empty() {
            return Err(FtlError::InvalidArgument("no root blocks".into()));
        }
        if let Some(existing) = self.clusters.get(&cluster) {
            if existing.open.is_some() {
                return Err(FtlError::ClusterBusy(cluster));
            }
        }

        self.clusters.insert(
            cluster,
            Cluster {
                volume,
                root_blocks,
                open: None,
            },
        );
        Ok(())
    }

    /// Write fresh root info and format every zone of a registered, closed cluster
    pub fn format_cluster(
        &mut self,
        cluster: u32,
        zones: Vec<ZoneGeometry>,
        global_wl: bool,
    ) -> Result<()> {
        let slot = self
            .clusters
            .get(&cluster)
            .ok_or(FtlError::UnknownCluster(cluster))?;
        if slot.open.is_some() {
            return Err(FtlError::ClusterBusy(cluster));
        }
        let cfg = &self.cfg;
        let mut nand = self.volumes[slot.volume].lock();
        let layouts = zone_layouts(&*nand, &slot.root_blocks, &zones, cfg)?;

        // Newer than any root info already there, so a torn format never loses to it
        let age = match scan::locate_root(&mut *nand, &slot.root_blocks, cfg) {
            Ok((age, _)) => age.next_block(),
            Err(FtlError::Unformatted(_)) => Age::INITIAL,
            Err(e) => return Err(e),
        };

        let root = RootInfo {
            cluster,
            global_wl,
            zones,
        };
        let page = MetaPage::new(MetaPayload::Root(root));
        let nand_layout = nand.layout();
        for &vbn in &slot.root_blocks {
            nand.erase(vbn)?;
            program_meta(&mut *nand, nand_layout.vpn(vbn, 0), age, &page)?;
        }

        for (id, layout) in (0..).zip(layouts) {
            Zone::format(&mut *nand, id, layout, cfg)?;
        }
        info!(cluster, ?age, "cluster formatted");
        Ok(())
    }

    /// Open cluster `cluster`, recovering every zone on first open
    ///
    /// `num_zones` must match the zone count in the root info, and a cluster already open must be
    /// asked for with the flags it was opened with.
    pub fn open_cluster(&mut self, cluster: u32, num_zones: u32, flags: OpenFlags) -> Result<()> {
        let slot = self
            .clusters
            .get_mut(&cluster)
            .ok_or(FtlError::UnknownCluster(cluster))?;
        if let Some(open) = &mut slot.open {
            if open.root.zones.len() != num_zones as usize {
                return Err(zone_count_mismatch(num_zones, &open.root));
            }
            if open.flags != flags {
                warn!(cluster, open = ?open.flags, requested = ?flags, "open flags differ");
                return Err(FtlError::InvalidArgument(format!(
                    "cluster {cluster} is already open with {:?}",
                    open.flags
                )));
            }
            open.opens += 1;
            debug!(cluster, opens = open.opens, "cluster already open");
            return Ok(());
        }

        let cfg = &self.cfg;
        let mut nand = self.volumes[slot.volume].lock();
        let (age, root) = scan::locate_root(&mut *nand, &slot.root_blocks, cfg)?;
        if root.cluster != cluster {
            return Err(FtlError::InvalidArgument(format!(
                "root info belongs to cluster {}",
                root.cluster
            )));
        }
        if root.zones.len() != num_zones as usize {
            return Err(zone_count_mismatch(num_zones, &root));
        }
        let layouts = zone_layouts(&*nand, &slot.root_blocks, &root.zones, cfg)?;

        let rpt = howudoin::new()
            .label(format!("Opening cluster {cluster}"))
            .set_len(u64::from(num_zones));
        let mut zones: Vec<Zone> = Vec::with_capacity(layouts.len());
        for (id, layout) in (0..).zip(layouts) {
            match Zone::open(&mut *nand, id, layout, flags, cfg) {
                Ok(zone) => zones.push(zone),
                Err(e) => {
                    warn!(cluster, zone = id, "zone open failed; closing opened zones");
                    for zone in zones.into_iter().rev() {
                        if let Err(close) = zone.close(&mut *nand) {
                            warn!(cluster, %close, "closing zone after failed open");
                        }
                    }
                    rpt.close();
                    return Err(e);
                }
            }
            rpt.inc();
        }
        rpt.close();

        info!(cluster, ?age, zones = zones.len(), "cluster opened");
        slot.open = Some(OpenCluster {
            root,
            zones,
            flags,
            opens: 1,
        });
        Ok(())
    }

    /// Drop one open reference; the last one flushes and frees every zone
    ///
    /// Every zone is flushed even when an earlier one fails; the first failure is returned.
    pub fn close_cluster(&mut self, cluster: u32) -> Result<()> {
        let slot = self
            .clusters
            .get_mut(&cluster)
            .ok_or(FtlError::UnknownCluster(cluster))?;
        let Some(open) = &mut slot.open else {
            return Err(not_open(cluster));
        };

        open.opens -= 1;
        if open.opens > 0 {
            return Ok(());
        }

        let Some(open) = slot.open.take() else {
            return Ok(());
        };
        let mut nand = self.volumes[slot.volume].lock();
        let mut failed = None;
        for zone in open.zones {
            let id = zone.id;
            if let Err(e) = zone.close(&mut *nand) {
                warn!(cluster, zone = id, %e, "zone close failed");
                failed.get_or_insert(e);
            }
        }

        match failed {
            Some(e) => Err(e),
            None => {
                info!(cluster, "cluster closed");
                Ok(())
            }
        }
    }

    pub fn is_open(&self, cluster: u32) -> bool {
        self.clusters
            .get(&cluster)
            .is_some_and(|slot| slot.open.is_some())
    }

    pub fn zones(&self, cluster: u32) -> Result<&[Zone]> {
        let slot = self
            .clusters
            .get(&cluster)
            .ok_or(FtlError::UnknownCluster(cluster))?;
        match &slot.open {
            Some(open) => Ok(&open.zones),
            None => Err(not_open(cluster)),
        }
    }

    pub fn zone(&self, cluster: u32, zone: u32) -> Result<&Zone> {
        self.zones(cluster)?
            .get(zone as usize)
            .ok_or_else(|| FtlError::InvalidArgument(format!("cluster {cluster} has no zone {zone}")))
    }

    /// The root info of an open cluster
    pub fn root(&self, cluster: u32) -> Result<&RootInfo> {
        let slot = self
            .clusters
            .get(&cluster)
            .ok_or(FtlError::UnknownCluster(cluster))?;
        slot.open
            .as_ref()
            .map(|open| &open.root)
            .ok_or_else(|| not_open(cluster))
    }
}

fn not_open(cluster: u32) -> FtlError {
    FtlError::InvalidArgument(format!("cluster {cluster} is not open"))
}

fn zone_count_mismatch(num_zones: u32, root: &RootInfo) -> FtlError {
    FtlError::InvalidArgument(format!(
        "{num_zones} zones requested, root info lists {}",
        root.zones.len()
    ))
}

/// Lay out every zone, checking that no two zones (or a zone and the root region) share a block
fn zone_layouts<N: Nand>(
    nand: &N,
    root_blocks: &[Vbn],
    zones: &[ZoneGeometry],
    cfg: &RecoveryConfig,
) -> Result<Vec<MetaLayout>> {
    let mut used: BTreeSet<Vbn> = root_blocks.iter().copied().collect();
    let mut layouts = Vec::with_capacity(zones.len());

    for (id, geometry) in zones.iter().enumerate() {
        let layout = MetaLayout::new(geometry.clone(), nand.layout(), cfg)?;
        let blocks = geometry.meta_blocks.iter().copied().chain(geometry.data_blocks());
        for vbn in blocks {
            if !used.insert(vbn) {
                return Err(FtlError::Geometry(format!("zone {id} reuses block {vbn}")));
            }
        }
        layouts.push(layout);
    }
    Ok(layouts)
}
