//! Format or recover an FTL cluster on a NAND device, and print what recovery found.
//!
//! Meant to be pointed at a simulated NAND image, or at a real MTD partition on Linux, to check
//! the state an unclean shutdown left behind.

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::fs::File;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use nand_ftl::nand::{mtd::MtdNand, CellType};
use nand_ftl::{
    meta::{layout::ZoneGeometry, page::read_meta, page::PageRead},
    nand::{Nand, NandLayout, SimNand, Vbn},
    zone::Zone,
    OpenFlags, RecoveryConfig, Registry,
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// The MTD device is multi-level cell (paired LSB/MSB pages)
    #[cfg(target_os = "linux")]
    #[clap(long)]
    mlc: bool,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate, as BLOCKSxPAGESxBYTES+SPARE[:mlc]
    #[clap(long)]
    sim_layout: Option<NandLayout>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                if path.exists() {
                    sim.load(&mut File::open(path)?)?;
                }
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let cell = match self.mlc {
                    true => CellType::Mlc,
                    false => CellType::Slc,
                };
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name, cell)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev, cell)?
                    } else {
                        bail!("no NAND device given")
                    }
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            bail!("no NAND device given")
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(sim_nand) = nand {
                    sim_nand.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

#[derive(Args, Debug, Clone)]
struct ClusterOptions {
    /// The cluster number recorded in the root info
    #[clap(long, default_value_t = 0)]
    cluster: u32,

    /// Blocks holding copies of the root info
    #[clap(long, value_delimiter = ',', default_values_t = [0, 1])]
    root_blocks: Vec<Vbn>,
}

#[derive(Args, Debug, Clone)]
struct FormatOptions {
    /// Split the device into this many equally-sized zones
    #[clap(long, default_value_t = 1)]
    zones: u32,

    /// Meta blocks per zone
    #[clap(long, default_value_t = 4)]
    meta_blocks: u32,

    /// Logical blocks per logical address range
    #[clap(long, default_value_t = 16)]
    blocks_per_lan: u32,

    /// Data groups per logical address range
    #[clap(long, default_value_t = 4)]
    groups_per_lan: u32,

    #[clap(long, default_value_t = 3)]
    logs_per_group: u32,

    #[clap(long, default_value_t = 8)]
    max_active_logs: u32,

    #[clap(long, default_value_t = 4)]
    wl_groups: u32,

    /// Share one wear-leveling domain between the zones
    #[clap(long)]
    global_wl: bool,
}

impl FormatOptions {
    /// Lay the zones out back to back after the root blocks
    fn plan(&self, layout: &NandLayout, root_blocks: &[Vbn]) -> Result<Vec<ZoneGeometry>> {
        let first = root_blocks.iter().max().map_or(0, |&b| b + 1);
        if self.zones == 0 || first >= layout.blocks {
            bail!("no room for {} zones", self.zones);
        }
        let span = (layout.blocks - first) / self.zones;
        let Some(data_count) = span.checked_sub(self.meta_blocks) else {
            bail!("{span} blocks per zone cannot hold {} meta blocks", self.meta_blocks);
        };
        // Keep the buffer, every active log and a relocation target out of the logical space
        let spare = self.max_active_logs + 2;
        let lan_count = data_count.saturating_sub(spare) / self.blocks_per_lan.max(1);
        if lan_count == 0 {
            bail!("{data_count} data blocks per zone is too few");
        }

        let geometry = (0..self.zones)
            .map(|zone| {
                let start = first + zone * span;
                ZoneGeometry {
                    meta_blocks: (start..start + self.meta_blocks).collect(),
                    data_first: start + self.meta_blocks,
                    data_count,
                    lan_count,
                    blocks_per_lan: self.blocks_per_lan,
                    groups_per_lan: self.groups_per_lan,
                    logs_per_group: self.logs_per_group,
                    max_active_logs: self.max_active_logs,
                    wl_groups: self.wl_groups,
                }
            })
            .collect();
        Ok(geometry)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print what the first page of every root block holds; this is a read-only operation
    Roots,

    /// Write fresh root info and empty zones, erasing every block they cover
    Format(FormatOptions),

    /// Recover the cluster and print the state of every zone
    Open {
        /// How many zones the root info must list
        #[clap(long, default_value_t = 1)]
        zones: u32,

        /// Recover RAM state only, writing nothing back
        #[clap(long)]
        read_only: bool,

        /// Also print where these zone-relative logical blocks are mapped
        #[clap(long, value_delimiter = ',')]
        lbn: Vec<u32>,
    },
}

impl Command {
    fn execute<N: Nand>(self, nand: N, opts: &ClusterOptions) -> Result<N> {
        let cfg = RecoveryConfig::default();
        let mut registry = Registry::new(cfg);
        let volume = registry.add_volume(nand);
        registry.register(opts.cluster, volume, opts.root_blocks.clone())?;

        match self {
            Command::Roots => {
                registry.with_volume(volume, |nand| -> Result<()> {
                    let layout = nand.layout();
                    for &vbn in &opts.root_blocks {
                        let page = read_meta(nand, layout.vpn(vbn, 0), cfg.read_retries)?;
                        match page {
                            PageRead::Valid(spare, meta) => {
                                println!("{vbn:4} => {:?} {:?}", spare.age, meta.payload)
                            }
                            other => println!("{vbn:4} => {other:?}"),
                        }
                    }
                    Ok(())
                })??;
            }

            Command::Format(format) => {
                let layout = registry.with_volume(volume, |nand| nand.layout())?;
                let zones = format.plan(&layout, &opts.root_blocks)?;
                for (id, zone) in zones.iter().enumerate() {
                    println!("zone {id}: {zone:?}");
                }
                registry.format_cluster(opts.cluster, zones, format.global_wl)?;
            }

            Command::Open {
                zones,
                read_only,
                lbn,
            } => {
                registry.open_cluster(opts.cluster, zones, OpenFlags { read_only })?;
                for zone in registry.zones(opts.cluster)? {
                    print_zone(zone, &lbn);
                }
                registry.close_cluster(opts.cluster)?;
            }
        }

        let Some(nand) = registry.into_volumes().pop() else {
            bail!("volume vanished");
        };
        Ok(nand)
    }
}

fn print_zone(zone: &Zone, lbns: &[u32]) {
    let status = match &zone.read_only {
        Some(reason) => format!("read-only ({reason})"),
        None => "writable".to_string(),
    };
    println!("zone {}: {status}", zone.id);

    let cursor = &zone.cursor;
    println!(
        "  meta: current {} next page {} age {:?}, idle {:?}",
        cursor.current,
        cursor.next_page,
        cursor.age,
        zone.dir.idle.iter().collect::<Vec<_>>()
    );
    println!(
        "  mapped blocks: {}, free blocks: {}",
        zone.mapping.mapped_blocks().count(),
        zone.ctx.free.len()
    );
    if let Some(buffer) = zone.ctx.buffer {
        let index = &zone.buffer_index;
        let sectors: u32 = index
            .lpns()
            .filter_map(|lpn| index.get(lpn))
            .map(|entry| entry.sectors.count())
            .sum();
        println!(
            "  buffer: {} at page {} ({:?}), {} sectors of {} LPNs",
            buffer.vbn,
            buffer.committed,
            buffer.state,
            sectors,
            index.len()
        );
    }
    for &lbn in lbns {
        match zone.mapping.lookup(lbn) {
            Some(entry) => println!("  lbn {lbn}: {:?} (ec hint {})", entry.vbn, entry.ec_hint),
            None => println!("  lbn {lbn}: out of range"),
        }
    }
    for entry in &zone.ctx.active {
        println!(
            "  active log {} of group {}: ec {} {:?}",
            entry.vbn, entry.dgn, entry.ec, entry.state
        );
    }
    for group in zone.groups.values().filter(|g| !g.logs.is_empty()) {
        for log in &group.logs {
            println!(
                "  group {:4} log {:4}: committed {:3}, {} live pages, {:?}",
                group.dgn,
                log.vbn,
                log.committed,
                log.l2p().len(),
                log.state
            );
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    #[clap(flatten)]
    cluster: ClusterOptions,

    /// What to do with the cluster
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let nand = match args.nand.open()? {
        NandImpl::Sim(nand) => NandImpl::Sim(args.cmd.execute(nand, &args.cluster)?),

        #[cfg(target_os = "linux")]
        NandImpl::Mtd(nand) => NandImpl::Mtd(args.cmd.execute(nand, &args.cluster)?),
    };
    args.nand.cleanup(nand)?;
    Ok(())
}
