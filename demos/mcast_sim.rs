use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};
use sideway_mcast::mcast::{
    manager::{AttachMulticastErrorKind, DetachMulticastErrorKind},
    memory_port::MemoryPort,
    Gid, MulticastGroupManager, MulticastTableConfig,
};
use tabled::{
    settings::{object::Segment, Alignment, Modify, Style},
    Table, Tabled,
};

#[derive(Debug, Parser)]
#[clap(name = "mcast_sim", version = "0.1.0")]
pub struct Args {
    /// Read the table geometry from a JSON file instead of the flags below
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
    /// Total number of table entries
    #[arg(long, short = 'e', default_value_t = 64)]
    entries: u32,
    /// Number of hash bins at the start of the table
    #[arg(long, short = 'b', default_value_t = 16)]
    hash_bins: u32,
    /// Maximum number of QPs in one group
    #[arg(long, short = 'm', default_value_t = 8)]
    max_members: usize,
    /// Number of distinct multicast groups to draw from
    #[arg(long, short = 'g', default_value_t = 48)]
    groups: u16,
    /// Number of distinct QPs to draw from
    #[arg(long, short = 'q', default_value_t = 12)]
    qps: u32,
    /// Number of random attach / detach operations
    #[arg(long, short = 'n', default_value_t = 2000)]
    ops: usize,
    /// Seed for the operation stream
    #[arg(long, short = 's', default_value_t = 0x5eed)]
    seed: u64,
}

#[derive(Tabled)]
struct Outcome {
    #[tabled(rename = "operation")]
    op: &'static str,
    #[tabled(rename = "result")]
    result: String,
    #[tabled(rename = "count")]
    count: usize,
}

fn mgid(group: u16) -> Gid {
    let mut raw = [0u8; 16];
    raw[..4].copy_from_slice(&[0xff, 0x12, 0x40, 0x1b]);
    raw[14..].copy_from_slice(&group.to_be_bytes());
    Gid::from(raw)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => MulticastTableConfig::new(args.entries, args.hash_bins, args.max_members),
    };

    let port = MemoryPort::new(config.total_entries, config.entry_size)?;
    let mgr = MulticastGroupManager::from_config(config, port)?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut outcomes: BTreeMap<(&'static str, String), usize> = BTreeMap::new();

    for _ in 0..args.ops {
        let gid = mgid(rng.gen_range(0..args.groups));
        let qpn = rng.gen_range(0..args.qps);

        let key = if rng.gen_bool(0.55) {
            let result = match mgr.attach(qpn, &gid) {
                Ok(()) => "ok".to_owned(),
                Err(err) => match err.source {
                    AttachMulticastErrorKind::GroupFull { .. } => "group full".to_owned(),
                    AttachMulticastErrorKind::ResourceExhausted => "no overflow entry".to_owned(),
                    _ => return Err(err.into()),
                },
            };
            ("attach", result)
        } else {
            let result = match mgr.detach(qpn, &gid) {
                Ok(()) => "ok".to_owned(),
                Err(err) => match err.source {
                    DetachMulticastErrorKind::UnknownGroup => "unknown group".to_owned(),
                    DetachMulticastErrorKind::UnknownMember => "unknown member".to_owned(),
                    _ => return Err(err.into()),
                },
            };
            ("detach", result)
        };
        *outcomes.entry(key).or_default() += 1;
    }

    mgr.verify()?;

    let summary = Table::new(
        outcomes
            .into_iter()
            .map(|((op, result), count)| Outcome { op, result, count }),
    )
    .with(Style::sharp())
    .with(Modify::new(Segment::all()).with(Alignment::center()))
    .to_string();

    println!("{summary}");
    println!("{} groups attached", mgr.group_count());
    println!("{}", mgr.status_table());

    Ok(())
}
