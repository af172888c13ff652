//! Command-line front-end of the flow analyzer.
//!
//! Assembles a runtime configuration from tcpdump-style flags, selects the
//! plugin set and launches the capture loop.

use kestrel_core::config::{
    OfflineConfig, OnlineConfig, RollLimit, RuntimeConfig, SeriesConfig,
};
use kestrel_core::plugin::{PluginRegistry, PluginSelection};
use kestrel_core::{runtime, Runtime};

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser, Debug)]
#[clap(
    name = "kestrel",
    version,
    about = "Flow-centric network traffic analyzer"
)]
struct Args {
    /// Listen on interface IFACE
    #[clap(short = 'i', value_name = "IFACE")]
    interface: Option<String>,

    /// Read packets from PCAP file, or from stdin if PCAP is "-"
    #[clap(short = 'r', value_name = "PCAP")]
    read: Option<String>,

    /// Process every PCAP file listed in FILE
    #[clap(short = 'R', value_name = "FILE")]
    read_list: Option<PathBuf>,

    /// Process a rolling capture series EXPR[:SCHR][,STOP]
    #[clap(short = 'D', value_name = "EXPR")]
    series: Option<String>,

    /// Prefix for all generated files; "-" prints flows to stdout
    #[clap(short = 'w', value_name = "PREFIX")]
    write: Option<String>,

    /// Like -w, but roll flow files: PREFIX[:SIZE][,START]; SIZE takes
    /// K/M/G units, or an f suffix counting flows
    #[clap(short = 'W', value_name = "PREFIX")]
    write_rolling: Option<String>,

    /// Print the end report to PREFIX_log.txt instead of stdout
    #[clap(short = 'l')]
    log_to_file: bool,

    /// Print monitoring output to PREFIX_monitoring.txt instead of stdout
    #[clap(short = 'm')]
    monitoring_to_file: bool,

    /// Packet forensics mode: one record per dispatched packet
    #[clap(short = 's')]
    packet_records: bool,

    /// Load plugins from PATH (accepted for compatibility; plugins are
    /// compiled in)
    #[clap(short = 'p', value_name = "PATH")]
    plugin_dir: Option<PathBuf>,

    /// Only load the plugins named in FILE (one per line)
    #[clap(short = 'b', value_name = "FILE")]
    plugin_list: Option<PathBuf>,

    /// Snapshot length for live captures
    #[clap(short = 'S', value_name = "SNAPLEN")]
    snaplen: Option<i32>,

    /// Live receive buffer size in bytes
    #[clap(short = 'B', value_name = "BUFSIZE")]
    buffer_size: Option<i32>,

    /// Read the BPF filter from FILE
    #[clap(short = 'F', value_name = "FILE")]
    bpf_file: Option<PathBuf>,

    /// Hash table scale factor
    #[clap(short = 'f', value_name = "FACTOR")]
    hash_factor: Option<f64>,

    /// Sensor identifier stamped into reports
    #[clap(short = 'x', value_name = "ID")]
    sensor_id: Option<u32>,

    /// Pin the process to one core (0 leaves the choice to the scheduler)
    #[clap(short = 'c', value_name = "CPU")]
    cpu: Option<usize>,

    /// Monitoring interval in seconds
    #[clap(short = 'M', value_name = "SECONDS")]
    monitoring_interval: Option<f64>,

    /// Process priority
    #[clap(short = 'P', value_name = "PRIO")]
    priority: Option<i32>,

    /// Remaining arguments form a BPF filter, as in tcpdump
    #[clap(value_name = "BPF")]
    bpf: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = build_config(&args)?;

    if let Some(cpu) = args.cpu {
        runtime::pin_to_core(cpu)?;
    }
    if let Some(priority) = args.priority {
        runtime::set_priority(priority)?;
    }
    if let Some(dir) = &args.plugin_dir {
        log::warn!(
            "plugins are compiled in; -p {} is ignored (use -b to select)",
            dir.display()
        );
    }

    let selection = match &args.plugin_list {
        Some(path) => {
            let listing = fs::read_to_string(path)
                .with_context(|| format!("reading plugin list {}", path.display()))?;
            let names: HashSet<String> = listing
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect();
            Some(PluginSelection::Whitelist(names))
        }
        None => None,
    };
    let registry = match &selection {
        Some(selection) => {
            PluginRegistry::with_selection(kestrel_plugins::all_plugins(), Some(selection))?
        }
        None => PluginRegistry::build(kestrel_plugins::default_plugins())?,
    };

    let mut runtime = Runtime::new(config, registry)?;
    runtime.run()
}

fn build_config(args: &Args) -> Result<RuntimeConfig> {
    let mut config = RuntimeConfig::default();

    let inputs = [
        args.interface.is_some(),
        args.read.is_some(),
        args.read_list.is_some(),
        args.series.is_some(),
    ]
    .iter()
    .filter(|&&b| b)
    .count();
    if inputs == 0 {
        bail!("one of '-i', '-r', '-R' or '-D' is required");
    }
    if inputs > 1 {
        bail!("'-i', '-r', '-R' and '-D' can only be used exclusively");
    }

    if let Some(iface) = &args.interface {
        let mut online = OnlineConfig {
            device: iface.clone(),
            ..Default::default()
        };
        if let Some(snaplen) = args.snaplen {
            online.snaplen = snaplen;
        }
        online.buffer_size = args.buffer_size;
        config.online = Some(online);
    } else {
        let mut offline = OfflineConfig::default();
        if let Some(pcap) = &args.read {
            offline.pcap = Some(pcap.clone());
        } else if let Some(list) = &args.read_list {
            offline.pcap_list = Some(list.clone());
        } else if let Some(expr) = &args.series {
            offline.series = Some(parse_series(expr)?);
        }
        config.offline = Some(offline);
    }

    match (&args.write, &args.write_rolling) {
        (Some(_), Some(_)) => bail!("'-w' and '-W' can only be used exclusively"),
        (Some(prefix), None) => config.output.prefix = Some(prefix.clone()),
        (None, Some(spec)) => {
            let (prefix, limit, start) = parse_rolling(spec)?;
            config.output.prefix = Some(prefix);
            config.output.roll_limit = limit;
            config.output.roll_start = start;
        }
        (None, None) => {}
    }

    config.output.log_to_file = args.log_to_file;
    config.output.monitoring_to_file = args.monitoring_to_file;
    config.output.packet_records = args.packet_records;
    config.monitoring.interval = args.monitoring_interval;
    if let Some(factor) = args.hash_factor {
        config.flowtable.scale_factor = factor;
    }
    if let Some(id) = args.sensor_id {
        config.sensor_id = id;
    }

    config.bpf = match (&args.bpf_file, args.bpf.is_empty()) {
        (Some(path), _) => {
            let filter = fs::read_to_string(path)
                .with_context(|| format!("reading BPF filter from {}", path.display()))?;
            Some(filter.trim().to_string())
        }
        (None, false) => Some(args.bpf.join(" ")),
        (None, true) => None,
    };

    config.validate()?;
    Ok(config)
}

/// Parses `-D EXPR[:SCHR][,STOP]`.
fn parse_series(spec: &str) -> Result<SeriesConfig> {
    let (body, stop) = match spec.split_once(',') {
        Some((body, stop)) => (
            body,
            Some(stop.parse::<u64>().context("series STOP index")?),
        ),
        None => (spec, None),
    };
    let (expr, separator) = match body.rsplit_once(':') {
        Some((expr, sep)) if sep.chars().count() == 1 => {
            (expr.to_string(), sep.chars().next().unwrap())
        }
        _ => (body.to_string(), '.'),
    };
    Ok(SeriesConfig {
        expr,
        separator,
        stop,
        poll_interval: 1.0,
        max_polls: if stop.is_some() { Some(30) } else { None },
    })
}

/// Parses `-W PREFIX[:SIZE][,START]`.
fn parse_rolling(spec: &str) -> Result<(String, Option<RollLimit>, u64)> {
    let (body, start) = match spec.rsplit_once(',') {
        Some((body, start)) => (body, start.parse::<u64>().context("rolling START index")?),
        None => (spec, 0),
    };
    let (prefix, limit) = match body.rsplit_once(':') {
        Some((prefix, size)) => (prefix.to_string(), Some(size.parse::<RollLimit>()?)),
        None => (body.to_string(), None),
    };
    Ok((prefix, limit, start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_spec_variants() {
        let s = parse_series("dump.pcap0").unwrap();
        assert_eq!(s.expr, "dump.pcap0");
        assert_eq!(s.separator, '.');
        assert_eq!(s.stop, None);

        let s = parse_series("dump_pcap0:_,9").unwrap();
        assert_eq!(s.expr, "dump_pcap0");
        assert_eq!(s.separator, '_');
        assert_eq!(s.stop, Some(9));
    }

    #[test]
    fn rolling_spec_variants() {
        assert_eq!(
            parse_rolling("out").unwrap(),
            ("out".to_string(), None, 0)
        );
        assert_eq!(
            parse_rolling("out:10M,3").unwrap(),
            ("out".to_string(), Some(RollLimit::Bytes(10 << 20)), 3)
        );
        assert_eq!(
            parse_rolling("out:5Kf").unwrap(),
            ("out".to_string(), Some(RollLimit::Flows(5 << 10)), 0)
        );
    }

    #[test]
    fn input_sources_are_exclusive() {
        let args = Args::parse_from(["kestrel", "-r", "a.pcap", "-i", "eth0"]);
        assert!(build_config(&args).is_err());
        let args = Args::parse_from(["kestrel", "-r", "a.pcap"]);
        assert!(build_config(&args).is_ok());
    }

    #[test]
    fn positional_args_become_the_bpf_filter() {
        let args = Args::parse_from(["kestrel", "-r", "a.pcap", "udp", "port", "53"]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.bpf.as_deref(), Some("udp port 53"));
    }
}
