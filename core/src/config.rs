//! Configuration options.
//!
//! A runtime configuration selects exactly one capture source (live
//! interface or offline captures) and tunes the flow table, output and
//! monitoring behavior. Configurations come from a TOML file via
//! [`load_config`], from [`default_config`], or are assembled by a
//! command-line front-end.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig> {
    let config_str = fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.as_ref().display()))?;
    let config: RuntimeConfig = toml::from_str(&config_str).context("invalid config file")?;
    config.validate()?;
    Ok(config)
}

/// Returns a default offline configuration for demonstration purposes.
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::offline("./traces/example.pcap")
}

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Live capture settings. Either `online` or `offline` must be set.
    #[serde(default)]
    pub online: Option<OnlineConfig>,

    /// Offline capture settings. Either `online` or `offline` must be set.
    #[serde(default)]
    pub offline: Option<OfflineConfig>,

    /// Flow table sizing and lifecycle settings.
    #[serde(default)]
    pub flowtable: FlowTableConfig,

    /// Output file settings.
    #[serde(default)]
    pub output: OutputConfig,

    /// Periodic monitoring settings.
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Identifier stamped into reports when several sensors feed one
    /// collector.
    #[serde(default)]
    pub sensor_id: u32,

    /// BPF filter applied to the capture source.
    #[serde(default)]
    pub bpf: Option<String>,

    /// Path of the session checkpoint for diff reporting across runs.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl RuntimeConfig {
    /// A configuration reading one capture file.
    pub fn offline<S: Into<String>>(pcap: S) -> Self {
        RuntimeConfig {
            offline: Some(OfflineConfig {
                pcap: Some(pcap.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// A configuration listening on `device`.
    pub fn online<S: Into<String>>(device: S) -> Self {
        RuntimeConfig {
            online: Some(OnlineConfig {
                device: device.into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Checks that exactly one capture source is configured.
    pub fn validate(&self) -> Result<()> {
        if self.online.is_some() == self.offline.is_some() {
            bail!("configure either a live interface or offline analysis, not both");
        }
        if let Some(offline) = &self.offline {
            let sources = [
                offline.pcap.is_some(),
                offline.pcap_list.is_some(),
                offline.series.is_some(),
            ]
            .iter()
            .filter(|&&s| s)
            .count();
            if sources != 1 {
                bail!("offline analysis needs exactly one of: pcap, pcap_list, series");
            }
        }
        if self.flowtable.scale_factor <= 0.0 {
            bail!("hash scale factor must be positive");
        }
        Ok(())
    }
}

/// Live capture settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OnlineConfig {
    /// Interface name.
    pub device: String,

    /// Snapshot length in bytes.
    #[serde(default = "default_snaplen")]
    pub snaplen: i32,

    /// Receive buffer size in bytes; the platform default when omitted.
    #[serde(default)]
    pub buffer_size: Option<i32>,

    /// Capture in promiscuous mode. Defaults to `true`.
    #[serde(default = "default_promiscuous")]
    pub promiscuous: bool,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        OnlineConfig {
            device: String::new(),
            snaplen: default_snaplen(),
            buffer_size: None,
            promiscuous: true,
        }
    }
}

/// Offline capture settings; exactly one source must be set.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct OfflineConfig {
    /// One capture file, `-` for stdin.
    #[serde(default)]
    pub pcap: Option<String>,

    /// File listing capture files to process in order.
    #[serde(default)]
    pub pcap_list: Option<PathBuf>,

    /// Rolling numeric-suffixed capture series.
    #[serde(default)]
    pub series: Option<SeriesConfig>,
}

/// A rolling capture series such as `dump.pcap0`, `dump.pcap1`, …
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SeriesConfig {
    /// First file of the series; its trailing number is the start index.
    pub expr: String,

    /// Last character before the index. Defaults to `.`.
    #[serde(default = "default_series_separator")]
    pub separator: char,

    /// Last index to process; unbounded when omitted.
    #[serde(default)]
    pub stop: Option<u64>,

    /// Seconds to wait between polls for the next file.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,

    /// Give up after this many fruitless polls; unbounded when omitted.
    #[serde(default)]
    pub max_polls: Option<u32>,
}

/// Flow table sizing and lifecycle settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FlowTableConfig {
    /// Multiplier on the base hash table size.
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,

    /// Seconds without traffic before a flow times out.
    #[serde(default = "default_flow_timeout")]
    pub flow_timeout: f32,

    /// Evict the oldest flows when the table runs full instead of aborting.
    #[serde(default = "default_autopilot")]
    pub autopilot: bool,

    /// Split conversations longer than this many seconds into consecutive
    /// flows.
    #[serde(default)]
    pub forced_duration: Option<u64>,

    /// Rolled sub-flows keep the first flow's index.
    #[serde(default)]
    pub forced_duration_same_findex: bool,

    /// Create a flow for fragments whose first fragment was never seen.
    #[serde(default = "default_accept_crafted")]
    pub accept_crafted_fragments: bool,

    /// Detect LAPD carried in UDP by signature.
    #[serde(default)]
    pub lapd_over_udp: bool,
}

impl Default for FlowTableConfig {
    fn default() -> Self {
        FlowTableConfig {
            scale_factor: default_scale_factor(),
            flow_timeout: default_flow_timeout(),
            autopilot: default_autopilot(),
            forced_duration: None,
            forced_duration_same_findex: false,
            accept_crafted_fragments: default_accept_crafted(),
            lapd_over_udp: false,
        }
    }
}

/// Output file settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    /// Prefix for all generated files; `-` or absent writes flow rows to
    /// stdout.
    #[serde(default)]
    pub prefix: Option<String>,

    /// Column separator of text rows.
    #[serde(default = "default_separator")]
    pub separator: String,

    /// Roll flow output files at this size or flow count.
    #[serde(default)]
    pub roll_limit: Option<RollLimit>,

    /// First index of rolled output files.
    #[serde(default)]
    pub roll_start: u64,

    /// Produce one forensic record per dispatched packet.
    #[serde(default)]
    pub packet_records: bool,

    /// Divert the end report to `PREFIX_log.txt`.
    #[serde(default)]
    pub log_to_file: bool,

    /// Divert monitoring output to `PREFIX_monitoring.txt`.
    #[serde(default)]
    pub monitoring_to_file: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            prefix: None,
            separator: default_separator(),
            roll_limit: None,
            roll_start: 0,
            packet_records: false,
            log_to_file: false,
            monitoring_to_file: false,
        }
    }
}

/// Periodic monitoring settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MonitoringConfig {
    /// Interval in seconds; monitoring is off when absent.
    #[serde(default)]
    pub interval: Option<f64>,

    /// Machine-parseable one-line snapshots instead of the human report.
    #[serde(default)]
    pub machine_readable: bool,

    /// Report diffs relative to the previous snapshot.
    #[serde(default = "default_diff_mode")]
    pub diff_mode: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            interval: None,
            machine_readable: false,
            diff_mode: default_diff_mode(),
        }
    }
}

/// Size bound of rolled output files: bytes or, with an `f` suffix, flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RollLimit {
    Bytes(u64),
    Flows(u64),
}

impl FromStr for RollLimit {
    type Err = anyhow::Error;

    /// Parses `SIZE[K|M|G][f]`, scientific notation allowed.
    fn from_str(s: &str) -> Result<Self> {
        let mut body = s.trim();
        let flows = matches!(body.chars().last(), Some('f') | Some('F'));
        if flows {
            body = &body[..body.len() - 1];
        }
        let (body, factor) = match body.chars().last() {
            Some('K' | 'k') => (&body[..body.len() - 1], 1u64 << 10),
            Some('M' | 'm') => (&body[..body.len() - 1], 1u64 << 20),
            Some('G' | 'g') => (&body[..body.len() - 1], 1u64 << 30),
            _ => (body, 1),
        };
        let value: f64 = body
            .parse()
            .with_context(|| format!("invalid size expression {s:?}"))?;
        if value < 0.0 {
            bail!("size expression must not be negative");
        }
        let scaled = (value * factor as f64) as u64;
        Ok(if flows {
            RollLimit::Flows(scaled)
        } else {
            RollLimit::Bytes(scaled)
        })
    }
}

impl<'de> Deserialize<'de> for RollLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn default_snaplen() -> i32 {
    65535
}

fn default_promiscuous() -> bool {
    true
}

fn default_series_separator() -> char {
    '.'
}

fn default_poll_interval() -> f64 {
    1.0
}

fn default_scale_factor() -> f64 {
    1.0
}

fn default_flow_timeout() -> f32 {
    182.0
}

fn default_autopilot() -> bool {
    true
}

fn default_accept_crafted() -> bool {
    true
}

fn default_separator() -> String {
    "\t".to_string()
}

fn default_diff_mode() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_and_offline_are_exclusive() {
        let mut config = RuntimeConfig::offline("x.pcap");
        assert!(config.validate().is_ok());
        config.online = Some(OnlineConfig {
            device: "eth0".into(),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn roll_limit_parses_units_and_flows() {
        assert_eq!("4096".parse::<RollLimit>().unwrap(), RollLimit::Bytes(4096));
        assert_eq!("10K".parse::<RollLimit>().unwrap(), RollLimit::Bytes(10 << 10));
        assert_eq!("2M".parse::<RollLimit>().unwrap(), RollLimit::Bytes(2 << 20));
        assert_eq!("1e5".parse::<RollLimit>().unwrap(), RollLimit::Bytes(100_000));
        assert_eq!("10Kf".parse::<RollLimit>().unwrap(), RollLimit::Flows(10 << 10));
        assert!("nonsense".parse::<RollLimit>().is_err());
    }

    #[test]
    fn toml_round_trip_with_defaults() {
        let toml_str = r#"
            sensor_id = 7

            [offline]
            pcap = "./trace.pcap"

            [flowtable]
            flow_timeout = 60.0
        "#;
        let config: RuntimeConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.sensor_id, 7);
        assert_eq!(config.flowtable.flow_timeout, 60.0);
        assert!(config.flowtable.autopilot);
        assert_eq!(config.output.separator, "\t");
    }
}
