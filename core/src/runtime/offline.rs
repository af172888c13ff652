//! Offline analysis: capture files, stdin, file lists and rolling series.

use super::{Poll, Supervisor};
use crate::config::{RuntimeConfig, SeriesConfig};
use crate::dissect::LinkType;
use crate::engine::Engine;
use crate::plugin::PluginRegistry;
use crate::runtime::signals;
use crate::utils::timeval::Timeval;

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use pcap::Capture;

pub(crate) struct OfflineRuntime<'a> {
    pub(crate) config: &'a RuntimeConfig,
    pub(crate) engine: &'a mut Engine,
    pub(crate) plugins: &'a mut PluginRegistry,
    pub(crate) supervisor: &'a mut Supervisor,
}

impl OfflineRuntime<'_> {
    pub(crate) fn run(&mut self) -> Result<()> {
        let offline = self.config.offline.as_ref().expect("offline config checked");

        if let Some(pcap) = &offline.pcap {
            let path = if pcap == "-" { "/dev/stdin" } else { pcap.as_str() };
            self.process_file(path)?;
        } else if let Some(list) = &offline.pcap_list {
            let listing = fs::read_to_string(list)
                .with_context(|| format!("reading capture list {}", list.display()))?;
            for line in listing.lines() {
                let name = line.trim();
                if name.is_empty() || name.starts_with('#') {
                    continue;
                }
                if self.process_file(name)? == Poll::Stop {
                    break;
                }
            }
        } else if let Some(series) = &offline.series {
            self.process_series(series.clone())?;
        }
        Ok(())
    }

    /// Processes one capture file; returns `Poll::Stop` when an interrupt
    /// ended the read early.
    fn process_file(&mut self, path: &str) -> Result<Poll> {
        log::info!("processing capture {path}");
        let mut cap = Capture::from_file(path)
            .map_err(|e| anyhow::anyhow!("opening capture {path}: {e}"))?;
        if let Some(bpf) = &self.config.bpf {
            cap.filter(bpf)
                .map_err(|e| anyhow::anyhow!("invalid BPF filter {bpf:?}: {e}"))?;
        }
        self.engine
            .set_link_type(LinkType::from_dlt(cap.get_datalink().0));

        while let Ok(frame) = cap.next() {
            let ts = Timeval::new(frame.header.ts.tv_sec as i64, frame.header.ts.tv_usec as i64);
            self.engine
                .process_packet(frame.data, frame.header.len, ts, self.plugins)?;
            if self.supervisor.poll(self.engine, self.plugins) == Poll::Stop {
                return Ok(Poll::Stop);
            }
        }
        Ok(Poll::Continue)
    }

    /// Follows a rolling numeric-suffixed capture series, polling with
    /// bounded backoff for files that do not exist yet.
    fn process_series(&mut self, series: SeriesConfig) -> Result<()> {
        let (prefix, start, width, padded) = parse_series_expr(&series.expr, series.separator)?;
        let mut index = start;
        let mut polls = 0u32;
        loop {
            if let Some(stop) = series.stop {
                if index > stop {
                    break;
                }
            }
            let name = series_file_name(&prefix, index, width, padded);
            if PathBuf::from(&name).exists() {
                polls = 0;
                if self.process_file(&name)? == Poll::Stop {
                    break;
                }
                index += 1;
                continue;
            }
            // not there yet: wait, unless the series is bounded out
            polls += 1;
            if let Some(max) = series.max_polls {
                if polls > max {
                    log::info!("capture series ended at index {index}");
                    break;
                }
            }
            if signals::interrupt_level() > 0 {
                break;
            }
            thread::sleep(Duration::from_secs_f64(series.poll_interval.max(0.05)));
        }
        Ok(())
    }
}

/// Splits a series expression like `dump.pcap007` into its prefix, start
/// index, index width and zero-padding. The separator only disambiguates
/// names whose stem itself ends in digits: everything after its last
/// occurrence is the index.
fn parse_series_expr(expr: &str, separator: char) -> Result<(String, u64, usize, bool)> {
    let tail = expr.rfind(separator).map(|p| p + 1).unwrap_or(0);
    let digits = expr[tail..]
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .count();
    if digits == 0 {
        bail!("capture series expression {expr:?} has no trailing index");
    }
    let split = expr.len() - digits;
    let prefix = &expr[..split];
    let index_str = &expr[split..];
    let start: u64 = index_str.parse().context("capture series index")?;
    let padded = index_str.starts_with('0') && index_str.len() > 1;
    Ok((prefix.to_string(), start, index_str.len(), padded))
}

fn series_file_name(prefix: &str, index: u64, width: usize, padded: bool) -> String {
    if padded {
        format!("{prefix}{index:0width$}")
    } else {
        format!("{prefix}{index}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_expr_keeps_zero_padding() {
        let (prefix, start, width, padded) = parse_series_expr("dump.pcap007", '.').unwrap();
        assert_eq!(prefix, "dump.pcap");
        assert_eq!(start, 7);
        assert!(padded);
        assert_eq!(series_file_name(&prefix, 8, width, padded), "dump.pcap008");
        assert_eq!(series_file_name(&prefix, 1000, width, padded), "dump.pcap1000");
    }

    #[test]
    fn series_expr_without_padding() {
        let (prefix, start, width, padded) = parse_series_expr("trace0", '.').unwrap();
        assert_eq!(prefix, "trace");
        assert_eq!(start, 0);
        assert!(!padded);
        assert_eq!(series_file_name(&prefix, 12, width, padded), "trace12");
    }

    #[test]
    fn series_expr_requires_an_index() {
        assert!(parse_series_expr("trace.pcap", '.').is_err());
    }
}
