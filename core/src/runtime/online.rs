//! Live capture from a network interface.

use super::{Poll, Supervisor};
use crate::config::RuntimeConfig;
use crate::dissect::LinkType;
use crate::engine::Engine;
use crate::plugin::PluginRegistry;
use crate::utils::timeval::Timeval;

use anyhow::{anyhow, Context, Result};
use pcap::Capture;

/// Read timeout so the loop can observe signal flags while idle.
const POLL_TIMEOUT_MS: i32 = 500;

pub(crate) struct OnlineRuntime<'a> {
    pub(crate) config: &'a RuntimeConfig,
    pub(crate) engine: &'a mut Engine,
    pub(crate) plugins: &'a mut PluginRegistry,
    pub(crate) supervisor: &'a mut Supervisor,
}

impl OnlineRuntime<'_> {
    pub(crate) fn run(&mut self) -> Result<()> {
        let online = self.config.online.as_ref().expect("online config checked");
        log::info!("listening on {}", online.device);

        let mut inactive = Capture::from_device(online.device.as_str())
            .with_context(|| format!("opening device {}", online.device))?
            .promisc(online.promiscuous)
            .snaplen(online.snaplen)
            .timeout(POLL_TIMEOUT_MS);
        if let Some(buffer_size) = online.buffer_size {
            inactive = inactive.buffer_size(buffer_size);
        }
        let mut cap = inactive
            .open()
            .with_context(|| format!("activating capture on {}", online.device))?;
        if let Some(bpf) = &self.config.bpf {
            cap.filter(bpf)
                .map_err(|e| anyhow!("invalid BPF filter {bpf:?}: {e}"))?;
        }
        self.engine
            .set_link_type(LinkType::from_dlt(cap.get_datalink().0));

        loop {
            match cap.next() {
                Ok(frame) => {
                    let ts = Timeval::new(
                        frame.header.ts.tv_sec as i64,
                        frame.header.ts.tv_usec as i64,
                    );
                    self.engine
                        .process_packet(frame.data, frame.header.len, ts, self.plugins)?;
                }
                Err(pcap::Error::TimeoutExpired) => {}
                Err(e) => {
                    log::warn!("capture read failed: {e}");
                    break;
                }
            }
            if self.supervisor.poll(self.engine, self.plugins) == Poll::Stop {
                break;
            }
        }

        if let Ok(pcap_stats) = cap.stats() {
            log::info!(
                "interface statistics: {} received, {} dropped, {} dropped by the interface",
                pcap_stats.received,
                pcap_stats.dropped,
                pcap_stats.if_dropped
            );
        }
        Ok(())
    }
}
