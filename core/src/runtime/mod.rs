//! Runtime management.
//!
//! A [`Runtime`] wires a configuration and a plugin registry to the engine
//! and drives one capture source to completion: offline capture files (one
//! file, stdin, a list, or a rolling series) or a live interface. The loop
//! is single-threaded and cooperative; signal handlers only set flags that
//! [`Supervisor::poll`] observes between packets.

mod offline;
mod online;
pub mod signals;

use crate::config::RuntimeConfig;
use crate::engine::Engine;
use crate::fileman::{self, OpenMode};
use crate::plugin::{MonitoringState, PluginRegistry};

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Outcome of one supervisor poll.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Poll {
    Continue,
    /// An interrupt was raised; stop reading packets.
    Stop,
}

/// The analysis runtime.
pub struct Runtime {
    config: RuntimeConfig,
    engine: Engine,
    plugins: PluginRegistry,
    supervisor: Supervisor,
}

impl Runtime {
    /// Builds a runtime from a validated configuration and a resolved
    /// plugin registry.
    pub fn new(config: RuntimeConfig, mut plugins: PluginRegistry) -> Result<Self> {
        config.validate()?;
        plugins.init_all(&config)?;
        log::info!("loaded plugins: {}", plugins.names().join(", "));

        let schema = plugins.build_headers();
        let mut engine = Engine::new(&config, schema);

        if let Some(path) = &config.state_file {
            if let Ok(state) = fs::read_to_string(path) {
                log::info!("restoring session state from {}", path.display());
                restore_state(&state, &mut engine, &mut plugins);
            }
        }

        if config.output.packet_records {
            let sep = &config.output.separator;
            let path = format!("{}_packets.txt", output_prefix(&config));
            let mut manager = fileman::global().lock().unwrap();
            let id = manager
                .open(&path, OpenMode::Write)
                .context("opening the packet record file")?;
            manager.write_str(
                id,
                &format!("pktNo{sep}flowInd{sep}pktStat{sep}hdrDesc{sep}l7Content\n"),
            )?;
            drop(manager);
            engine.set_packet_file(id);
        }

        let supervisor = Supervisor::new(&config);
        Ok(Runtime {
            config,
            engine,
            plugins,
            supervisor,
        })
    }

    /// Runs the capture loop to completion, drains the remaining flows and
    /// prints the end report.
    pub fn run(&mut self) -> Result<()> {
        signals::install()?;
        if let Some(interval) = self.config.monitoring.interval {
            self.supervisor.enabled = true;
            signals::arm_monitor_timer(Some(interval));
        }

        let result = if self.config.online.is_some() {
            online::OnlineRuntime {
                config: &self.config,
                engine: &mut self.engine,
                plugins: &mut self.plugins,
                supervisor: &mut self.supervisor,
            }
            .run()
        } else {
            offline::OfflineRuntime {
                config: &self.config,
                engine: &mut self.engine,
                plugins: &mut self.plugins,
                supervisor: &mut self.supervisor,
            }
            .run()
        };

        signals::arm_monitor_timer(None);
        if signals::interrupt_level() < 3 {
            self.engine.drain(&mut self.plugins);
        }
        self.finish()?;
        result
    }

    /// End report, plugin teardown and the session checkpoint.
    fn finish(&mut self) -> Result<()> {
        let mut out = self.report_target()?;
        self.engine
            .stats
            .print_report(&mut *out, self.engine.now, self.config.sensor_id, false)?;
        for plugin in self.plugins.iter_mut() {
            plugin.report(&mut *out);
        }
        out.flush()?;

        if let Some(path) = &self.config.state_file {
            let mut buf = Vec::new();
            self.engine.stats.save_state(&mut buf)?;
            for plugin in self.plugins.iter_mut() {
                writeln!(buf, "%{}", plugin.name())?;
                plugin.save_state(&mut buf)?;
            }
            fs::write(path, &buf)
                .with_context(|| format!("writing session state to {}", path.display()))?;
        }

        for plugin in self.plugins.iter_mut() {
            plugin.on_app_term();
        }
        Ok(())
    }

    fn report_target(&self) -> Result<Box<dyn Write>> {
        if self.config.output.log_to_file {
            let path = format!("{}_log.txt", output_prefix(&self.config));
            let file = File::create(&path).with_context(|| format!("creating {path}"))?;
            Ok(Box::new(file))
        } else {
            Ok(Box::new(io::stdout()))
        }
    }
}

/// Prefix for every generated file.
pub(crate) fn output_prefix(config: &RuntimeConfig) -> String {
    match config.output.prefix.as_deref() {
        Some("-") | None => "kestrel".to_string(),
        Some(prefix) => prefix.to_string(),
    }
}

fn restore_state(state: &str, engine: &mut Engine, plugins: &mut PluginRegistry) {
    // the shared counter block ends at the first plugin section
    let mut sections = state.split("\n%");
    if let Some(core) = sections.next() {
        engine.stats.restore_state(core);
    }
    for section in sections {
        let (name, body) = section.split_once('\n').unwrap_or((section, ""));
        for plugin in plugins.iter_mut() {
            if plugin.name() == name.trim() {
                plugin.restore_state(body);
            }
        }
    }
}

/// Cooperative supervisor: interrupt levels, the monitoring interval and
/// one-shot report requests.
pub(crate) struct Supervisor {
    pub(crate) enabled: bool,
    machine: bool,
    diff: bool,
    sensor_id: u32,
    wrote_header: bool,
    /// Monitoring file; `None` writes to stdout.
    target: Option<PathBuf>,
}

impl Supervisor {
    fn new(config: &RuntimeConfig) -> Self {
        let target = if config.output.monitoring_to_file {
            Some(PathBuf::from(format!(
                "{}_monitoring.txt",
                output_prefix(config)
            )))
        } else {
            None
        };
        Supervisor {
            enabled: false,
            machine: config.monitoring.machine_readable,
            diff: config.monitoring.diff_mode,
            sensor_id: config.sensor_id,
            wrote_header: false,
            target,
        }
    }

    /// Observes the signal flags; called between packets.
    pub(crate) fn poll(&mut self, engine: &mut Engine, plugins: &mut PluginRegistry) -> Poll {
        if signals::interrupt_level() > 0 {
            return Poll::Stop;
        }
        if signals::take_toggle() {
            self.enabled = !self.enabled;
            log::info!(
                "periodic monitoring {}",
                if self.enabled { "enabled" } else { "disabled" }
            );
        }
        let tick = signals::take_alarm();
        let oneshot = signals::take_report();
        if oneshot || (tick && self.enabled) {
            let state = if oneshot {
                MonitoringState::Report
            } else {
                MonitoringState::Values
            };
            if let Err(e) = self.emit(engine, plugins, state) {
                log::warn!("monitoring output failed: {e}");
            }
        }
        Poll::Continue
    }

    fn emit(
        &mut self,
        engine: &mut Engine,
        plugins: &mut PluginRegistry,
        state: MonitoringState,
    ) -> Result<()> {
        let mut out: Box<dyn Write> = match &self.target {
            Some(path) => Box::new(OpenOptions::new().create(true).append(true).open(path)?),
            None => Box::new(io::stdout()),
        };
        let stats = if self.diff {
            engine.stats.diff()
        } else {
            engine.stats.clone()
        };
        if self.machine {
            if !self.wrote_header {
                self.wrote_header = true;
                for plugin in plugins.iter_mut() {
                    plugin.monitoring(&mut *out, MonitoringState::Header);
                }
            }
            stats.machine_report(&mut *out, engine.now)?;
        } else {
            stats.print_report(&mut *out, engine.now, self.sensor_id, true)?;
        }
        for plugin in plugins.iter_mut() {
            plugin.monitoring(&mut *out, state);
        }
        out.flush()?;
        if self.diff {
            engine.stats.update_anchor(engine.now);
        }
        Ok(())
    }
}

/// Pins the process to `cpu`; with 0 the scheduler keeps its own choice.
pub fn pin_to_core(cpu: usize) -> Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;
    if cpu == 0 {
        return Ok(());
    }
    let mut set = CpuSet::new();
    set.set(cpu).context("cpu outside the affinity range")?;
    sched_setaffinity(Pid::from_raw(0), &set).context("pinning the capture thread")?;
    Ok(())
}

/// Adjusts the scheduling priority of the process.
pub fn set_priority(priority: i32) -> Result<()> {
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) };
    if ret != 0 {
        anyhow::bail!("setting priority {priority} failed");
    }
    Ok(())
}
