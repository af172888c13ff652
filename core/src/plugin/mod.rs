//! Plugin contract and dispatch.
//!
//! Plugins observe every packet and every flow lifecycle event and emit
//! per-flow columns on termination. They are compiled into the application
//! and registered with the runtime; the registry resolves the invocation
//! order once at startup (declared dependencies first, plugin number as the
//! tie-breaker) and every fan-out visits plugins in that order.
//!
//! A plugin must never abort the process: errors are surfaced as flow status
//! bits and log messages, and a plugin that would overflow its per-flow
//! capacity truncates its output and tags the flow instead.

pub mod output;
pub mod schema;

pub use self::output::OutputBuffer;

use self::schema::{BinaryValue, ColumnType};
use crate::config::RuntimeConfig;
use crate::dissect::PacketDescriptor;
use crate::flowtable::flow::Flow;

use std::collections::{HashMap, HashSet};
use std::io::Write;

use anyhow::{anyhow, bail, Result};
use petgraph::graph::{DiGraph, NodeIndex};

/// State selector for the `monitoring` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringState {
    /// Print the column header.
    Header,
    /// Print the current values.
    Values,
    /// Print a full report section.
    Report,
}

/// The capability set every analyzer plugin exposes.
///
/// All hooks except `name` and `number` have no-op defaults, so a plugin
/// implements only the events it cares about.
pub trait Plugin {
    /// Unique plugin name; referenced by `deps` and the selection list.
    fn name(&self) -> &'static str;

    /// Plugin version string.
    fn version(&self) -> &'static str {
        "0.1.0"
    }

    /// Non-negative plugin number; orders plugins that dependencies leave
    /// unordered.
    fn number(&self) -> u16;

    /// Names of plugins that must run before this one.
    fn deps(&self) -> &'static [&'static str] {
        &[]
    }

    /// One-time initialization before the first packet.
    fn init(&mut self, _config: &RuntimeConfig) -> Result<()> {
        Ok(())
    }

    /// Declares the columns this plugin emits per flow.
    fn pri_hdr(&self) -> Vec<BinaryValue> {
        Vec::new()
    }

    /// Fires exactly once per flow creation, before further processing of
    /// the creating packet.
    fn on_flow_gen(&mut self, _flow: &Flow, _pkt: &PacketDescriptor) {}

    /// Fires for every packet once the link layer is decoded; `flow` is
    /// `None` for frames without flow attribution.
    fn on_layer2(&mut self, _pkt: &PacketDescriptor, _flow: Option<&Flow>) {}

    /// Fires for every packet attributed to a flow, after dissection.
    fn on_layer4(&mut self, _pkt: &PacketDescriptor, _flow: &mut Flow) {}

    /// Fires exactly once per flow termination; appends this plugin's
    /// columns to the shared output buffer.
    fn on_flow_term(&mut self, _flow: &Flow, _out: &mut OutputBuffer) {}

    /// Consumes the finished record of one terminated flow.
    fn buf_to_sink(&mut self, _buf: &OutputBuffer, _schema: &[BinaryValue]) -> Result<()> {
        Ok(())
    }

    /// Contributes columns to the per-packet forensic record.
    fn packet_record(&mut self, _pkt: &PacketDescriptor, _flow: &Flow, _line: &mut String) {}

    /// Appends a section to the end report.
    fn report(&mut self, _out: &mut dyn Write) {}

    /// Periodic monitoring output.
    fn monitoring(&mut self, _out: &mut dyn Write, _state: MonitoringState) {}

    /// Last call before the application exits; flush and close sinks here.
    fn on_app_term(&mut self) {}

    /// Writes restorable state for the session checkpoint.
    fn save_state(&self, _out: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    /// Restores state saved by a previous session.
    fn restore_state(&mut self, _state: &str) {}
}

/// White- or black-list restricting which registered plugins load.
#[derive(Debug, Clone)]
pub enum PluginSelection {
    Whitelist(HashSet<String>),
    Blacklist(HashSet<String>),
}

impl PluginSelection {
    fn admits(&self, name: &str) -> bool {
        match self {
            PluginSelection::Whitelist(set) => set.contains(name),
            PluginSelection::Blacklist(set) => !set.contains(name),
        }
    }
}

/// Ordered set of loaded plugins.
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginRegistry {
    /// Resolves the load order and builds the registry.
    ///
    /// Fails on unknown dependencies and on dependency cycles; both are
    /// plugin incompatibilities the process must not run with.
    pub fn build(plugins: Vec<Box<dyn Plugin>>) -> Result<Self> {
        Self::with_selection(plugins, None)
    }

    /// Like [`build`](Self::build), filtered by a white- or black-list first.
    pub fn with_selection(
        plugins: Vec<Box<dyn Plugin>>,
        selection: Option<&PluginSelection>,
    ) -> Result<Self> {
        let mut plugins: Vec<Box<dyn Plugin>> = plugins
            .into_iter()
            .filter(|p| selection.map_or(true, |s| s.admits(p.name())))
            .collect();

        let index_of: HashMap<&'static str, usize> = plugins
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name(), i))
            .collect();
        if index_of.len() != plugins.len() {
            bail!("duplicate plugin name in registry");
        }

        // cycle detection over the dependency graph
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..plugins.len()).map(|i| graph.add_node(i)).collect();
        for (i, plugin) in plugins.iter().enumerate() {
            for dep in plugin.deps() {
                let j = *index_of.get(dep).ok_or_else(|| {
                    anyhow!(
                        "plugin {} depends on {}, which is not loaded",
                        plugin.name(),
                        dep
                    )
                })?;
                graph.add_edge(nodes[j], nodes[i], ());
            }
        }
        if petgraph::algo::is_cyclic_directed(&graph) {
            bail!("plugin dependency cycle detected");
        }

        // Kahn's algorithm, always taking the lowest plugin number among the
        // ready set so numbers break ties that dependencies leave open
        let mut remaining: Vec<usize> = (0..plugins.len()).collect();
        let mut order: Vec<usize> = Vec::with_capacity(plugins.len());
        let mut placed: HashSet<usize> = HashSet::new();
        while !remaining.is_empty() {
            let mut ready: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&i| {
                    plugins[i]
                        .deps()
                        .iter()
                        .all(|dep| placed.contains(&index_of[dep]))
                })
                .collect();
            ready.sort_by_key(|&i| (plugins[i].number(), i));
            let next = ready[0];
            order.push(next);
            placed.insert(next);
            remaining.retain(|&i| i != next);
        }

        // reorder the boxed plugins without cloning
        let mut slots: Vec<Option<Box<dyn Plugin>>> = plugins.drain(..).map(Some).collect();
        let ordered = order
            .into_iter()
            .map(|i| slots[i].take().expect("each plugin placed once"))
            .collect();

        Ok(PluginRegistry { plugins: ordered })
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Box<dyn Plugin>> {
        self.plugins.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Plugin>> {
        self.plugins.iter_mut()
    }

    /// Names in invocation order.
    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Runs every plugin's `init` hook.
    pub fn init_all(&mut self, config: &RuntimeConfig) -> Result<()> {
        for plugin in &mut self.plugins {
            plugin
                .init(config)
                .map_err(|e| anyhow!("plugin {} failed to initialize: {e}", plugin.name()))?;
        }
        Ok(())
    }

    /// Builds the full record schema: the engine's `dir` and `flowInd`
    /// columns followed by each plugin's declared columns in registry order.
    pub fn build_headers(&self) -> Vec<BinaryValue> {
        let mut schema = vec![
            BinaryValue::leaf("dir", "Flow direction", ColumnType::FlowDir),
            BinaryValue::leaf("flowInd", "Flow index", ColumnType::U64),
        ];
        for plugin in &self.plugins {
            schema.extend(plugin.pri_hdr());
        }
        schema
    }
}
