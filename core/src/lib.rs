//! A flow-centric framework for passive network traffic analysis.
//!
//! Kestrel consumes link-layer frames from a live interface or from capture
//! files and produces one record per bidirectional conversation. Every frame
//! runs through a recursive protocol dissector (link layer, tunnels, IPv4/6,
//! transport), is attributed to a flow tracked in a fixed-capacity hash-indexed
//! table with LRU timeout management, and is offered to an ordered set of
//! plugins. When a flow terminates, plugins emit their typed columns into a
//! shared output buffer which sinks render as text or binary rows.
//!
//! The crate exposes the engine and the plugin contract; analyzer plugins and
//! the command-line front-end live in sibling crates. A minimal application
//! looks like:
//!
//! ```no_run
//! use kestrel_core::config::RuntimeConfig;
//! use kestrel_core::plugin::PluginRegistry;
//! use kestrel_core::Runtime;
//!
//! let config = RuntimeConfig::offline("./traces/example.pcap");
//! let registry = PluginRegistry::build(vec![]).unwrap();
//! let mut runtime = Runtime::new(config, registry).unwrap();
//! runtime.run().unwrap();
//! ```

pub mod config;
pub mod dissect;
pub mod engine;
pub mod fileman;
pub mod flowtable;
pub mod plugin;
pub mod protocols;
pub mod runtime;
pub mod utils;

pub use self::dissect::PacketDescriptor;
pub use self::flowtable::flow::{Flow, FlowKey, FlowStatus};
pub use self::plugin::output::OutputBuffer;
pub use self::plugin::Plugin;
pub use self::runtime::Runtime;
pub use self::utils::timeval::Timeval;

#[macro_use]
extern crate lazy_static;
