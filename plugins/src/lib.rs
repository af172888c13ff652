//! Built-in analyzer plugins.
//!
//! These plugins exercise the full plugin contract of `kestrel-core`:
//! `basic_flow` emits the canonical per-flow column set, `text_sink` renders
//! terminated flows as separator-delimited rows with a header line, and
//! `bin_sink` stores the raw length-prefixed records for later conversion.

pub mod basic_flow;
pub mod bin_sink;
pub mod text_sink;

pub use basic_flow::BasicFlow;
pub use bin_sink::BinSink;
pub use text_sink::TextSink;

use kestrel_core::Plugin;

/// The plugin set a typical flow-export run loads.
pub fn default_plugins() -> Vec<Box<dyn Plugin>> {
    vec![
        Box::new(BasicFlow::new()),
        Box::new(TextSink::new()),
    ]
}

/// Every built-in plugin; selection lists narrow this set down.
pub fn all_plugins() -> Vec<Box<dyn Plugin>> {
    vec![
        Box::new(BasicFlow::new()),
        Box::new(BinSink::new()),
        Box::new(TextSink::new()),
    ]
}
