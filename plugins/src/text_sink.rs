//! Text row sink.
//!
//! Renders every terminated flow as one separator-delimited line, preceded
//! by a header row concatenating the declared column names. Output goes to
//! `PREFIX_flows.txt`, or to stdout when no prefix is configured. With a
//! roll limit, files are split by size or flow count and numbered from the
//! configured start index.

use kestrel_core::config::{RollLimit, RuntimeConfig};
use kestrel_core::fileman::{self, FileId, OpenMode};
use kestrel_core::plugin::output::OutputReader;
use kestrel_core::plugin::schema::{header_row, render_record, BinaryValue};
use kestrel_core::{OutputBuffer, Plugin};

use std::io::{self, Write};

use anyhow::Result;

enum Target {
    Stdout,
    File { id: FileId, base: String },
}

pub struct TextSink {
    target: Option<Target>,
    separator: String,
    roll: Option<RollLimit>,
    roll_index: u64,
    wrote_header: bool,
    flows_in_file: u64,
    flows_total: u64,
    /// Records that did not decode against the schema.
    bad_records: u64,
}

impl TextSink {
    pub fn new() -> Self {
        TextSink {
            target: None,
            separator: "\t".to_string(),
            roll: None,
            roll_index: 0,
            wrote_header: false,
            flows_in_file: 0,
            flows_total: 0,
            bad_records: 0,
        }
    }

    fn file_name(base: &str, roll: Option<RollLimit>, index: u64) -> String {
        match roll {
            Some(_) => format!("{base}_flows.txt{index}"),
            None => format!("{base}_flows.txt"),
        }
    }

    fn open_target(&mut self, base: &str) -> Result<()> {
        let path = Self::file_name(base, self.roll, self.roll_index);
        let id = fileman::global().lock().unwrap().open(&path, OpenMode::Write)?;
        self.target = Some(Target::File {
            id,
            base: base.to_string(),
        });
        self.wrote_header = false;
        self.flows_in_file = 0;
        Ok(())
    }

    /// Starts the next output fragment when the roll limit is reached.
    fn maybe_roll(&mut self) -> Result<()> {
        let Some(limit) = self.roll else { return Ok(()) };
        let Some(Target::File { id, base }) = &self.target else {
            return Ok(());
        };
        let exceeded = match limit {
            RollLimit::Bytes(max) => fileman::global().lock().unwrap().offset(*id) >= max,
            RollLimit::Flows(max) => self.flows_in_file >= max,
        };
        if exceeded {
            let base = base.clone();
            fileman::global().lock().unwrap().close(*id);
            self.roll_index += 1;
            self.open_target(&base)?;
        }
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        match &self.target {
            Some(Target::File { id, .. }) => {
                fileman::global().lock().unwrap().write_str(*id, line)?;
            }
            _ => {
                io::stdout().write_all(line.as_bytes())?;
            }
        }
        Ok(())
    }
}

impl Default for TextSink {
    fn default() -> Self {
        TextSink::new()
    }
}

impl Plugin for TextSink {
    fn name(&self) -> &'static str {
        "txtSink"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn number(&self) -> u16 {
        901
    }

    fn init(&mut self, config: &RuntimeConfig) -> Result<()> {
        self.separator = config.output.separator.clone();
        self.roll = config.output.roll_limit;
        self.roll_index = config.output.roll_start;
        match config.output.prefix.as_deref() {
            Some("-") | None => self.target = Some(Target::Stdout),
            Some(prefix) => {
                let base = prefix.to_string();
                self.open_target(&base)?;
            }
        }
        Ok(())
    }

    fn buf_to_sink(&mut self, buf: &OutputBuffer, schema: &[BinaryValue]) -> Result<()> {
        if !self.wrote_header {
            self.wrote_header = true;
            let header = format!("%{}\n", header_row(schema, &self.separator));
            self.write_line(&header)?;
        }
        let mut reader = OutputReader::new(buf);
        let sep = self.separator.clone();
        match render_record(schema, &mut reader, &sep) {
            Some(mut row) => {
                row.push('\n');
                self.write_line(&row)?;
                self.flows_in_file += 1;
                self.flows_total += 1;
                self.maybe_roll()?;
            }
            None => {
                self.bad_records += 1;
                log::warn!("flow record shorter than its schema, line dropped");
            }
        }
        Ok(())
    }

    fn report(&mut self, out: &mut dyn Write) {
        let _ = writeln!(
            out,
            "txtSink: {} flow rows written{}",
            self.flows_total,
            if self.bad_records > 0 {
                format!(", {} records dropped", self.bad_records)
            } else {
                String::new()
            }
        );
    }

    fn on_app_term(&mut self) {
        if let Some(Target::File { id, .. }) = &self.target {
            let _ = fileman::global().lock().unwrap().flush(*id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::plugin::schema::ColumnType;

    use std::fs;

    fn schema() -> Vec<BinaryValue> {
        vec![
            BinaryValue::leaf("dir", "direction", ColumnType::FlowDir),
            BinaryValue::leaf("flowInd", "index", ColumnType::U64),
        ]
    }

    fn record(dir: u8, findex: u64) -> OutputBuffer {
        let mut buf = OutputBuffer::new();
        buf.append_u8(dir);
        buf.append_u64(findex);
        buf
    }

    #[test]
    fn writes_header_then_rows() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("test").to_string_lossy().into_owned();
        let mut config = RuntimeConfig::offline("unused.pcap");
        config.output.prefix = Some(prefix.clone());

        let mut sink = TextSink::new();
        sink.init(&config).unwrap();
        sink.buf_to_sink(&record(0, 1), &schema()).unwrap();
        sink.buf_to_sink(&record(1, 1), &schema()).unwrap();
        sink.on_app_term();

        let content = fs::read_to_string(format!("{prefix}_flows.txt")).unwrap();
        assert_eq!(content, "%dir\tflowInd\nA\t1\nB\t1\n");
    }

    #[test]
    fn rolls_by_flow_count() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("roll").to_string_lossy().into_owned();
        let mut config = RuntimeConfig::offline("unused.pcap");
        config.output.prefix = Some(prefix.clone());
        config.output.roll_limit = Some(RollLimit::Flows(2));
        config.output.roll_start = 5;

        let mut sink = TextSink::new();
        sink.init(&config).unwrap();
        for i in 0..3 {
            sink.buf_to_sink(&record(0, i), &schema()).unwrap();
        }
        sink.on_app_term();

        let first = fs::read_to_string(format!("{prefix}_flows.txt5")).unwrap();
        let second = fs::read_to_string(format!("{prefix}_flows.txt6")).unwrap();
        assert_eq!(first.lines().count(), 3); // header + 2 flows
        assert_eq!(second.lines().count(), 2); // header + 1 flow
    }
}
