//! Binary row sink.
//!
//! Stores every terminated flow as a length-prefixed copy of the shared
//! output buffer in `PREFIX_flows.bin`, and describes the column layout once
//! in `PREFIX_headers.txt` so a separate converter can decode the records.

use kestrel_core::config::RuntimeConfig;
use kestrel_core::fileman::{self, FileId, OpenMode};
use kestrel_core::plugin::schema::{BinaryValue, ColumnKind};
use kestrel_core::{OutputBuffer, Plugin};

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// File magic of binary flow files.
pub const BIN_MAGIC: &[u8; 4] = b"KSTB";
/// Current binary format version.
pub const BIN_VERSION: u16 = 1;

pub struct BinSink {
    file: Option<FileId>,
    prefix: Option<String>,
    wrote_headers: bool,
    records: u64,
}

impl BinSink {
    pub fn new() -> Self {
        BinSink {
            file: None,
            prefix: None,
            wrote_headers: false,
            records: 0,
        }
    }

    /// Writes the column description file a converter needs.
    fn write_headers(&self, schema: &[BinaryValue]) -> Result<()> {
        let Some(prefix) = &self.prefix else { return Ok(()) };
        let mut out = File::create(format!("{prefix}_headers.txt"))?;
        for bv in schema {
            describe(&mut out, bv, 0)?;
        }
        Ok(())
    }
}

fn describe(out: &mut dyn Write, bv: &BinaryValue, depth: usize) -> Result<()> {
    match &bv.kind {
        ColumnKind::Leaf(ty) => {
            writeln!(out, "{}{}\t{:?}\t{}", "  ".repeat(depth), bv.name, ty, bv.description)?
        }
        ColumnKind::Repeated(group) => {
            writeln!(
                out,
                "{}{}\trepeated\t{}",
                "  ".repeat(depth),
                bv.name,
                bv.description
            )?;
            for sub in group {
                describe(out, sub, depth + 1)?;
            }
        }
    }
    Ok(())
}

impl Default for BinSink {
    fn default() -> Self {
        BinSink::new()
    }
}

impl Plugin for BinSink {
    fn name(&self) -> &'static str {
        "binSink"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn number(&self) -> u16 {
        900
    }

    fn init(&mut self, config: &RuntimeConfig) -> Result<()> {
        let Some(prefix) = config.output.prefix.as_deref().filter(|p| *p != "-") else {
            log::warn!("binSink needs an output prefix, records will be dropped");
            return Ok(());
        };
        self.prefix = Some(prefix.to_string());
        let path = format!("{prefix}_flows.bin");
        let mut manager = fileman::global().lock().unwrap();
        let id = manager.open(&path, OpenMode::Write)?;
        let mut preamble = Vec::with_capacity(6);
        preamble.extend_from_slice(BIN_MAGIC);
        preamble.write_u16::<LittleEndian>(BIN_VERSION)?;
        manager.write(id, &preamble)?;
        self.file = Some(id);
        Ok(())
    }

    fn buf_to_sink(&mut self, buf: &OutputBuffer, schema: &[BinaryValue]) -> Result<()> {
        let Some(id) = self.file else { return Ok(()) };
        if !self.wrote_headers {
            self.wrote_headers = true;
            self.write_headers(schema)?;
        }
        let mut framed = Vec::with_capacity(4 + buf.len());
        framed.write_u32::<LittleEndian>(buf.len() as u32)?;
        framed.extend_from_slice(buf.as_bytes());
        fileman::global().lock().unwrap().write(id, &framed)?;
        self.records += 1;
        Ok(())
    }

    fn report(&mut self, out: &mut dyn Write) {
        let _ = writeln!(out, "binSink: {} binary records written", self.records);
    }

    fn on_app_term(&mut self) {
        if let Some(id) = self.file {
            let _ = fileman::global().lock().unwrap().flush(id);
        }
    }
}

/// Reader for binary flow files, used by converters and tests.
pub struct BinRecordReader {
    file: File,
}

impl BinRecordReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(&path)
            .with_context(|| format!("opening {}", path.as_ref().display()))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != BIN_MAGIC {
            bail!("not a kestrel binary flow file");
        }
        let version = file.read_u16::<LittleEndian>()?;
        if version != BIN_VERSION {
            bail!("unsupported binary format version {version}");
        }
        Ok(BinRecordReader { file })
    }
}

impl Iterator for BinRecordReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = match self.file.read_u32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(_) => return None,
        };
        let mut record = vec![0u8; len];
        match self.file.read_exact(&mut record) {
            Ok(()) => Some(Ok(record)),
            Err(e) => Some(Err(e.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::plugin::output::OutputReader;
    use kestrel_core::plugin::schema::ColumnType;

    #[test]
    fn records_round_trip_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("bin").to_string_lossy().into_owned();
        let mut config = RuntimeConfig::offline("unused.pcap");
        config.output.prefix = Some(prefix.clone());

        let schema = vec![
            BinaryValue::leaf("dir", "direction", ColumnType::FlowDir),
            BinaryValue::leaf("flowInd", "index", ColumnType::U64),
            BinaryValue::leaf("name", "name", ColumnType::Str),
        ];

        let mut sink = BinSink::new();
        sink.init(&config).unwrap();
        for (dir_byte, findex, name) in [(0u8, 1u64, "first"), (1, 1, "second")] {
            let mut buf = OutputBuffer::new();
            buf.append_u8(dir_byte);
            buf.append_u64(findex);
            buf.append_str(name);
            sink.buf_to_sink(&buf, &schema).unwrap();
        }
        sink.on_app_term();

        let records: Vec<Vec<u8>> = BinRecordReader::open(format!("{prefix}_flows.bin"))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 2);

        let mut reader = OutputReader::from_bytes(&records[1]);
        assert_eq!(reader.read_u8(), Some(1));
        assert_eq!(reader.read_u64(), Some(1));
        assert_eq!(reader.read_str().as_deref(), Some("second"));

        // the headers description exists and names every column
        let headers = std::fs::read_to_string(format!("{prefix}_headers.txt")).unwrap();
        assert!(headers.contains("flowInd"));
    }
}
