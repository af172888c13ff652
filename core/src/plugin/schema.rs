//! Output record schema.
//!
//! Each plugin declares the columns it will emit per flow as a list of
//! [`BinaryValue`]s. The engine concatenates them, in registry order, behind
//! the two engine-owned columns (`dir`, `flowInd`). Sinks walk the schema to
//! decode the output buffer: text sinks render one column per value, the
//! binary sink stores records as-is and ships the schema once.

use super::output::OutputReader;

use std::fmt::Write;

/// Leaf value types of the output schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// 64-bit bitset rendered as hex.
    Hex64,
    /// NUL-terminated string.
    Str,
    /// Seconds and microseconds since the epoch.
    Timestamp,
    /// Seconds and microseconds, rendered as a decimal duration.
    Duration,
    Mac,
    Ip4,
    Ip6,
    /// Flow direction, rendered `A` or `B`.
    FlowDir,
}

/// One declared output column.
#[derive(Debug, Clone)]
pub struct BinaryValue {
    pub name: String,
    pub description: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone)]
pub enum ColumnKind {
    Leaf(ColumnType),
    /// Count-prefixed repetition of a column group.
    Repeated(Vec<BinaryValue>),
}

impl BinaryValue {
    pub fn leaf(name: &str, description: &str, ty: ColumnType) -> Self {
        BinaryValue {
            name: name.to_string(),
            description: description.to_string(),
            kind: ColumnKind::Leaf(ty),
        }
    }

    pub fn repeated(name: &str, description: &str, group: Vec<BinaryValue>) -> Self {
        BinaryValue {
            name: name.to_string(),
            description: description.to_string(),
            kind: ColumnKind::Repeated(group),
        }
    }
}

/// Renders the header row of a schema.
pub fn header_row(schema: &[BinaryValue], separator: &str) -> String {
    schema
        .iter()
        .map(|bv| bv.name.as_str())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Decodes one record from `reader` into text columns.
///
/// Returns `None` when the buffer ends prematurely, which means a plugin
/// emitted fewer values than its schema declares.
pub fn render_record(
    schema: &[BinaryValue],
    reader: &mut OutputReader,
    separator: &str,
) -> Option<String> {
    let mut row = String::new();
    for (i, bv) in schema.iter().enumerate() {
        if i > 0 {
            row.push_str(separator);
        }
        render_value(bv, reader, &mut row)?;
    }
    Some(row)
}

fn render_value(bv: &BinaryValue, reader: &mut OutputReader, out: &mut String) -> Option<()> {
    match &bv.kind {
        ColumnKind::Leaf(ty) => render_leaf(*ty, reader, out),
        ColumnKind::Repeated(group) => {
            let count = reader.read_u32()?;
            for rep in 0..count {
                if rep > 0 {
                    out.push(';');
                }
                for (i, sub) in group.iter().enumerate() {
                    if i > 0 {
                        out.push('_');
                    }
                    render_value(sub, reader, out)?;
                }
            }
            Some(())
        }
    }
}

fn render_leaf(ty: ColumnType, reader: &mut OutputReader, out: &mut String) -> Option<()> {
    match ty {
        ColumnType::U8 => write!(out, "{}", reader.read_u8()?).ok()?,
        ColumnType::U16 => write!(out, "{}", reader.read_u16()?).ok()?,
        ColumnType::U32 => write!(out, "{}", reader.read_u32()?).ok()?,
        ColumnType::U64 => write!(out, "{}", reader.read_u64()?).ok()?,
        ColumnType::I8 => write!(out, "{}", reader.read_i8()?).ok()?,
        ColumnType::I16 => write!(out, "{}", reader.read_i16()?).ok()?,
        ColumnType::I32 => write!(out, "{}", reader.read_i32()?).ok()?,
        ColumnType::I64 => write!(out, "{}", reader.read_i64()?).ok()?,
        ColumnType::F32 => write!(out, "{}", reader.read_f32()?).ok()?,
        ColumnType::F64 => write!(out, "{}", reader.read_f64()?).ok()?,
        ColumnType::Hex64 => write!(out, "0x{:016x}", reader.read_u64()?).ok()?,
        ColumnType::Str => out.push_str(&reader.read_str()?),
        ColumnType::Timestamp => {
            let (sec, usec) = reader.read_time()?;
            write!(out, "{}.{:06}", sec, usec).ok()?;
        }
        ColumnType::Duration => {
            let (sec, usec) = reader.read_time()?;
            write!(out, "{}.{:06}", sec, usec).ok()?;
        }
        ColumnType::Mac => {
            let mac = reader.read_mac()?;
            write!(
                out,
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            )
            .ok()?;
        }
        ColumnType::Ip4 => write!(out, "{}", reader.read_ip4()?).ok()?,
        ColumnType::Ip6 => write!(out, "{}", reader.read_ip6()?).ok()?,
        ColumnType::FlowDir => {
            let dir = reader.read_u8()?;
            out.push(if dir == 0 { 'A' } else { 'B' });
        }
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::output::OutputBuffer;

    fn schema() -> Vec<BinaryValue> {
        vec![
            BinaryValue::leaf("dir", "Flow direction", ColumnType::FlowDir),
            BinaryValue::leaf("flowInd", "Flow index", ColumnType::U64),
            BinaryValue::leaf("srcIP4", "Source address", ColumnType::Ip4),
            BinaryValue::repeated(
                "tags",
                "Observed tags",
                vec![BinaryValue::leaf("tag", "Tag", ColumnType::Str)],
            ),
        ]
    }

    #[test]
    fn header_concatenates_names() {
        assert_eq!(header_row(&schema(), "\t"), "dir\tflowInd\tsrcIP4\ttags");
    }

    #[test]
    fn record_renders_by_schema() {
        let mut buf = OutputBuffer::new();
        buf.append_u8(1);
        buf.append_u64(7);
        buf.append_ip4("10.0.0.2".parse().unwrap());
        buf.append_num_rep(2);
        buf.append_str("x");
        buf.append_str("y");

        let mut reader = OutputReader::new(&buf);
        let row = render_record(&schema(), &mut reader, "\t").unwrap();
        assert_eq!(row, "B\t7\t10.0.0.2\tx;y");
    }

    #[test]
    fn short_record_is_detected() {
        let mut buf = OutputBuffer::new();
        buf.append_u8(0);
        let mut reader = OutputReader::new(&buf);
        assert!(render_record(&schema(), &mut reader, "\t").is_none());
    }
}
