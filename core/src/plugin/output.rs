//! Shared output buffer.
//!
//! During flow termination every plugin appends its typed column values in
//! the order declared by its schema; sinks then consume the buffer as one
//! record. Values are encoded little-endian, strings NUL-terminated,
//! repetitions prefixed with a 32-bit count. The buffer grows on demand up
//! to a fixed ceiling; beyond it appends are dropped and the truncation is
//! reported so the plugin can tag the flow.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use std::io::Cursor;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Initial buffer capacity in bytes.
pub const OUTBUF_SIZE: usize = 64 * 1024;
/// Growth ceiling as a multiple of the initial size.
pub const OUTBUF_MAX_FACTOR: usize = 5;

#[derive(Debug, Default)]
pub struct OutputBuffer {
    buf: Vec<u8>,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new() -> Self {
        OutputBuffer {
            buf: Vec::with_capacity(OUTBUF_SIZE),
            truncated: false,
        }
    }

    #[inline]
    fn fits(&mut self, extra: usize) -> bool {
        if self.buf.len() + extra > OUTBUF_SIZE * OUTBUF_MAX_FACTOR {
            self.truncated = true;
            return false;
        }
        true
    }

    /// Clears the buffer for the next record.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.truncated = false;
    }

    /// Returns `true` if an append was dropped since the last reset.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn append_u8(&mut self, val: u8) {
        if self.fits(1) {
            self.buf.push(val);
        }
    }

    pub fn append_u16(&mut self, val: u16) {
        if self.fits(2) {
            self.buf.write_u16::<LittleEndian>(val).unwrap();
        }
    }

    pub fn append_u32(&mut self, val: u32) {
        if self.fits(4) {
            self.buf.write_u32::<LittleEndian>(val).unwrap();
        }
    }

    pub fn append_u64(&mut self, val: u64) {
        if self.fits(8) {
            self.buf.write_u64::<LittleEndian>(val).unwrap();
        }
    }

    pub fn append_i8(&mut self, val: i8) {
        if self.fits(1) {
            self.buf.write_i8(val).unwrap();
        }
    }

    pub fn append_i16(&mut self, val: i16) {
        if self.fits(2) {
            self.buf.write_i16::<LittleEndian>(val).unwrap();
        }
    }

    pub fn append_i32(&mut self, val: i32) {
        if self.fits(4) {
            self.buf.write_i32::<LittleEndian>(val).unwrap();
        }
    }

    pub fn append_i64(&mut self, val: i64) {
        if self.fits(8) {
            self.buf.write_i64::<LittleEndian>(val).unwrap();
        }
    }

    pub fn append_f32(&mut self, val: f32) {
        if self.fits(4) {
            self.buf.write_f32::<LittleEndian>(val).unwrap();
        }
    }

    pub fn append_f64(&mut self, val: f64) {
        if self.fits(8) {
            self.buf.write_f64::<LittleEndian>(val).unwrap();
        }
    }

    /// Appends a NUL-terminated string.
    pub fn append_str(&mut self, val: &str) {
        if self.fits(val.len() + 1) {
            self.buf.extend_from_slice(val.as_bytes());
            self.buf.push(0);
        }
    }

    /// Appends a timestamp as seconds and microseconds.
    pub fn append_time(&mut self, sec: u64, usec: u32) {
        self.append_u64(sec);
        self.append_u32(usec);
    }

    pub fn append_mac(&mut self, mac: [u8; 6]) {
        if self.fits(6) {
            self.buf.extend_from_slice(&mac);
        }
    }

    pub fn append_ip4(&mut self, addr: Ipv4Addr) {
        if self.fits(4) {
            self.buf.extend_from_slice(&addr.octets());
        }
    }

    pub fn append_ip6(&mut self, addr: Ipv6Addr) {
        if self.fits(16) {
            self.buf.extend_from_slice(&addr.octets());
        }
    }

    /// Appends the element count of a repeated group.
    pub fn append_num_rep(&mut self, reps: u32) {
        self.append_u32(reps);
    }
}

/// Sequential reader over a finished record, used by sinks and tests.
pub struct OutputReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> OutputReader<'a> {
    pub fn new(buf: &'a OutputBuffer) -> Self {
        OutputReader {
            cursor: Cursor::new(buf.as_bytes()),
        }
    }

    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        OutputReader {
            cursor: Cursor::new(bytes),
        }
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.cursor.read_u8().ok()
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.cursor.read_u16::<LittleEndian>().ok()
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.cursor.read_u32::<LittleEndian>().ok()
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        self.cursor.read_u64::<LittleEndian>().ok()
    }

    pub fn read_i8(&mut self) -> Option<i8> {
        self.cursor.read_i8().ok()
    }

    pub fn read_i16(&mut self) -> Option<i16> {
        self.cursor.read_i16::<LittleEndian>().ok()
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        self.cursor.read_i32::<LittleEndian>().ok()
    }

    pub fn read_i64(&mut self) -> Option<i64> {
        self.cursor.read_i64::<LittleEndian>().ok()
    }

    pub fn read_f32(&mut self) -> Option<f32> {
        self.cursor.read_f32::<LittleEndian>().ok()
    }

    pub fn read_f64(&mut self) -> Option<f64> {
        self.cursor.read_f64::<LittleEndian>().ok()
    }

    pub fn read_str(&mut self) -> Option<String> {
        let bytes = self.cursor.get_ref();
        let start = self.cursor.position() as usize;
        let end = bytes[start..].iter().position(|&b| b == 0)? + start;
        let s = String::from_utf8_lossy(&bytes[start..end]).into_owned();
        self.cursor.set_position(end as u64 + 1);
        Some(s)
    }

    pub fn read_time(&mut self) -> Option<(u64, u32)> {
        Some((self.read_u64()?, self.read_u32()?))
    }

    pub fn read_mac(&mut self) -> Option<[u8; 6]> {
        let mut mac = [0u8; 6];
        self.read_exact(&mut mac)?;
        Some(mac)
    }

    pub fn read_ip4(&mut self) -> Option<Ipv4Addr> {
        let mut octets = [0u8; 4];
        self.read_exact(&mut octets)?;
        Some(Ipv4Addr::from(octets))
    }

    pub fn read_ip6(&mut self) -> Option<Ipv6Addr> {
        let mut octets = [0u8; 16];
        self.read_exact(&mut octets)?;
        Some(Ipv6Addr::from(octets))
    }

    fn read_exact(&mut self, out: &mut [u8]) -> Option<()> {
        use std::io::Read;
        self.cursor.read_exact(out).ok()
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.cursor.position() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_values_round_trip() {
        let mut buf = OutputBuffer::new();
        buf.append_u8(1);
        buf.append_u64(0xdead_beef);
        buf.append_i64(-42);
        buf.append_f64(2.5);
        buf.append_str("kestrel");
        buf.append_time(1_700_000_000, 123_456);
        buf.append_ip4(Ipv4Addr::new(10, 0, 0, 1));
        buf.append_mac([2, 0, 0, 0, 0, 1]);
        buf.append_num_rep(2);

        let mut r = OutputReader::new(&buf);
        assert_eq!(r.read_u8(), Some(1));
        assert_eq!(r.read_u64(), Some(0xdead_beef));
        assert_eq!(r.read_i64(), Some(-42));
        assert_eq!(r.read_f64(), Some(2.5));
        assert_eq!(r.read_str().as_deref(), Some("kestrel"));
        assert_eq!(r.read_time(), Some((1_700_000_000, 123_456)));
        assert_eq!(r.read_ip4(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(r.read_mac(), Some([2, 0, 0, 0, 0, 1]));
        assert_eq!(r.read_u32(), Some(2));
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn reset_clears_content_and_truncation() {
        let mut buf = OutputBuffer::new();
        buf.append_str(&"x".repeat(OUTBUF_SIZE * OUTBUF_MAX_FACTOR));
        assert!(buf.truncated());
        buf.reset();
        assert!(!buf.truncated());
        assert!(buf.is_empty());
    }

    #[test]
    fn appends_beyond_ceiling_are_dropped() {
        let mut buf = OutputBuffer::new();
        let big = "y".repeat(OUTBUF_SIZE * OUTBUF_MAX_FACTOR - 1);
        buf.append_str(&big);
        let len = buf.len();
        buf.append_u64(7);
        assert_eq!(buf.len(), len);
        assert!(buf.truncated());
    }
}
