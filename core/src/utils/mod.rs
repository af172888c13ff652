//! Shared primitive types and helpers.

pub mod timeval;
pub mod types;

use anyhow::{bail, Result};

use crate::protocols::packet::PacketParseError;

/// Reads a fixed-size header structure at `offset` in `frame`.
///
/// The read is unaligned; `T` must be a `repr(C, packed)` plain-data struct.
#[inline]
pub(crate) fn read_header<T: Copy>(frame: &[u8], offset: usize) -> Result<T> {
    let size = std::mem::size_of::<T>();
    if offset.checked_add(size).map_or(true, |end| end > frame.len()) {
        bail!(PacketParseError::InvalidRead);
    }
    let ptr = frame[offset..].as_ptr() as *const T;
    Ok(unsafe { ptr.read_unaligned() })
}
