//! SCTP packet and chunk headers.

use crate::utils::read_header;
use crate::utils::types::*;

use anyhow::Result;

/// SCTP common header length in bytes.
pub const SCTP_HDR_LEN: usize = 12;
/// SCTP chunk header length in bytes.
pub const SCTP_CHUNK_HDR_LEN: usize = 4;
/// Chunk type of a DATA chunk.
pub const SCTP_CHUNK_DATA: u8 = 0;
/// Offset from a DATA chunk header to its user payload.
pub const SCTP_DATA_CHUNK_LEN: usize = 16;

/// An SCTP common header view.
#[derive(Debug)]
pub struct Sctp {
    header: SctpHeader,
    offset: usize,
}

impl Sctp {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Self> {
        let header: SctpHeader = read_header(frame, offset)?;
        Ok(Sctp { header, offset })
    }

    /// Returns the sending port.
    #[inline]
    pub fn src_port(&self) -> u16 {
        self.header.src_port.into()
    }

    /// Returns the receiving port.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        self.header.dst_port.into()
    }

    /// Returns the verification tag.
    #[inline]
    pub fn verification_tag(&self) -> u32 {
        self.header.verification_tag.into()
    }

    /// Offset of the first chunk.
    #[inline]
    pub fn chunk_offset(&self) -> usize {
        self.offset + SCTP_HDR_LEN
    }
}

/// Fixed portion of an SCTP common header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct SctpHeader {
    src_port: u16be,
    dst_port: u16be,
    verification_tag: u32be,
    checksum: u32be,
}

/// An SCTP chunk header view; for DATA chunks the stream identifier is
/// available as well.
#[derive(Debug)]
pub struct SctpChunk {
    header: SctpChunkHeader,
    offset: usize,
}

impl SctpChunk {
    pub fn parse(frame: &[u8], offset: usize) -> Result<Self> {
        let header: SctpChunkHeader = read_header(frame, offset)?;
        Ok(SctpChunk { header, offset })
    }

    /// Returns the chunk type.
    #[inline]
    pub fn chunk_type(&self) -> u8 {
        self.header.chunk_type
    }

    /// Returns `true` for DATA chunks.
    #[inline]
    pub fn is_data(&self) -> bool {
        self.header.chunk_type == SCTP_CHUNK_DATA
    }

    /// Returns the chunk length in bytes, padding excluded.
    #[inline]
    pub fn length(&self) -> u16 {
        self.header.length.into()
    }

    /// Returns the number of padding bytes to the next 4-byte boundary.
    #[inline]
    pub fn padding(&self) -> u16 {
        let rem = self.length() % 4;
        if rem == 0 {
            0
        } else {
            4 - rem
        }
    }

    /// Returns the stream identifier of a DATA chunk.
    ///
    /// Reads the chunk-specific portion; fails on a truncated chunk and is
    /// meaningless for non-DATA chunks.
    pub fn stream_id(&self, frame: &[u8]) -> Result<u16> {
        let data: SctpDataChunkFields = read_header(frame, self.offset + SCTP_CHUNK_HDR_LEN)?;
        Ok(data.stream_id.into())
    }
}

/// Fixed portion of an SCTP chunk header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct SctpChunkHeader {
    chunk_type: u8,
    flags: u8,
    length: u16be,
}

/// Chunk-specific fields of a DATA chunk.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct SctpDataChunkFields {
    tsn: u32be,
    stream_id: u16be,
    stream_seq: u16be,
    ppid: u32be,
}
