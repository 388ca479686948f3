//! Binary layout of a version file: magic, encrypted header, segment table.
//!
//! On-disk shape (all integers big-endian):
//!
//! ```text
//! "SOV1"            4 bytes, magic
//! header_len        u32
//! header bytes      header_len bytes (opaque, produced by the encryption pipeline)
//! segment_count     u32
//! segment_count * { kind: u8, this_ver_ofs: u64, len: u64, source_ofs: u64 }
//! ```
//!
//! Segment bytes for `Present` chunks live after the table, at the file offset
//! recorded by the caller (see `ObjOnDisk`); this module only encodes/decodes
//! the table itself, not the bulk segment data.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{Result, WireError};

const MAGIC: [u8; 4] = *b"SOV1";

/// Where a chunk's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSource {
    /// Bytes are stored in this file at `disk_ofs`.
    Present { disk_ofs: u64 },
    /// Bytes are not in this file; read them from the base version at `base_ofs`.
    Base { base_ofs: u64 },
}

/// A single contiguous range of the logical byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiniteChunk {
    pub this_ver_ofs: u64,
    pub len: u64,
    pub source: ChunkSource,
}

impl FiniteChunk {
    pub fn end_ofs(&self) -> u64 {
        self.this_ver_ofs + self.len
    }

    pub fn is_present(&self) -> bool {
        matches!(self.source, ChunkSource::Present { .. })
    }
}

/// The full segment table for one version file, plus the opaque encrypted header.
#[derive(Debug, Clone)]
pub struct LayoutTable {
    pub header: Vec<u8>,
    pub chunks: Vec<FiniteChunk>,
}

impl LayoutTable {
    pub fn new(header: Vec<u8>, chunks: Vec<FiniteChunk>) -> Self {
        Self { header, chunks }
    }

    /// Total logical length of the version, i.e. the end offset of the last chunk.
    pub fn total_len(&self) -> u64 {
        self.chunks.last().map(FiniteChunk::end_ofs).unwrap_or(0)
    }

    /// Byte length this table occupies once encoded, so callers know where
    /// segment data starts in the file.
    pub fn encoded_len(&self) -> u64 {
        4 + 4 + self.header.len() as u64 + 4 + self.chunks.len() as u64 * (1 + 8 + 8 + 8)
    }

    pub fn encode<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_all(&MAGIC)?;
        w.write_u32::<BigEndian>(self.header.len() as u32)?;
        w.write_all(&self.header)?;
        w.write_u32::<BigEndian>(self.chunks.len() as u32)?;
        for chunk in &self.chunks {
            let (kind, source_ofs) = match chunk.source {
                ChunkSource::Present { disk_ofs } => (0u8, disk_ofs),
                ChunkSource::Base { base_ofs } => (1u8, base_ofs),
            };
            w.write_u8(kind)?;
            w.write_u64::<BigEndian>(chunk.this_ver_ofs)?;
            w.write_u64::<BigEndian>(chunk.len)?;
            w.write_u64::<BigEndian>(source_ofs)?;
        }
        Ok(())
    }

    pub fn decode<R: Read>(mut r: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let header_len = r.read_u32::<BigEndian>()? as usize;
        let mut header = vec![0u8; header_len];
        r.read_exact(&mut header)?;

        let segment_count = r.read_u32::<BigEndian>()? as usize;
        let mut chunks = Vec::with_capacity(segment_count);
        for _ in 0..segment_count {
            let kind = r.read_u8()?;
            let this_ver_ofs = r.read_u64::<BigEndian>()?;
            let len = r.read_u64::<BigEndian>()?;
            let source_ofs = r.read_u64::<BigEndian>()?;
            let source = match kind {
                0 => ChunkSource::Present {
                    disk_ofs: source_ofs,
                },
                1 => ChunkSource::Base {
                    base_ofs: source_ofs,
                },
                other => return Err(WireError::UnknownChunkKind(other)),
            };
            chunks.push(FiniteChunk {
                this_ver_ofs,
                len,
                source,
            });
        }

        Ok(Self { header, chunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> LayoutTable {
        LayoutTable::new(
            b"encrypted-header".to_vec(),
            vec![
                FiniteChunk {
                    this_ver_ofs: 0,
                    len: 100,
                    source: ChunkSource::Present { disk_ofs: 200 },
                },
                FiniteChunk {
                    this_ver_ofs: 100,
                    len: 50,
                    source: ChunkSource::Base { base_ofs: 300 },
                },
            ],
        )
    }

    #[test]
    fn round_trip() {
        let table = sample_table();
        let mut buf = Vec::new();
        table.encode(&mut buf).unwrap();
        let decoded = LayoutTable::decode(&buf[..]).unwrap();
        assert_eq!(decoded.header, table.header);
        assert_eq!(decoded.chunks, table.chunks);
    }

    #[test]
    fn total_len_is_last_chunk_end() {
        let table = sample_table();
        assert_eq!(table.total_len(), 150);
    }

    #[test]
    fn empty_chunks_have_zero_total_len() {
        let table = LayoutTable::new(vec![], vec![]);
        assert_eq!(table.total_len(), 0);
    }

    #[test]
    fn encoded_len_matches_actual_bytes_written() {
        let table = sample_table();
        let mut buf = Vec::new();
        table.encode(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, table.encoded_len());
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0u8; 16];
        assert!(matches!(
            LayoutTable::decode(&bytes[..]),
            Err(WireError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        let table = sample_table();
        let mut buf = Vec::new();
        table.encode(&mut buf).unwrap();
        buf.truncate(buf.len() - 4);
        assert!(LayoutTable::decode(&buf[..]).is_err());
    }
}
