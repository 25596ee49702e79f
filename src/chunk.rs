//! Fixed-capacity container of compressed measurements.
//!
//! A chunk is a codec buffer plus a header carrying the statistics the
//! query planner prefilters on. Once sealed the chunk is immutable, its
//! CRC is valid, and any number of readers may scan it concurrently;
//! the single writer is guarded by the owning tier's lock.

use crate::bloom;
use crate::codec::{ChunkReader, ChunkWriter};
use crate::error::StoreError;
use crate::types::{Flag, Id, Meas, Time, MEAS_SIZE};

/// Packed little-endian size of [`ChunkHeader`] on disk.
pub const CHUNK_HEADER_SIZE: usize = 8 + MEAS_SIZE * 2 + 8 * 6 + 4 + 4 + 1 + 1 + 1 + 4;

/// Chunk statistics, persisted verbatim as the chunk's index record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkHeader {
    pub chunk_id: u64,
    pub first: Meas,
    pub last: Meas,
    pub min_time: Time,
    pub max_time: Time,
    pub min_id: Id,
    pub max_id: Id,
    pub id_bloom: u64,
    pub flag_bloom: u64,
    pub count: u32,
    pub cursor_byte: u32,
    pub cursor_bit: u8,
    pub is_readonly: bool,
    pub is_init: bool,
    pub crc: u32,
}

impl ChunkHeader {
    fn empty(chunk_id: u64) -> Self {
        let zero = Meas::new(0, 0, 0.0, 0);
        ChunkHeader {
            chunk_id,
            first: zero,
            last: zero,
            min_time: Time::MAX,
            max_time: 0,
            min_id: Id::MAX,
            max_id: 0,
            id_bloom: bloom::empty(),
            flag_bloom: bloom::empty(),
            count: 0,
            cursor_byte: 0,
            cursor_bit: 0,
            is_readonly: false,
            is_init: false,
            crc: 0,
        }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.chunk_id.to_le_bytes());
        self.first.write_to(buf);
        self.last.write_to(buf);
        buf.extend_from_slice(&self.min_time.to_le_bytes());
        buf.extend_from_slice(&self.max_time.to_le_bytes());
        buf.extend_from_slice(&self.min_id.to_le_bytes());
        buf.extend_from_slice(&self.max_id.to_le_bytes());
        buf.extend_from_slice(&self.id_bloom.to_le_bytes());
        buf.extend_from_slice(&self.flag_bloom.to_le_bytes());
        buf.extend_from_slice(&self.count.to_le_bytes());
        buf.extend_from_slice(&self.cursor_byte.to_le_bytes());
        buf.push(self.cursor_bit);
        buf.push(u8::from(self.is_readonly));
        buf.push(u8::from(self.is_init));
        buf.extend_from_slice(&self.crc.to_le_bytes());
    }

    pub fn read_from(b: &[u8]) -> Result<Self, StoreError> {
        if b.len() < CHUNK_HEADER_SIZE {
            return Err(StoreError::corruption("Truncated chunk header"));
        }
        let u64_at = |off: usize| u64::from_le_bytes(b[off..off + 8].try_into().expect("u64 field"));
        let u32_at = |off: usize| u32::from_le_bytes(b[off..off + 4].try_into().expect("u32 field"));
        let mut off = 0;
        let chunk_id = u64_at(off);
        off += 8;
        let first = Meas::read_from(&b[off..off + MEAS_SIZE]);
        off += MEAS_SIZE;
        let last = Meas::read_from(&b[off..off + MEAS_SIZE]);
        off += MEAS_SIZE;
        let min_time = u64_at(off);
        let max_time = u64_at(off + 8);
        let min_id = u64_at(off + 16);
        let max_id = u64_at(off + 24);
        let id_bloom = u64_at(off + 32);
        let flag_bloom = u64_at(off + 40);
        off += 48;
        let count = u32_at(off);
        let cursor_byte = u32_at(off + 4);
        off += 8;
        let cursor_bit = b[off];
        let is_readonly = b[off + 1] != 0;
        let is_init = b[off + 2] != 0;
        off += 3;
        let crc = u32_at(off);
        Ok(ChunkHeader {
            chunk_id,
            first,
            last,
            min_time,
            max_time,
            min_id,
            max_id,
            id_bloom,
            flag_bloom,
            count,
            cursor_byte,
            cursor_bit,
            is_readonly,
            is_init,
            crc,
        })
    }

    /// Bloom probe followed by the exact id range.
    pub fn check_id(&self, id: Id) -> bool {
        bloom::check(self.id_bloom, &id) && self.min_id <= id && id <= self.max_id
    }

    pub fn check_id_any(&self, ids: &[Id]) -> bool {
        ids.is_empty() || ids.iter().any(|id| self.check_id(*id))
    }

    /// Flag 0 matches all.
    pub fn check_flag(&self, flag: Flag) -> bool {
        flag == 0 || bloom::check(self.flag_bloom, &flag)
    }

    pub fn overlaps(&self, from: Time, to: Time) -> bool {
        self.min_time <= to && self.max_time >= from
    }
}

/// One chunk: header plus either an open codec writer or a sealed buffer.
#[derive(Debug)]
pub struct Chunk {
    pub header: ChunkHeader,
    writer: Option<ChunkWriter>,
    buffer: Vec<u8>,
    buffer_capacity: usize,
}

impl Chunk {
    /// Creates an open chunk whose buffer holds `buffer_capacity` bytes.
    pub fn new(chunk_id: u64, buffer_capacity: usize) -> Self {
        Chunk {
            header: ChunkHeader::empty(chunk_id),
            writer: Some(ChunkWriter::new(buffer_capacity)),
            buffer: Vec::new(),
            buffer_capacity,
        }
    }

    /// Rebuilds a sealed chunk from its on-disk header and buffer copy,
    /// verifying the checksum.
    pub fn from_parts(header: ChunkHeader, buffer: Vec<u8>) -> Result<Self, StoreError> {
        let chunk = Chunk {
            buffer_capacity: buffer.len(),
            header,
            writer: None,
            buffer,
        };
        if !chunk.check_checksum() {
            return Err(StoreError::Checksum(format!(
                "chunk {} buffer does not match stored CRC",
                chunk.header.chunk_id
            )));
        }
        Ok(chunk)
    }

    /// Appends one measurement. `Err(Full)` means the chunk sealed
    /// itself; the caller rolls a new chunk and must not retry here.
    pub fn append(&mut self, m: &Meas) -> Result<(), StoreError> {
        if self.header.is_readonly {
            return Err(StoreError::Full);
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| StoreError::Internal("append on a loaded chunk".to_string()))?;
        if !writer.append(m) {
            self.seal();
            return Err(StoreError::Full);
        }
        let h = &mut self.header;
        if !h.is_init {
            h.first = *m;
            h.is_init = true;
        }
        h.last = *m;
        h.min_time = h.min_time.min(m.time);
        h.max_time = h.max_time.max(m.time);
        h.min_id = h.min_id.min(m.id);
        h.max_id = h.max_id.max(m.id);
        h.id_bloom = bloom::add(h.id_bloom, &m.id);
        h.flag_bloom = bloom::add(h.flag_bloom, &m.flag);
        h.count = writer.count();
        Ok(())
    }

    /// Freezes the chunk: buffer and statistics become immutable and the
    /// CRC becomes valid.
    pub fn seal(&mut self) {
        if self.header.is_readonly {
            return;
        }
        if let Some(writer) = self.writer.take() {
            let (byte, bit) = writer.position();
            self.header.cursor_byte = byte;
            self.header.cursor_bit = bit;
            self.buffer = writer.into_bytes();
        }
        self.header.is_readonly = true;
        self.header.crc = crc32(&self.buffer);
    }

    pub fn is_sealed(&self) -> bool {
        self.header.is_readonly
    }

    pub fn is_empty(&self) -> bool {
        self.header.count == 0
    }

    /// Sealed buffer bytes. Empty until [`Chunk::seal`].
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn check_checksum(&self) -> bool {
        self.header.is_readonly && crc32(&self.buffer) == self.header.crc
    }

    /// Scans the sealed chunk. Consumers may stop early by dropping the
    /// iterator.
    pub fn reader(&self) -> Result<ChunkReader<'_>, StoreError> {
        if !self.header.is_readonly {
            return Err(StoreError::Internal("scan of an unsealed chunk".to_string()));
        }
        Ok(ChunkReader::new(self.header.first, self.header.count, &self.buffer))
    }
}

#[inline]
fn crc32(bytes: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(bytes);
    h.finalize()
}
