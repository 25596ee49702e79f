//! Bit-level measurement codec used inside chunks.
//!
//! Four interleaved streams per measurement: delta-of-delta timestamps,
//! XOR'd value bits with leading/trailing-zero windows, and run-length
//! flags and ids. The first measurement of a chunk is not encoded; it
//! lives in the chunk header and the reader re-emits it.
//!
//! The bucket widths below are part of the on-disk format and must not
//! change between versions.

use crate::types::{Flag, Id, Meas, Time};

/// Upper bound of one encoded record: 36 bits of time, 77 of value,
/// 33 of flag, 65 of id = 211 bits.
pub const MAX_RECORD_BYTES: usize = 28;

const DOD_7_MIN: i64 = -(1 << 6);
const DOD_7_MAX: i64 = (1 << 6) - 1;
const DOD_9_MIN: i64 = -(1 << 8);
const DOD_9_MAX: i64 = (1 << 8) - 1;
const DOD_12_MIN: i64 = -(1 << 11);
const DOD_12_MAX: i64 = (1 << 11) - 1;
const DOD_32_MIN: i64 = i32::MIN as i64;
const DOD_32_MAX: i64 = i32::MAX as i64;

#[derive(Debug)]
struct BitWriter {
    out: Vec<u8>,
    cur: u8,
    used: u8,
    capacity: usize,
}

impl BitWriter {
    fn with_capacity(capacity: usize) -> Self {
        BitWriter { out: Vec::with_capacity(capacity), cur: 0, used: 0, capacity }
    }

    /// Bytes the stream would occupy if flushed now.
    fn byte_len(&self) -> usize {
        self.out.len() + usize::from(self.used > 0)
    }

    fn free_bytes(&self) -> usize {
        self.capacity.saturating_sub(self.byte_len())
    }

    fn push_bit(&mut self, bit: bool) {
        self.cur |= u8::from(bit) << (7 - self.used);
        self.used += 1;
        if self.used == 8 {
            self.out.push(self.cur);
            self.cur = 0;
            self.used = 0;
        }
    }

    /// Writes `count` bits, MSB-first among the `count` low bits of `v`.
    fn push_bits(&mut self, mut v: u64, count: u8) {
        if count == 0 {
            return;
        }
        if count < 64 {
            v &= (1u64 << count) - 1;
        }
        for i in (0..count).rev() {
            self.push_bit((v >> i) & 1 == 1);
        }
    }

    /// Write cursor as (full bytes, bits used in the trailing byte).
    fn position(&self) -> (u32, u8) {
        (self.out.len() as u32, self.used)
    }

    fn into_bytes(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.out.push(self.cur);
        }
        self.out
    }
}

struct BitReader<'a> {
    buf: &'a [u8],
    byte: usize,
    bit: u8,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        BitReader { buf, byte: 0, bit: 0 }
    }

    fn read_bit(&mut self) -> Option<bool> {
        let b = *self.buf.get(self.byte)?;
        let bit = b & (1u8 << (7 - self.bit)) != 0;
        self.bit += 1;
        if self.bit == 8 {
            self.bit = 0;
            self.byte += 1;
        }
        Some(bit)
    }

    fn read_bits(&mut self, count: u8) -> Option<u64> {
        let mut out = 0u64;
        for _ in 0..count {
            out = (out << 1) | u64::from(self.read_bit()?);
        }
        Some(out)
    }
}

#[inline]
fn sign_extend(v: u64, width: u8) -> i64 {
    let shift = 64 - width as u32;
    ((v << shift) as i64) >> shift
}

/// Streaming compressor for one chunk. The buffer capacity is fixed at
/// construction; [`ChunkWriter::append`] refuses (returns `false`) once
/// the widest possible record no longer fits.
#[derive(Debug)]
pub struct ChunkWriter {
    bits: BitWriter,
    first: Option<Meas>,
    count: u32,
    prev_time: Time,
    prev_delta: i64,
    prev_value: u64,
    prev_leading: u8,
    prev_trailing: u8,
    prev_sigbits: u8,
    prev_flag: Flag,
    prev_id: Id,
}

impl ChunkWriter {
    pub fn new(buffer_capacity: usize) -> Self {
        ChunkWriter {
            bits: BitWriter::with_capacity(buffer_capacity),
            first: None,
            count: 0,
            prev_time: 0,
            prev_delta: 0,
            prev_value: 0,
            prev_leading: 0,
            prev_trailing: 0,
            prev_sigbits: 0,
            prev_flag: 0,
            prev_id: 0,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn first(&self) -> Option<&Meas> {
        self.first.as_ref()
    }

    /// Write cursor (byte offset, bit offset) for the chunk header.
    pub fn position(&self) -> (u32, u8) {
        self.bits.position()
    }

    /// Appends one measurement. Returns `false` without touching the
    /// stream when the record might not fit; the caller must seal the
    /// chunk and roll a new one (no retry on the same chunk).
    pub fn append(&mut self, m: &Meas) -> bool {
        if self.first.is_none() {
            self.first = Some(*m);
            self.count = 1;
            self.prev_time = m.time;
            self.prev_delta = 0;
            self.prev_value = m.value.to_bits();
            self.prev_flag = m.flag;
            self.prev_id = m.id;
            return true;
        }
        if self.bits.free_bytes() < MAX_RECORD_BYTES {
            return false;
        }

        let delta = m.time as i64 - self.prev_time as i64;
        let dod = delta - self.prev_delta;
        if !(DOD_32_MIN..=DOD_32_MAX).contains(&dod) {
            // Out-of-range jump; a fresh chunk stores the time verbatim.
            return false;
        }

        self.write_time(dod);
        self.write_value(m.value.to_bits());
        self.write_flag(m.flag);
        self.write_id(m.id);

        self.prev_time = m.time;
        self.prev_delta = delta;
        self.count += 1;
        true
    }

    fn write_time(&mut self, dod: i64) {
        if dod == 0 {
            self.bits.push_bit(false);
        } else if (DOD_7_MIN..=DOD_7_MAX).contains(&dod) {
            self.bits.push_bits(0b10, 2);
            self.bits.push_bits(dod as u64, 7);
        } else if (DOD_9_MIN..=DOD_9_MAX).contains(&dod) {
            self.bits.push_bits(0b110, 3);
            self.bits.push_bits(dod as u64, 9);
        } else if (DOD_12_MIN..=DOD_12_MAX).contains(&dod) {
            self.bits.push_bits(0b1110, 4);
            self.bits.push_bits(dod as u64, 12);
        } else {
            self.bits.push_bits(0b1111, 4);
            self.bits.push_bits(dod as u64, 32);
        }
    }

    fn write_value(&mut self, bits: u64) {
        let xor = self.prev_value ^ bits;
        self.prev_value = bits;
        if xor == 0 {
            self.bits.push_bit(false);
            return;
        }
        self.bits.push_bit(true);

        // 5-bit field caps the leading count at 31; a smaller stored
        // leading only widens the window, never loses bits.
        let leading = (xor.leading_zeros() as u8).min(31);
        let trailing = xor.trailing_zeros() as u8;
        let sigbits = 64 - leading - trailing;

        if self.prev_sigbits != 0 && leading >= self.prev_leading && trailing >= self.prev_trailing
        {
            self.bits.push_bit(false);
            self.bits.push_bits(xor >> self.prev_trailing, self.prev_sigbits);
        } else {
            self.bits.push_bit(true);
            self.bits.push_bits(leading as u64, 5);
            self.bits.push_bits((sigbits - 1) as u64, 6);
            self.bits.push_bits(xor >> trailing, sigbits);
            self.prev_leading = leading;
            self.prev_trailing = trailing;
            self.prev_sigbits = sigbits;
        }
    }

    fn write_flag(&mut self, flag: Flag) {
        if flag == self.prev_flag {
            self.bits.push_bit(false);
        } else {
            self.bits.push_bit(true);
            self.bits.push_bits(flag as u64, 32);
            self.prev_flag = flag;
        }
    }

    fn write_id(&mut self, id: Id) {
        if id == self.prev_id {
            self.bits.push_bit(false);
        } else {
            self.bits.push_bit(true);
            self.bits.push_bits(id, 64);
            self.prev_id = id;
        }
    }

    /// Finishes the stream and returns the packed bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bits.into_bytes()
    }
}

/// Forward-only decoder over a sealed chunk buffer. Yields exactly
/// `count` measurements, the first being the stored `first`. Creating a
/// new reader over the same buffer restarts the scan.
pub struct ChunkReader<'a> {
    bits: BitReader<'a>,
    first: Meas,
    remaining: u32,
    started: bool,
    prev_time: Time,
    prev_delta: i64,
    prev_value: u64,
    prev_leading: u8,
    prev_trailing: u8,
    prev_sigbits: u8,
    prev_flag: Flag,
    prev_id: Id,
}

impl<'a> ChunkReader<'a> {
    pub fn new(first: Meas, count: u32, buf: &'a [u8]) -> Self {
        ChunkReader {
            bits: BitReader::new(buf),
            first,
            remaining: count,
            started: false,
            prev_time: first.time,
            prev_delta: 0,
            prev_value: first.value.to_bits(),
            prev_leading: 0,
            prev_trailing: 0,
            prev_sigbits: 0,
            prev_flag: first.flag,
            prev_id: first.id,
        }
    }

    fn read_time(&mut self) -> Option<Time> {
        let dod = if !self.bits.read_bit()? {
            0
        } else if !self.bits.read_bit()? {
            sign_extend(self.bits.read_bits(7)?, 7)
        } else if !self.bits.read_bit()? {
            sign_extend(self.bits.read_bits(9)?, 9)
        } else if !self.bits.read_bit()? {
            sign_extend(self.bits.read_bits(12)?, 12)
        } else {
            sign_extend(self.bits.read_bits(32)?, 32)
        };
        self.prev_delta += dod;
        let t = (self.prev_time as i64).checked_add(self.prev_delta)?;
        self.prev_time = t as Time;
        Some(self.prev_time)
    }

    fn read_value(&mut self) -> Option<u64> {
        if !self.bits.read_bit()? {
            return Some(self.prev_value);
        }
        let (sigbits, trailing) = if !self.bits.read_bit()? {
            if self.prev_sigbits == 0 {
                return None;
            }
            (self.prev_sigbits, self.prev_trailing)
        } else {
            let leading = self.bits.read_bits(5)? as u8;
            let sigbits = self.bits.read_bits(6)? as u8 + 1;
            if leading + sigbits > 64 {
                return None;
            }
            let trailing = 64 - leading - sigbits;
            self.prev_leading = leading;
            self.prev_trailing = trailing;
            self.prev_sigbits = sigbits;
            (sigbits, trailing)
        };
        let significant = self.bits.read_bits(sigbits)?;
        self.prev_value ^= significant << trailing;
        Some(self.prev_value)
    }

    fn read_flag(&mut self) -> Option<Flag> {
        if self.bits.read_bit()? {
            self.prev_flag = self.bits.read_bits(32)? as Flag;
        }
        Some(self.prev_flag)
    }

    fn read_id(&mut self) -> Option<Id> {
        if self.bits.read_bit()? {
            self.prev_id = self.bits.read_bits(64)?;
        }
        Some(self.prev_id)
    }
}

impl<'a> Iterator for ChunkReader<'a> {
    type Item = Meas;

    fn next(&mut self) -> Option<Meas> {
        if self.remaining == 0 {
            return None;
        }
        if !self.started {
            self.started = true;
            self.remaining -= 1;
            return Some(self.first);
        }
        let time = self.read_time()?;
        let value = f64::from_bits(self.read_value()?);
        let flag = self.read_flag()?;
        let id = self.read_id()?;
        self.remaining -= 1;
        Some(Meas { id, time, value, flag })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(input: &[Meas]) -> Vec<Meas> {
        let mut w = ChunkWriter::new(64 * 1024);
        for m in input {
            assert!(w.append(m), "buffer unexpectedly full");
        }
        let first = *w.first().expect("non-empty input");
        let count = w.count();
        let buf = w.into_bytes();
        ChunkReader::new(first, count, &buf).collect()
    }

    #[test]
    fn encode_decode_is_bit_exact() {
        let mut input = Vec::new();
        let mut t = 1_000u64;
        for i in 0..512u64 {
            // Irregular cadence exercises every delta-of-delta bucket.
            t += match i % 5 {
                0 => 10,
                1 => 10,
                2 => 250,
                3 => 3_000,
                _ => 100_000,
            };
            input.push(Meas::new(7, t, (i as f64) * 0.1 - 3.0, (i % 3) as u32));
        }
        assert_eq!(round_trip(&input), input);
    }

    #[test]
    fn constant_values_emit_single_zero_bits() {
        let input = vec![
            Meas::new(1, 100, 1.0, 0),
            Meas::new(1, 150, 1.0, 0),
            Meas::new(1, 200, 1.0, 0),
        ];
        let mut w = ChunkWriter::new(4096);
        for m in &input {
            assert!(w.append(m));
        }
        let first = *w.first().unwrap();
        let count = w.count();
        let buf = w.into_bytes();
        // Two encoded records, each: dod bucket + one zero value bit +
        // zero flag bit + zero id bit. Record 2 has dod=50 (2+7 bits),
        // record 3 has dod=0 (1 bit): 12 + 4 = 16 bits = 2 bytes.
        assert_eq!(buf.len(), 2);
        assert_eq!(ChunkReader::new(first, count, &buf).collect::<Vec<_>>(), input);
    }

    #[test]
    fn mixed_ids_and_flags_round_trip() {
        let mut input = Vec::new();
        for i in 0..100u64 {
            input.push(Meas::new(
                i % 4,
                10_000 + i * 500,
                f64::from_bits(0x4010_0000_0000_0000u64 ^ (i << 13)),
                if i % 7 == 0 { 0xff } else { 0 },
            ));
        }
        assert_eq!(round_trip(&input), input);
    }

    #[test]
    fn backwards_time_round_trips() {
        // Unordered arrivals produce negative deltas; the codec must not care.
        let input = vec![
            Meas::new(1, 5_000, 1.0, 0),
            Meas::new(1, 4_000, 2.0, 0),
            Meas::new(1, 9_000, 3.0, 0),
            Meas::new(1, 1_000, 4.0, 0),
        ];
        assert_eq!(round_trip(&input), input);
    }

    #[test]
    fn writer_refuses_when_full_and_stream_stays_valid() {
        let mut w = ChunkWriter::new(128);
        let mut appended = Vec::new();
        let mut t = 0u64;
        loop {
            t += 1_234;
            let m = Meas::new(3, t, t as f64 * 0.5, 0);
            if !w.append(&m) {
                break;
            }
            appended.push(m);
        }
        assert!(appended.len() > 4, "capacity check too conservative");
        let first = *w.first().unwrap();
        let count = w.count();
        assert_eq!(count as usize, appended.len());
        let buf = w.into_bytes();
        assert!(buf.len() <= 128);
        assert_eq!(ChunkReader::new(first, count, &buf).collect::<Vec<_>>(), appended);
    }

    #[test]
    fn reader_restarts_from_scratch() {
        let input = vec![
            Meas::new(2, 10, 0.5, 0),
            Meas::new(2, 20, 0.75, 0),
            Meas::new(2, 30, 0.25, 0),
        ];
        let mut w = ChunkWriter::new(4096);
        for m in &input {
            assert!(w.append(m));
        }
        let first = *w.first().unwrap();
        let count = w.count();
        let buf = w.into_bytes();
        for _ in 0..3 {
            assert_eq!(ChunkReader::new(first, count, &buf).collect::<Vec<_>>(), input);
        }
    }

    #[test]
    fn nan_and_infinity_bits_survive() {
        let input = vec![
            Meas::new(1, 1, f64::NAN, 0),
            Meas::new(1, 2, f64::INFINITY, 0),
            Meas::new(1, 3, f64::NEG_INFINITY, 0),
            Meas::new(1, 4, -0.0, 0),
        ];
        let out = round_trip(&input);
        for (a, b) in input.iter().zip(out.iter()) {
            assert_eq!(a.value.to_bits(), b.value.to_bits());
        }
    }
}
