//! Append-only log of raw fixed-size measurement records.
//!
//! One WAL file absorbs writes at append speed; once it reaches the
//! configured record cap it is sealed and queued for compaction into a
//! page. The 40-byte header carries skip statistics (id Bloom, time
//! bounds) that are backpatched when the file seals.

use crate::bloom;
use crate::error::StoreError;
use crate::types::{Id, Meas, QueryInterval, QueryTimePoint, Time, MEAS_SIZE};

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const WAL_EXT: &str = "wal";

const WAL_MAGIC: &[u8; 8] = b"STRAWAL1";
const WAL_HEADER_SIZE: u64 = 8 + 1 + 3 + 4 + 8 + 8 + 8;

/// One write-ahead log file plus its in-process append buffer.
#[derive(Debug)]
pub struct WalFile {
    path: PathBuf,
    file: Option<File>,
    pending: Vec<Meas>,
    buffer_limit: usize,
    max_records: usize,
    disk_count: u32,
    count: u32,
    id_bloom: u64,
    min_time: Time,
    max_time: Time,
    sealed: bool,
}

impl WalFile {
    /// Creates a fresh, writable WAL file and writes its header.
    pub fn create(path: &Path, max_records: usize, buffer_limit: usize) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        let mut wal = WalFile {
            path: path.to_path_buf(),
            file: None,
            pending: Vec::with_capacity(buffer_limit),
            buffer_limit,
            max_records,
            disk_count: 0,
            count: 0,
            id_bloom: bloom::empty(),
            min_time: Time::MAX,
            max_time: 0,
            sealed: false,
        };
        wal.write_header(&mut file)?;
        file.sync_data()?;
        wal.file = Some(file);
        Ok(wal)
    }

    /// Opens an existing WAL file.
    ///
    /// A trailing partial record (the writer crashed mid-append) is
    /// truncated away before anything is served. Unsealed files get
    /// their skip statistics rebuilt by a scan, since their header was
    /// never backpatched.
    pub fn open(path: &Path, writable: bool) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; WAL_HEADER_SIZE as usize];
        file.read_exact(&mut header).map_err(|_| {
            StoreError::corruption(format!("Truncated WAL header in {:?}", path))
        })?;
        if &header[0..8] != WAL_MAGIC {
            return Err(StoreError::corruption(format!("Bad WAL magic in {:?}", path)));
        }
        let sealed = header[8] != 0;
        let count = u32::from_le_bytes(header[12..16].try_into().expect("count"));
        let id_bloom = u64::from_le_bytes(header[16..24].try_into().expect("bloom"));
        let min_time = u64::from_le_bytes(header[24..32].try_into().expect("min"));
        let max_time = u64::from_le_bytes(header[32..40].try_into().expect("max"));

        let len = file.metadata()?.len();
        let body = len.saturating_sub(WAL_HEADER_SIZE);
        let whole = body / MEAS_SIZE as u64;
        if body % MEAS_SIZE as u64 != 0 {
            // Crash mid-record: drop the fragment.
            file.set_len(WAL_HEADER_SIZE + whole * MEAS_SIZE as u64)?;
            file.sync_data()?;
        }
        let disk_count = whole as u32;

        let mut wal = WalFile {
            path: path.to_path_buf(),
            file: None,
            pending: Vec::new(),
            buffer_limit: 1,
            max_records: disk_count as usize,
            disk_count,
            count: disk_count,
            id_bloom,
            min_time,
            max_time,
            sealed,
        };

        if !sealed || count != disk_count {
            wal.rebuild_stats()?;
        }
        if writable {
            file.seek(SeekFrom::End(0))?;
            wal.file = Some(file);
        }
        Ok(wal)
    }

    /// Reopens an unsealed file for continued appends after a restart.
    pub fn open_for_append(
        path: &Path,
        max_records: usize,
        buffer_limit: usize,
    ) -> Result<Self, StoreError> {
        let mut wal = Self::open(path, true)?;
        wal.max_records = max_records;
        wal.buffer_limit = buffer_limit;
        wal.pending = Vec::with_capacity(buffer_limit);
        Ok(wal)
    }

    fn rebuild_stats(&mut self) -> Result<(), StoreError> {
        self.id_bloom = bloom::empty();
        self.min_time = Time::MAX;
        self.max_time = 0;
        let records = self.read_disk_records()?;
        for m in &records {
            self.id_bloom = bloom::add(self.id_bloom, &m.id);
            self.min_time = self.min_time.min(m.time);
            self.max_time = self.max_time.max(m.time);
        }
        Ok(())
    }

    fn write_header(&self, file: &mut File) -> Result<(), StoreError> {
        let mut buf = Vec::with_capacity(WAL_HEADER_SIZE as usize);
        buf.extend_from_slice(WAL_MAGIC);
        buf.push(u8::from(self.sealed));
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&self.count.to_le_bytes());
        buf.extend_from_slice(&self.id_bloom.to_le_bytes());
        buf.extend_from_slice(&self.min_time.to_le_bytes());
        buf.extend_from_slice(&self.max_time.to_le_bytes());
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name without directory, as recorded in the manifest.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_full(&self) -> bool {
        self.count as usize >= self.max_records
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Appends one measurement. Returns `false` when the record cap is
    /// reached; the caller seals this file and rolls a new one.
    pub fn append(&mut self, m: &Meas) -> Result<bool, StoreError> {
        if self.sealed || self.is_full() {
            return Ok(false);
        }
        self.pending.push(*m);
        self.count += 1;
        self.id_bloom = bloom::add(self.id_bloom, &m.id);
        self.min_time = self.min_time.min(m.time);
        self.max_time = self.max_time.max(m.time);
        if self.pending.len() >= self.buffer_limit {
            self.flush()?;
        }
        Ok(true)
    }

    /// Appends a batch, returning how many records were taken before the
    /// cap. A partial count tells the caller to roll a new file for the
    /// remainder.
    pub fn append_batch(&mut self, batch: &[Meas]) -> Result<usize, StoreError> {
        let mut written = 0;
        for m in batch {
            if !self.append(m)? {
                break;
            }
            written += 1;
        }
        Ok(written)
    }

    /// Writes buffered records through to disk.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::Internal("flush on a read-only WAL".to_string()))?;
        let mut buf = Vec::with_capacity(self.pending.len() * MEAS_SIZE);
        for m in &self.pending {
            m.write_to(&mut buf);
        }
        file.write_all(&buf)?;
        file.sync_data()?;
        self.disk_count += self.pending.len() as u32;
        self.pending.clear();
        Ok(())
    }

    /// Flushes, backpatches the header statistics, and marks the file
    /// sealed. A sealed file only waits for compaction.
    pub fn seal(&mut self) -> Result<(), StoreError> {
        self.flush()?;
        self.sealed = true;
        let mut file = self
            .file
            .take()
            .ok_or_else(|| StoreError::Internal("seal on a read-only WAL".to_string()))?;
        self.write_header(&mut file)?;
        file.sync_data()?;
        Ok(())
    }

    fn read_disk_records(&self) -> Result<Vec<Meas>, StoreError> {
        let mut f = File::open(&self.path)?;
        f.seek(SeekFrom::Start(WAL_HEADER_SIZE))?;
        let mut bytes = Vec::new();
        f.read_to_end(&mut bytes)?;
        let whole = bytes.len() / MEAS_SIZE;
        let mut out = Vec::with_capacity(whole + self.pending.len());
        for i in 0..whole {
            out.push(Meas::read_from(&bytes[i * MEAS_SIZE..(i + 1) * MEAS_SIZE]));
        }
        Ok(out)
    }

    /// Every record in the file, in append order, including any still in
    /// the in-process buffer.
    pub fn read_all(&self) -> Result<Vec<Meas>, StoreError> {
        let mut out = self.read_disk_records()?;
        out.extend_from_slice(&self.pending);
        Ok(out)
    }

    /// Header-level prefilter: can this file contain any queried id in
    /// the given window?
    pub fn may_contain(&self, ids: &[Id], from: Time, to: Time) -> bool {
        if self.count == 0 {
            return false;
        }
        if self.min_time > to || self.max_time < from {
            return false;
        }
        ids.is_empty() || ids.iter().any(|id| bloom::check(self.id_bloom, id))
    }

    pub fn min_time(&self) -> Option<Time> {
        (self.count > 0).then_some(self.min_time)
    }

    pub fn max_time(&self) -> Option<Time> {
        (self.count > 0).then_some(self.max_time)
    }

    pub fn min_max_time(&self, id: Id) -> Result<Option<(Time, Time)>, StoreError> {
        if !bloom::check(self.id_bloom, &id) {
            return Ok(None);
        }
        let mut min = Time::MAX;
        let mut max = 0;
        let mut seen = false;
        for m in self.read_all()? {
            if m.id == id {
                seen = true;
                min = min.min(m.time);
                max = max.max(m.time);
            }
        }
        Ok(seen.then_some((min, max)))
    }

    /// Linear scan for a range query; matches are pushed to `out`.
    pub fn read_interval(&self, q: &QueryInterval, out: &mut Vec<Meas>) -> Result<(), StoreError> {
        if !self.may_contain(&q.ids, q.from, q.to) {
            return Ok(());
        }
        for m in self.read_all()? {
            if m.time >= q.from
                && m.time <= q.to
                && m.matches_flag(q.flag)
                && (q.ids.is_empty() || q.ids.contains(&m.id))
            {
                out.push(m);
            }
        }
        Ok(())
    }

    /// Latest record per queried id with `time <= time_point`.
    pub fn read_time_point(
        &self,
        q: &QueryTimePoint,
        out: &mut crate::types::Id2Meas,
    ) -> Result<(), StoreError> {
        if !self.may_contain(&q.ids, 0, q.time_point) {
            return Ok(());
        }
        for m in self.read_all()? {
            if m.time > q.time_point || !m.matches_flag(q.flag) {
                continue;
            }
            if !q.ids.is_empty() && !q.ids.contains(&m.id) {
                continue;
            }
            match out.get(&m.id) {
                Some(prev) if prev.time >= m.time => {}
                _ => {
                    out.insert(m.id, m);
                }
            }
        }
        Ok(())
    }

    /// Latest record per queried id regardless of window.
    pub fn current_value(
        &self,
        ids: &[Id],
        flag: crate::types::Flag,
        out: &mut crate::types::Id2Meas,
    ) -> Result<(), StoreError> {
        if self.count == 0 || !(ids.is_empty() || ids.iter().any(|id| bloom::check(self.id_bloom, id)))
        {
            return Ok(());
        }
        for m in self.read_all()? {
            if !m.matches_flag(flag) {
                continue;
            }
            if !ids.is_empty() && !ids.contains(&m.id) {
                continue;
            }
            match out.get(&m.id) {
                Some(prev) if prev.time >= m.time => {}
                _ => {
                    out.insert(m.id, m);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meas(id: Id, time: Time, value: f64) -> Meas {
        Meas::new(id, time, value, 0)
    }

    #[test]
    fn append_flush_read_all() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.wal");
        let mut wal = WalFile::create(&path, 100, 8).unwrap();
        for i in 0..20u64 {
            assert!(wal.append(&meas(1, 100 + i, i as f64)).unwrap());
        }
        let all = wal.read_all().unwrap();
        assert_eq!(all.len(), 20);
        assert_eq!(all[0].time, 100);
        assert_eq!(all[19].time, 119);
    }

    #[test]
    fn cap_forces_partial_batch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.wal");
        let mut wal = WalFile::create(&path, 10, 4).unwrap();
        let batch: Vec<Meas> = (0..25u64).map(|i| meas(2, i, 0.0)).collect();
        let written = wal.append_batch(&batch).unwrap();
        assert_eq!(written, 10);
        assert!(wal.is_full());
        assert!(!wal.append(&meas(2, 99, 0.0)).unwrap());
    }

    #[test]
    fn sealed_file_reopens_with_header_stats() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.wal");
        {
            let mut wal = WalFile::create(&path, 50, 4).unwrap();
            for i in 0..50u64 {
                wal.append(&meas(7, 1_000 + i, i as f64)).unwrap();
            }
            wal.seal().unwrap();
        }
        let wal = WalFile::open(&path, false).unwrap();
        assert!(wal.is_sealed());
        assert_eq!(wal.count(), 50);
        assert_eq!(wal.min_time(), Some(1_000));
        assert_eq!(wal.max_time(), Some(1_049));
        assert!(wal.may_contain(&[7], 0, u64::MAX));
    }

    #[test]
    fn partial_trailing_record_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.wal");
        {
            let mut wal = WalFile::create(&path, 100, 1).unwrap();
            for i in 0..5u64 {
                wal.append(&meas(1, i, 0.0)).unwrap();
            }
        }
        // Simulate a crash mid-record: append half a record of garbage.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xAB; MEAS_SIZE / 2]).unwrap();
        }
        let wal = WalFile::open(&path, false).unwrap();
        assert_eq!(wal.count(), 5);
        assert_eq!(wal.read_all().unwrap().len(), 5);
        // The file itself must have been repaired, not just skipped.
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, WAL_HEADER_SIZE + 5 * MEAS_SIZE as u64);
    }

    #[test]
    fn interval_scan_filters_by_id_flag_and_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.wal");
        let mut wal = WalFile::create(&path, 100, 100).unwrap();
        for i in 0..30u64 {
            wal.append(&Meas::new(i % 3, i * 10, i as f64, if i % 2 == 0 { 5 } else { 0 }))
                .unwrap();
        }
        let q = QueryInterval::new(vec![0], 5, 0, 300);
        let mut out = Vec::new();
        wal.read_interval(&q, &mut out).unwrap();
        assert!(!out.is_empty());
        assert!(out.iter().all(|m| m.id == 0 && m.flag == 5));
    }

    #[test]
    fn bloom_skips_files_without_the_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.wal");
        let mut wal = WalFile::create(&path, 10, 10).unwrap();
        wal.append(&meas(1, 5, 1.0)).unwrap();
        // Id 1 must always hit; an absent id usually misses.
        assert!(wal.may_contain(&[1], 0, 100));
        assert!(!wal.may_contain(&[1], 50, 100), "time window must also filter");
    }

    #[test]
    fn current_value_keeps_latest_per_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.wal");
        let mut wal = WalFile::create(&path, 100, 100).unwrap();
        wal.append(&meas(1, 10, 1.0)).unwrap();
        wal.append(&meas(1, 30, 3.0)).unwrap();
        wal.append(&meas(1, 20, 2.0)).unwrap();
        let mut out = crate::types::Id2Meas::new();
        wal.current_value(&[1], 0, &mut out).unwrap();
        assert_eq!(out[&1].time, 30);
        assert_eq!(out[&1].value, 3.0);
    }
}
