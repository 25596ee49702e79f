//! Immutable memory-mapped page files and their sidecar indexes.
//!
//! A page holds many sealed chunks: `<name>.page` is the page header
//! followed by `(chunk index record, chunk buffer)` pairs, and
//! `<name>.pagei` is the index header plus the array of chunk index
//! records. Pages are written once by the compactor, installed with a
//! temp-file rename, and from then on only mapped read-only. Readers
//! copy chunk headers and buffers out of the mapping, so a chunk handed
//! to a consumer never dangles even if the page is closed afterwards.

use crate::bloom;
use crate::chunk::{Chunk, ChunkHeader, CHUNK_HEADER_SIZE};
use crate::error::StoreError;
use crate::types::{Id, Id2Meas, Meas, QueryInterval, QueryTimePoint, Time};

use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const PAGE_EXT: &str = "page";
pub const PAGE_INDEX_EXT: &str = "pagei";

const PAGE_MAGIC: &[u8; 8] = b"STRAPAG1";
const INDEX_MAGIC: &[u8; 8] = b"STRAPGI1";

const PAGE_HEADER_SIZE: u64 = 8 + 4 + 4 + 4 + 8 + 1 + 8 + 8 + 8;
const INDEX_HEADER_SIZE: usize = 8 + 8 + 8 + 8 + 4 + 4 + 4 + 1;
const INDEX_REC_SIZE: usize = 8 + CHUNK_HEADER_SIZE;

pub fn page_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{}.{}", stem, PAGE_EXT))
}

pub fn index_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{}.{}", stem, PAGE_INDEX_EXT))
}

/// Removes a page and its index from disk.
pub fn erase(dir: &Path, stem: &str) -> Result<(), StoreError> {
    for p in [page_path(dir, stem), index_path(dir, stem)] {
        if p.exists() {
            fs::remove_file(&p)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct PageHeader {
    chunk_capacity: u32,
    chunk_size: u32,
    added_chunks: u32,
    write_offset: u64,
    is_full: bool,
    max_chunk_id: u64,
    min_time: Time,
    max_time: Time,
}

impl PageHeader {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(PAGE_MAGIC);
        buf.extend_from_slice(&self.chunk_capacity.to_le_bytes());
        buf.extend_from_slice(&self.chunk_size.to_le_bytes());
        buf.extend_from_slice(&self.added_chunks.to_le_bytes());
        buf.extend_from_slice(&self.write_offset.to_le_bytes());
        buf.push(u8::from(self.is_full));
        buf.extend_from_slice(&self.max_chunk_id.to_le_bytes());
        buf.extend_from_slice(&self.min_time.to_le_bytes());
        buf.extend_from_slice(&self.max_time.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexHeader {
    min_time: Time,
    max_time: Time,
    id_bloom: u64,
    chunk_count: u32,
    chunk_capacity: u32,
    chunk_size: u32,
    is_sorted: bool,
}

impl IndexHeader {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(INDEX_MAGIC);
        buf.extend_from_slice(&self.min_time.to_le_bytes());
        buf.extend_from_slice(&self.max_time.to_le_bytes());
        buf.extend_from_slice(&self.id_bloom.to_le_bytes());
        buf.extend_from_slice(&self.chunk_count.to_le_bytes());
        buf.extend_from_slice(&self.chunk_capacity.to_le_bytes());
        buf.extend_from_slice(&self.chunk_size.to_le_bytes());
        buf.push(u8::from(self.is_sorted));
    }

    fn read_from(b: &[u8], path: &Path) -> Result<Self, StoreError> {
        if b.len() < INDEX_HEADER_SIZE {
            return Err(StoreError::corruption(format!("Truncated page index {:?}", path)));
        }
        if &b[0..8] != INDEX_MAGIC {
            return Err(StoreError::corruption(format!("Bad page index magic in {:?}", path)));
        }
        let u64_at = |off: usize| u64::from_le_bytes(b[off..off + 8].try_into().expect("u64 field"));
        let u32_at = |off: usize| u32::from_le_bytes(b[off..off + 4].try_into().expect("u32 field"));
        Ok(IndexHeader {
            min_time: u64_at(8),
            max_time: u64_at(16),
            id_bloom: u64_at(24),
            chunk_count: u32_at(32),
            chunk_capacity: u32_at(36),
            chunk_size: u32_at(40),
            is_sorted: b[44] != 0,
        })
    }
}

/// Index entry: where the chunk lives in the page body plus a full copy
/// of its header for prefiltering.
#[derive(Debug, Clone, Copy)]
pub struct ChunkIndexRec {
    pub offset: u64,
    pub header: ChunkHeader,
}

/// Handle to one chunk of one open page. Holding a link keeps the page
/// mapped (the cache only evicts pages with no outstanding readers).
#[derive(Debug, Clone)]
pub struct ChunkLink {
    pub page: Arc<PageReader>,
    pub index_pos: usize,
    pub chunk_id: u64,
    pub max_time: Time,
}

/// Exclusive writer used by the compactor to build one page.
#[derive(Debug)]
pub struct PageWriter {
    dir: PathBuf,
    stem: String,
    tmp_page: PathBuf,
    tmp_index: PathBuf,
    file: File,
    chunk_size: u32,
    chunk_capacity: u32,
    next_chunk_id: u64,
    write_offset: u64,
    index: Vec<ChunkIndexRec>,
    min_time: Time,
    max_time: Time,
    id_bloom: u64,
    is_full: bool,
}

impl PageWriter {
    /// Starts a page under temp names; nothing is visible until
    /// [`PageWriter::close`] renames both files into place.
    pub fn create(
        dir: &Path,
        stem: &str,
        chunk_size: u32,
        chunk_capacity: u32,
    ) -> Result<Self, StoreError> {
        let tmp_page = dir.join(format!(".tmp_{}.{}", stem, PAGE_EXT));
        let tmp_index = dir.join(format!(".tmp_{}.{}", stem, PAGE_INDEX_EXT));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_page)?;
        // Reserve the header; it is backpatched on close.
        file.write_all(&vec![0u8; PAGE_HEADER_SIZE as usize])?;
        Ok(PageWriter {
            dir: dir.to_path_buf(),
            stem: stem.to_string(),
            tmp_page,
            tmp_index,
            file,
            chunk_size,
            chunk_capacity,
            next_chunk_id: 1,
            write_offset: PAGE_HEADER_SIZE,
            index: Vec::new(),
            min_time: Time::MAX,
            max_time: 0,
            id_bloom: bloom::empty(),
            is_full: false,
        })
    }

    /// Packs a batch already sorted by `(id, time)` into chunks. Returns
    /// how many measurements were taken; fewer than `batch.len()` means
    /// the page filled and the caller rolls another page.
    pub fn append(&mut self, batch: &[Meas]) -> Result<usize, StoreError> {
        let mut taken = 0;
        while taken < batch.len() && !self.is_full {
            let mut chunk = Chunk::new(self.next_chunk_id, self.chunk_size as usize);
            self.next_chunk_id += 1;
            while taken < batch.len() {
                match chunk.append(&batch[taken]) {
                    Ok(()) => taken += 1,
                    Err(StoreError::Full) => break,
                    Err(e) => return Err(e),
                }
            }
            chunk.seal();
            if chunk.is_empty() {
                continue;
            }
            self.write_chunk(&chunk)?;
            if self.index.len() as u32 >= self.chunk_capacity {
                self.is_full = true;
            }
        }
        Ok(taken)
    }

    fn write_chunk(&mut self, chunk: &Chunk) -> Result<(), StoreError> {
        let mut rec = Vec::with_capacity(CHUNK_HEADER_SIZE + self.chunk_size as usize);
        chunk.header.write_to(&mut rec);
        rec.extend_from_slice(chunk.buffer());
        // Pad so every chunk slot has the same on-disk width.
        rec.resize(CHUNK_HEADER_SIZE + self.chunk_size as usize, 0);
        self.file.write_all(&rec)?;

        self.index.push(ChunkIndexRec { offset: self.write_offset, header: chunk.header });
        self.write_offset += rec.len() as u64;
        self.min_time = self.min_time.min(chunk.header.min_time);
        self.max_time = self.max_time.max(chunk.header.max_time);
        self.id_bloom = bloom::union(self.id_bloom, chunk.header.id_bloom);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.is_full
    }

    pub fn chunk_count(&self) -> usize {
        self.index.len()
    }

    /// Sorts the index by `max_time`, backpatches the page header,
    /// writes the index file, fsyncs, and atomically installs both
    /// files under their final names.
    pub fn close(mut self) -> Result<String, StoreError> {
        if self.index.is_empty() {
            // Nothing written; drop the temp file instead of installing
            // an empty page.
            drop(self.file);
            let _ = fs::remove_file(&self.tmp_page);
            return Err(StoreError::Internal("refusing to install an empty page".to_string()));
        }

        // maxTime ordering speeds up reverse scans for time-point reads.
        self.index.sort_by_key(|rec| rec.header.max_time);

        let header = PageHeader {
            chunk_capacity: self.chunk_capacity,
            chunk_size: self.chunk_size,
            added_chunks: self.index.len() as u32,
            write_offset: self.write_offset,
            is_full: self.is_full,
            max_chunk_id: self.next_chunk_id - 1,
            min_time: self.min_time,
            max_time: self.max_time,
        };
        let mut hdr = Vec::with_capacity(PAGE_HEADER_SIZE as usize);
        header.write_to(&mut hdr);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&hdr)?;
        self.file.flush()?;
        self.file.sync_data()?;

        let index_header = IndexHeader {
            min_time: self.min_time,
            max_time: self.max_time,
            id_bloom: self.id_bloom,
            chunk_count: self.index.len() as u32,
            chunk_capacity: self.chunk_capacity,
            chunk_size: self.chunk_size,
            is_sorted: true,
        };
        let mut ibuf = Vec::with_capacity(INDEX_HEADER_SIZE + self.index.len() * INDEX_REC_SIZE);
        index_header.write_to(&mut ibuf);
        for rec in &self.index {
            ibuf.extend_from_slice(&rec.offset.to_le_bytes());
            rec.header.write_to(&mut ibuf);
        }
        let mut ifile = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.tmp_index)?;
        ifile.write_all(&ibuf)?;
        ifile.sync_data()?;
        drop(ifile);
        drop(self.file);

        fs::rename(&self.tmp_page, page_path(&self.dir, &self.stem))?;
        fs::rename(&self.tmp_index, index_path(&self.dir, &self.stem))?;
        sync_dir(&self.dir)?;
        Ok(self.stem)
    }
}

/// Read-only view over one installed page. Concurrent readers share it
/// through `Arc`; no lock guards the mapped bytes.
#[derive(Debug)]
pub struct PageReader {
    stem: String,
    page_map: Mmap,
    header: IndexHeader,
    index: Vec<ChunkIndexRec>,
}

impl PageReader {
    pub fn open(dir: &Path, stem: &str) -> Result<Arc<Self>, StoreError> {
        let ppath = page_path(dir, stem);
        let ipath = index_path(dir, stem);

        let pfile = File::open(&ppath)?;
        let page_map = unsafe { Mmap::map(&pfile)? };
        if page_map.len() < PAGE_HEADER_SIZE as usize || &page_map[0..8] != PAGE_MAGIC {
            return Err(StoreError::corruption(format!("Bad page magic in {:?}", ppath)));
        }

        let ibytes = fs::read(&ipath)?;
        let header = IndexHeader::read_from(&ibytes, &ipath)?;
        let mut index = Vec::with_capacity(header.chunk_count as usize);
        let mut off = INDEX_HEADER_SIZE;
        for _ in 0..header.chunk_count {
            if off + INDEX_REC_SIZE > ibytes.len() {
                return Err(StoreError::corruption(format!("Truncated page index {:?}", ipath)));
            }
            let offset = u64::from_le_bytes(ibytes[off..off + 8].try_into().expect("offset"));
            let chunk_header = ChunkHeader::read_from(&ibytes[off + 8..off + INDEX_REC_SIZE])?;
            index.push(ChunkIndexRec { offset, header: chunk_header });
            off += INDEX_REC_SIZE;
        }

        Ok(Arc::new(PageReader { stem: stem.to_string(), page_map, header, index }))
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn min_time(&self) -> Time {
        self.header.min_time
    }

    pub fn max_time(&self) -> Time {
        self.header.max_time
    }

    pub fn chunk_count(&self) -> usize {
        self.index.len()
    }

    /// Index-level prefilter over the whole page.
    pub fn may_contain(&self, ids: &[Id], from: Time, to: Time) -> bool {
        if self.header.min_time > to || self.header.max_time < from {
            return false;
        }
        ids.is_empty() || ids.iter().any(|id| bloom::check(self.header.id_bloom, id))
    }

    /// Chunks whose statistics overlap the query.
    pub fn chunks_by_interval(self: &Arc<Self>, q: &QueryInterval) -> Vec<ChunkLink> {
        if !self.may_contain(&q.ids, q.from, q.to) {
            return Vec::new();
        }
        self.index
            .iter()
            .enumerate()
            .filter(|(_, rec)| {
                rec.header.is_init
                    && rec.header.overlaps(q.from, q.to)
                    && rec.header.check_id_any(&q.ids)
                    && rec.header.check_flag(q.flag)
            })
            .map(|(pos, rec)| ChunkLink {
                page: Arc::clone(self),
                index_pos: pos,
                chunk_id: rec.header.chunk_id,
                max_time: rec.header.max_time,
            })
            .collect()
    }

    /// Copies one chunk out of the mapping, verifying its checksum.
    pub fn open_chunk(&self, index_pos: usize) -> Result<Chunk, StoreError> {
        let rec = self.index.get(index_pos).ok_or_else(|| {
            StoreError::Internal(format!("chunk index {} out of range", index_pos))
        })?;
        let body_start = rec.offset as usize + CHUNK_HEADER_SIZE;
        let body_len = rec.header.cursor_byte as usize + usize::from(rec.header.cursor_bit > 0);
        let body_end = body_start + body_len;
        if body_end > self.page_map.len() {
            return Err(StoreError::corruption(format!(
                "chunk {} overruns page {}",
                rec.header.chunk_id, self.stem
            )));
        }
        let buffer = self.page_map[body_start..body_end].to_vec();
        Chunk::from_parts(rec.header, buffer)
    }

    /// Opens each linked chunk and pushes every matching measurement to
    /// the consumer. Checksum failures abort with the offending chunk.
    pub fn read_links(
        &self,
        q: &QueryInterval,
        links: &[ChunkLink],
        consumer: &mut dyn FnMut(Meas),
    ) -> Result<(), StoreError> {
        for link in links {
            let chunk = self.open_chunk(link.index_pos)?;
            for m in chunk.reader()? {
                if m.time >= q.from
                    && m.time <= q.to
                    && m.matches_flag(q.flag)
                    && (q.ids.is_empty() || q.ids.contains(&m.id))
                {
                    consumer(m);
                }
            }
        }
        Ok(())
    }

    /// Latest value per queried id at or before the time point. Walks
    /// chunks in reverse `max_time` order and stops per id on first hit.
    pub fn values_before_time_point(
        &self,
        q: &QueryTimePoint,
        out: &mut Id2Meas,
    ) -> Result<(), StoreError> {
        let mut positions: Vec<usize> = (0..self.index.len())
            .filter(|&i| {
                let h = &self.index[i].header;
                h.is_init
                    && h.min_time <= q.time_point
                    && h.check_id_any(&q.ids)
                    && h.check_flag(q.flag)
            })
            .collect();
        positions.sort_by_key(|&i| std::cmp::Reverse(self.index[i].header.max_time));

        // Found-tracking is local to this page: other tiers may already
        // have answers in `out`, and only the prev-vs-new time compare
        // is allowed to arbitrate across tiers. Within the page, an id
        // answered by a chunk stops at that chunk (index order is
        // reverse max_time, so earlier chunks hold the newer values).
        let mut found: std::collections::HashSet<Id> = std::collections::HashSet::new();
        for pos in positions {
            if !q.ids.is_empty() && q.ids.iter().all(|id| found.contains(id)) {
                break;
            }
            let mut found_here: Vec<Id> = Vec::new();
            let chunk = self.open_chunk(pos)?;
            for m in chunk.reader()? {
                if m.time > q.time_point || !m.matches_flag(q.flag) {
                    continue;
                }
                if !q.ids.is_empty() && !q.ids.contains(&m.id) {
                    continue;
                }
                if found.contains(&m.id) {
                    continue;
                }
                found_here.push(m.id);
                match out.get(&m.id) {
                    Some(prev) if prev.time >= m.time => {}
                    _ => {
                        out.insert(m.id, m);
                    }
                }
            }
            found.extend(found_here);
        }
        Ok(())
    }

    pub fn min_max_time(&self, id: Id) -> Result<Option<(Time, Time)>, StoreError> {
        if !bloom::check(self.header.id_bloom, &id) {
            return Ok(None);
        }
        let mut min = Time::MAX;
        let mut max = 0;
        let mut seen = false;
        for pos in 0..self.index.len() {
            let h = &self.index[pos].header;
            if !h.is_init || !h.check_id(id) {
                continue;
            }
            let chunk = self.open_chunk(pos)?;
            for m in chunk.reader()? {
                if m.id == id {
                    seen = true;
                    min = min.min(m.time);
                    max = max.max(m.time);
                }
            }
        }
        Ok(seen.then_some((min, max)))
    }

    /// Full contents, used by `repack` and integrity checks.
    pub fn read_all(&self) -> Result<Vec<Meas>, StoreError> {
        let mut out = Vec::new();
        for pos in 0..self.index.len() {
            if !self.index[pos].header.is_init {
                continue;
            }
            let chunk = self.open_chunk(pos)?;
            out.extend(chunk.reader()?);
        }
        Ok(out)
    }

    /// Verifies every chunk checksum without materializing measurements.
    pub fn verify(&self) -> Result<(), StoreError> {
        for pos in 0..self.index.len() {
            if self.index[pos].header.is_init {
                self.open_chunk(pos)?;
            }
        }
        Ok(())
    }
}

/// Reference-counted registry of open pages.
///
/// A page stays mapped while any `Arc<PageReader>` (or a `ChunkLink`
/// into it) is held; eviction skips entries with outstanding readers,
/// the same reaping rule the rest of the engine uses for obsolete
/// files.
#[derive(Debug)]
pub struct PageCache {
    dir: PathBuf,
    capacity: usize,
    open: Mutex<HashMap<String, Arc<PageReader>>>,
}

impl PageCache {
    pub fn new(dir: &Path, capacity: usize) -> Self {
        PageCache {
            dir: dir.to_path_buf(),
            capacity: capacity.max(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, stem: &str) -> Result<Arc<PageReader>, StoreError> {
        let mut open = self.open.lock()?;
        if let Some(page) = open.get(stem) {
            return Ok(Arc::clone(page));
        }
        let page = PageReader::open(&self.dir, stem)?;
        if open.len() >= self.capacity {
            let idle: Vec<String> = open
                .iter()
                .filter(|(_, p)| Arc::strong_count(p) == 1)
                .map(|(k, _)| k.clone())
                .collect();
            for k in idle {
                if open.len() < self.capacity {
                    break;
                }
                open.remove(&k);
            }
        }
        open.insert(stem.to_string(), Arc::clone(&page));
        Ok(page)
    }

    /// Drops a page from the cache (the files may be going away).
    pub fn forget(&self, stem: &str) {
        if let Ok(mut open) = self.open.lock() {
            open.remove(stem);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut open) = self.open.lock() {
            open.clear();
        }
    }
}

fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    let d = File::open(dir)?;
    d.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sorted_batch(ids: &[Id], per_id: u64) -> Vec<Meas> {
        let mut out = Vec::new();
        for &id in ids {
            for i in 0..per_id {
                out.push(Meas::new(id, 1_000 + i * 10, i as f64 + id as f64, 0));
            }
        }
        out.sort_by(crate::types::meas_id_time_order);
        out
    }

    fn write_page(dir: &Path, stem: &str, batch: &[Meas]) -> String {
        let mut w = PageWriter::create(dir, stem, 1024, 64).unwrap();
        let taken = w.append(batch).unwrap();
        assert_eq!(taken, batch.len(), "page filled unexpectedly");
        w.close().unwrap()
    }

    #[test]
    fn write_then_read_interval() {
        let dir = tempdir().unwrap();
        let batch = sorted_batch(&[1, 2, 3], 100);
        write_page(dir.path(), "p1", &batch);

        let page = PageReader::open(dir.path(), "p1").unwrap();
        assert_eq!(page.min_time(), 1_000);
        assert_eq!(page.max_time(), 1_990);

        let q = QueryInterval::new(vec![2], 0, 1_100, 1_200);
        let links = page.chunks_by_interval(&q);
        assert!(!links.is_empty());
        let mut got = Vec::new();
        page.read_links(&q, &links, &mut |m| got.push(m)).unwrap();
        assert_eq!(got.len(), 11);
        assert!(got.iter().all(|m| m.id == 2 && (1_100..=1_200).contains(&m.time)));
    }

    #[test]
    fn page_round_trips_everything_exactly_once() {
        let dir = tempdir().unwrap();
        let batch = sorted_batch(&[5, 9], 500);
        write_page(dir.path(), "p2", &batch);
        let page = PageReader::open(dir.path(), "p2").unwrap();
        let mut all = page.read_all().unwrap();
        all.sort_by(crate::types::meas_id_time_order);
        assert_eq!(all, batch);
    }

    #[test]
    fn index_is_sorted_by_max_time() {
        let dir = tempdir().unwrap();
        let batch = sorted_batch(&[1, 2, 3, 4], 400);
        write_page(dir.path(), "p3", &batch);
        let page = PageReader::open(dir.path(), "p3").unwrap();
        assert!(page.chunk_count() > 1, "need several chunks to check ordering");
        let maxes: Vec<Time> = page.index.iter().map(|r| r.header.max_time).collect();
        assert!(maxes.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn values_before_time_point_stops_per_id() {
        let dir = tempdir().unwrap();
        let batch = sorted_batch(&[1, 2], 50);
        write_page(dir.path(), "p4", &batch);
        let page = PageReader::open(dir.path(), "p4").unwrap();

        let q = QueryTimePoint::new(vec![1, 2], 0, 1_255);
        let mut out = Id2Meas::new();
        page.values_before_time_point(&q, &mut out).unwrap();
        assert_eq!(out[&1].time, 1_250);
        assert_eq!(out[&2].time, 1_250);
    }

    #[test]
    fn corrupted_chunk_body_fails_checksum_on_open() {
        let dir = tempdir().unwrap();
        let batch = sorted_batch(&[1], 50);
        write_page(dir.path(), "p5", &batch);

        // Flip one byte inside the first chunk body.
        let ppath = page_path(dir.path(), "p5");
        let mut bytes = fs::read(&ppath).unwrap();
        let victim = PAGE_HEADER_SIZE as usize + CHUNK_HEADER_SIZE + 4;
        bytes[victim] ^= 0xff;
        fs::write(&ppath, &bytes).unwrap();

        let page = PageReader::open(dir.path(), "p5").unwrap();
        let err = page.open_chunk(0).unwrap_err();
        assert!(matches!(err, StoreError::Checksum(_)));
    }

    #[test]
    fn page_capacity_limits_accepted_batch() {
        let dir = tempdir().unwrap();
        let batch = sorted_batch(&[1, 2, 3, 4, 5, 6, 7, 8], 300);
        let mut w = PageWriter::create(dir.path(), "p6", 256, 2).unwrap();
        let taken = w.append(&batch).unwrap();
        assert!(taken < batch.len());
        assert!(w.is_full());
        assert_eq!(w.chunk_count(), 2);
        w.close().unwrap();
        let page = PageReader::open(dir.path(), "p6").unwrap();
        assert_eq!(page.read_all().unwrap().len(), taken);
    }

    #[test]
    fn cache_returns_shared_instances_and_survives_eviction_pressure() {
        let dir = tempdir().unwrap();
        for stem in ["c1", "c2", "c3"] {
            write_page(dir.path(), stem, &sorted_batch(&[1], 10));
        }
        let cache = PageCache::new(dir.path(), 2);
        let a1 = cache.get("c1").unwrap();
        let a2 = cache.get("c1").unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));
        // Held page must survive eviction pressure.
        let _b = cache.get("c2").unwrap();
        let _c = cache.get("c3").unwrap();
        assert_eq!(a1.read_all().unwrap().len(), 10);
    }
}
