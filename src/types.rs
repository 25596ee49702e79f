use std::collections::BTreeMap;

/// Series identifier. The engine never interprets ids; naming lives upstream.
pub type Id = u64;

/// Timestamp in milliseconds since epoch.
pub type Time = u64;

/// Sample value.
pub type Value = f64;

/// User tag attached to a measurement. `0` is the default and matches
/// everything when used as a query mask.
pub type Flag = u32;

/// Reserved flag marking "no observation was found" in query results.
pub const NO_DATA: Flag = u32::MAX;

/// Size of one measurement record on disk (all fields little-endian).
pub const MEAS_SIZE: usize = 8 + 8 + 8 + 4;

/// The atomic record: one sample of one series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Meas {
    pub id: Id,
    pub time: Time,
    pub value: Value,
    pub flag: Flag,
}

impl Meas {
    pub fn new(id: Id, time: Time, value: Value, flag: Flag) -> Self {
        Meas { id, time, value, flag }
    }

    /// Sentinel returned for ids with no observation at a time point.
    pub fn no_data(id: Id, time: Time) -> Self {
        Meas { id, time, value: 0.0, flag: NO_DATA }
    }

    /// True when this measurement passes a query flag mask (mask 0 matches all).
    #[inline]
    pub fn matches_flag(&self, mask: Flag) -> bool {
        mask == 0 || self.flag == mask
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.time.to_le_bytes());
        buf.extend_from_slice(&self.value.to_bits().to_le_bytes());
        buf.extend_from_slice(&self.flag.to_le_bytes());
    }

    /// Decodes one record from exactly [`MEAS_SIZE`] bytes.
    pub fn read_from(b: &[u8]) -> Self {
        let id = u64::from_le_bytes(b[0..8].try_into().expect("meas id bytes"));
        let time = u64::from_le_bytes(b[8..16].try_into().expect("meas time bytes"));
        let value = f64::from_bits(u64::from_le_bytes(
            b[16..24].try_into().expect("meas value bytes"),
        ));
        let flag = u32::from_le_bytes(b[24..28].try_into().expect("meas flag bytes"));
        Meas { id, time, value, flag }
    }
}

/// Range query: all measurements of `ids` matching `flag` with
/// `from <= time <= to`.
#[derive(Debug, Clone)]
pub struct QueryInterval {
    pub ids: Vec<Id>,
    pub flag: Flag,
    pub from: Time,
    pub to: Time,
}

impl QueryInterval {
    pub fn new(ids: Vec<Id>, flag: Flag, from: Time, to: Time) -> Self {
        QueryInterval { ids, flag, from, to }
    }
}

/// Point-in-time query: for each id, the latest measurement with
/// `time <= time_point` matching `flag`.
#[derive(Debug, Clone)]
pub struct QueryTimePoint {
    pub ids: Vec<Id>,
    pub flag: Flag,
    pub time_point: Time,
}

impl QueryTimePoint {
    pub fn new(ids: Vec<Id>, flag: Flag, time_point: Time) -> Self {
        QueryTimePoint { ids, flag, time_point }
    }
}

/// Per-append accounting: how many measurements were written and how
/// many were ignored (only possible while the engine is stopping).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status {
    pub writes: usize,
    pub ignored: usize,
}

impl Status {
    pub fn merge(&mut self, other: Status) {
        self.writes += other.writes;
        self.ignored += other.ignored;
    }
}

/// Query result keyed by series id. BTreeMap keeps output deterministic.
pub type Id2Meas = BTreeMap<Id, Meas>;

/// (min, max) time bounds of a series.
pub type MinMax = (Time, Time);

/// Ordering used everywhere data is laid out on disk: by series, then time.
#[inline]
pub fn meas_id_time_order(a: &Meas, b: &Meas) -> std::cmp::Ordering {
    (a.id, a.time).cmp(&(b.id, b.time))
}
