#![doc = r#"
strata: tiered time-series storage engine core

Measurements (id, time, value, flag) are absorbed by a write-ahead log
and an in-memory bucket tier, then compacted in the background into
immutable memory-mapped page files of delta-of-delta + XOR compressed
chunks. Queries fan out across all tiers and merge last-write-wins, so
reads stay consistent while compaction runs.

The crate is the storage core only: the network server, CLI, and
bindings live elsewhere and talk to [`Engine`].
"#]

pub mod bloom;
pub mod chunk;
pub mod codec;
pub mod compaction;
pub mod engine;
pub mod error;
pub mod lockfile;
pub mod manifest;
pub mod memory;
pub mod page;
pub mod settings;
pub mod telemetry;
pub mod threads;
pub mod types;
pub mod wal;

/// Entry point for all storage operations.
pub use crate::engine::{Engine, ReadCallback};
/// Error type for engine operations.
pub use crate::error::StoreError;
/// Engine configuration, persisted as `settings.json`.
pub use crate::settings::{Settings, Strategy};
/// Structured observability hook.
pub use crate::telemetry::{EngineEvent, EngineEventListener};
/// The atomic record and its query descriptors.
pub use crate::types::{
    Flag, Id, Id2Meas, Meas, QueryInterval, QueryTimePoint, Status, Time, Value, NO_DATA,
};
