use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; writing to stderr or a logger directly is
/// not acceptable. Callers provide an implementation that forwards
/// these events to `tracing`, `log`, metrics, or custom sinks.
pub trait EngineEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: EngineEvent);
}

/// Structured events emitted by the storage core.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    EngineStarted,
    EngineStopping,

    WalRolled { name: String },
    WalTailTruncated { name: String, dropped_bytes: u64 },

    CompactionStarted { source: String },
    CompactionFinished { source: String, page: String },
    CompactionFailed { source: String, error: String },
    CompactionRetried { source: String, attempt: u32 },

    PageWritten { name: String, chunks: usize },
    PageErased { name: String },
    PageQuarantined { name: String, error: String },

    MemoryPressure { bytes: usize },

    TierQueryFailed { tier: &'static str, error: String },

    FsckStarted,
    FsckRemovedOrphan { name: String },
    FsckUnfinishedDrop { wal: String, page: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl EngineEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: EngineEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn EngineEventListener> {
    Arc::new(NoopEventListener)
}

/// Test helper: collects every event for later inspection.
#[derive(Debug, Default)]
pub struct CollectingEventListener {
    events: std::sync::Mutex<Vec<EngineEvent>>,
}

impl CollectingEventListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EngineEventListener for CollectingEventListener {
    fn on_event(&self, event: EngineEvent) {
        if let Ok(mut e) = self.events.lock() {
            e.push(event);
        }
    }
}
