use crate::types::Id;
use thiserror::Error;

/// Error type for all storage-engine operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        id: Option<Id>,
        time: Option<u64>,
    },

    #[error("Checksum mismatch: {0}")]
    Checksum(String),

    /// Control-flow signal: a chunk or WAL file reached capacity and the
    /// caller must roll a new one. Never user-visible.
    #[error("Container is full")]
    Full,

    #[error("Series not found: {0}")]
    NotFound(Id),

    #[error("Engine is stopping; append ignored")]
    AlreadyStopped,

    #[error("Storage is locked by another process (pid {pid})")]
    LockBusy { pid: u32 },

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Lock acquisition failed: {0}")]
    Lock(String),

    #[error("Background task error: {0}")]
    BackgroundTask(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn corruption(details: impl Into<String>) -> Self {
        StoreError::Corruption {
            details: details.into(),
            id: None,
            time: None,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StoreError::Lock(format!("Mutex/RwLock poisoned: {}", err))
    }
}
