/// Coordination store errors (transport, serialization, optimistic concurrency).
/// This is the error type for the `MaxRateStore` and `CoordinationStore` traits.
/// Callers treat every variant as transient: nothing here is fatal to delivery.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("version conflict on {path}: expected {expected:?}, found {found:?}")]
    Conflict {
        path: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("rocksdb error: {0}")]
    RocksDb(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        StoreError::RocksDb(err.into_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors raised while wiring up rate control: configuration, supervisor
/// lifecycle, and registration conflicts. Never surfaced to the delivery path.
#[derive(Debug, thiserror::Error)]
pub enum PaceError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("already registered: {0}")]
    DuplicateRegistration(String),

    #[error("failed to spawn supervisor thread: {0}")]
    SupervisorSpawn(String),

    #[error("supervisor stopped")]
    SupervisorStopped,

    #[error("supervisor thread panicked")]
    SupervisorPanicked,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type Result<T> = std::result::Result<T, PaceError>;
