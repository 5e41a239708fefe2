//! Error kinds for the execution runtime
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NuvomError {
    /// The requested task name is not present in the registry.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// A `strict` registration collided with an existing task name.
    #[error("task already registered: {0}")]
    DuplicateTask(String),

    /// A codec decode failed, or an on-disk record was truncated/invalid.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// A plugin failed to load or declared an incompatible API version.
    #[error("plugin load failed: {0}")]
    PluginLoadError(String),

    /// A transient backend failure (I/O, lock contention, busy database).
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The task callable raised while executing.
    #[error("task execution failed: {0}")]
    TaskExecutionError(String),

    /// The job exceeded its wall-clock timeout.
    #[error("job timed out")]
    Timeout,

    /// Wrapper for [`std::io::Error`](std::io::Error)
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapper for [`figment::Error`](figment::Error)
    #[error("config deserialization: {0}")]
    Config(#[from] figment::Error),

    /// Wrapper for [`toml::de::Error`](toml::de::Error)
    #[error("TOML deserialization: {0}")]
    Toml(#[from] toml::de::Error),

    /// Wrapper for [`serde_json::Error`](serde_json::Error)
    #[error("json serialization/deserialization: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Wrapper for [`rusqlite::Error`](rusqlite::Error)
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Wrapper for [`rmp_serde::encode::Error`](rmp_serde::encode::Error)
    #[error("codec: {0}")]
    Codec(#[from] rmp_serde::encode::Error),
}

pub type Result<T> = std::result::Result<T, NuvomError>;
