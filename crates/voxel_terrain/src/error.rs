//! Error types for engine setup and persistence.

use std::path::PathBuf;

/// Errors surfaced by engine construction and shutdown.
///
/// Runtime chunk failures never show up here: a bad chunk is logged and its
/// request completes with empty buffers, so the pipeline keeps running.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Rejected engine configuration.
    #[error("invalid engine config: {0}")]
    Config(String),

    /// A worker thread could not be spawned. The engine fails fast rather
    /// than limping along with a partial pool.
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// World directory could not be prepared.
    #[error("persistence setup failed: {0}")]
    Persist(#[from] PersistError),
}

/// Errors from the on-disk chunk record codec.
///
/// Callers on the load path treat every variant as "no saved edits".
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record file exists but does not parse as `<run>,<value>` lines.
    #[error("malformed record line {line} in {path}")]
    Malformed { path: PathBuf, line: usize },

    /// Run lengths do not cover the field volume exactly.
    #[error("record in {path} decodes to the wrong cell count")]
    WrongLength { path: PathBuf },
}
