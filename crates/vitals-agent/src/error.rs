//! Error types for the agent.

use crate::event::Category;

pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Startup configuration problems. Always fatal.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("device_id is required (set it in the config file or AGENT_DEVICE_ID)")]
    MissingDeviceId,

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Local event buffer failures.
#[derive(thiserror::Error, Debug)]
pub enum BufferError {
    #[error("{category} buffer is full ({capacity} events)")]
    BufferFull { category: Category, capacity: usize },

    #[error("persist {path}: {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encode {category} snapshot: {source}")]
    Encode {
        category: Category,
        #[source]
        source: serde_json::Error,
    },
}

/// Event source (inbox) failures.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("inbox {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encode reading: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Agent error type covering all failure modes surfaced to the binary.
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("buffer: {0}")]
    Buffer(#[from] BufferError),

    #[error("source: {0}")]
    Source(#[from] SourceError),

    #[error("http: {0}")]
    Http(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lock: {0}")]
    Lock(String),

    /// Input given on the command line that the agent cannot use.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
