use thiserror::Error;

/// Typed errors surfaced by [`crate::registry::StreamRegistry`].
///
/// A future HTTP management layer maps `NotFound` -> 404, `InvalidUrl` -> 400,
/// anything else -> 500 with a redacted message.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("stream not found: {0}")]
    NotFound(String),

    #[error("invalid target url: {0}")]
    InvalidUrl(String),
}

/// Typed config-loading failure, surfaced by the binary entry point so a
/// malformed `config.yaml` or `APP_`-prefixed env var fails startup loudly
/// instead of silently falling back to defaults.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Errors from the on-disk persistence document. Never propagated to
/// `StreamRegistry` callers - logged and treated as "keep the in-memory
/// state authoritative".
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to read persistence file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse persistence file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write persistence file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
