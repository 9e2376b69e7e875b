//! Errors of the command-line tools.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The run configuration could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The run configuration is not valid YAML for [`crate::RunConfig`].
    #[error("invalid run configuration {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unknown demo '{name}' (available: {available})")]
    UnknownDemo { name: String, available: String },

    #[error(transparent)]
    Runtime(#[from] brainflow_runtime::Error),

    #[error(transparent)]
    Node(#[from] brainflow_nodes::Error),

    #[error("failed to encode block dump: {0}")]
    Json(#[from] serde_json::Error),
}
