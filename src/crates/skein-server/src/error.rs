//! Server-side error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration loading failed: bad include, cyclic variable, invalid
    /// document shape. Fatal for the affected workflow or project.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("shell error: {0}")]
    Shell(String),

    #[error(transparent)]
    Core(#[from] skein_core::CoreError),

    #[error(transparent)]
    Checkpoint(#[from] skein_checkpoint::CheckpointError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
