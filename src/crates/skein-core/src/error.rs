//! Error types for graph construction and workflow execution.

use thiserror::Error;

use crate::llm::LlmError;

/// Convenience result type using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the graph model, executors and runner.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Graph shape is invalid (duplicate nodes, dangling edges, ...).
    /// Surfaced at load time and fatal for that workflow.
    #[error("graph validation failed: {0}")]
    Validation(String),

    /// Node or settings configuration is invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No executor registered for a node type.
    #[error("no executor registered for node type '{0}'")]
    UnknownExecutorType(String),

    /// An executor failed outside the step protocol.
    #[error("executor for node '{node}' failed: {error}")]
    Executor { node: String, error: String },

    /// The executor/step protocol was violated (no complete step, several
    /// complete steps, unknown outcome, missing edge). Fatal for the runner.
    #[error("runner contract violation: {0}")]
    Contract(String),

    /// A declared outcome could not be resolved for a node.
    #[error("unknown outcome '{outcome}' on node '{node}'")]
    UnknownOutcome { node: String, outcome: String },

    /// Tool invocation failed; converted into a tool_result error payload by
    /// the runner rather than aborting the node.
    #[error("tool error: {0}")]
    Tool(String),

    /// LLM provider failure.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// Shell subsystem failure.
    #[error("shell error: {0}")]
    Shell(String),

    /// Cooperative cancellation. Not a failure; execution stays resumable.
    #[error("run canceled")]
    Canceled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl CoreError {
    pub fn executor(node: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Executor {
            node: node.into(),
            error: error.to_string(),
        }
    }

    /// True when this error is the cooperative stop signal.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}
