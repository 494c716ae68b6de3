//! Built-in executors.

mod apply_patch;
mod exec;
mod input;
mod llm;
pub mod preprocessors;

pub use apply_patch::ApplyPatchExecutor;
pub use exec::{ExecExecutor, ExecParams};
pub use input::InputExecutor;
pub use llm::{LlmExecutor, LlmParams};
