//! Project context and external collaborator contracts.
//!
//! Executors and tools run against a [`ProjectContext`]: the project roots
//! the filesystem, exposes settings, and hands out the shell manager, chat
//! client and tool registry. The concrete project lives in the server
//! crate; the core only sees these traits, which keeps the runner testable
//! with stubs.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::Settings;
use crate::error::Result;
use crate::llm::ChatClient;
use crate::state::LlmUsageStats;
use crate::tools::Tool;

/// Result of waiting for a shell command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellExit {
    /// Exit code of the wrapped command, or None on timeout.
    pub code: Option<i32>,
    pub timed_out: bool,
}

/// One command running under the shell manager.
#[async_trait]
pub trait ShellCommand: Send + Sync {
    /// Stream of stdout lines. Consumable once.
    fn stdout(&self) -> BoxStream<'static, String>;

    /// Stream of stderr lines. Consumable once.
    fn stderr(&self) -> BoxStream<'static, String>;

    /// Wait for completion, honoring the command timeout.
    async fn wait(&self) -> ShellExit;

    /// Terminate the command, escalating to kill after the grace period.
    async fn terminate(&self, grace_s: f64);
}

/// Shell manager contract: run one command at a time with a timeout.
#[async_trait]
pub trait ShellRunner: Send + Sync {
    async fn run(&self, command: &str, timeout_s: Option<f64>) -> Result<Arc<dyn ShellCommand>>;
}

/// Kind of filesystem change reported after a patch application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One changed file, relative to the project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    #[serde(rename = "type")]
    pub kind: FileChangeKind,
    pub relative_filename: String,
}

/// Ephemeral, process-local project state shared across executors.
///
/// Holds typed values keyed by string; not persisted across runs. The
/// `http-input` executor parks its delivery queue here, keyed by node name.
#[derive(Default)]
pub struct ProjectState {
    data: parking_lot::Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ProjectState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Any + Send + Sync>(&self, key: &str, value: Arc<T>) {
        self.data.lock().insert(key.to_string(), value);
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.data
            .lock()
            .get(key)
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }

    pub fn get_or_insert_with<T: Any + Send + Sync>(
        &self,
        key: &str,
        make: impl FnOnce() -> Arc<T>,
    ) -> Arc<T> {
        let mut data = self.data.lock();
        if let Some(existing) = data.get(key).cloned().and_then(|v| v.downcast::<T>().ok()) {
            return existing;
        }
        let value = make();
        data.insert(key.to_string(), value.clone());
        value
    }

    pub fn delete(&self, key: &str) {
        self.data.lock().remove(key);
    }

    pub fn clear(&self) {
        self.data.lock().clear();
    }
}

/// The project surface visible to executors, tools and the runner.
#[async_trait]
pub trait ProjectContext: Send + Sync {
    fn base_path(&self) -> &Path;

    fn settings(&self) -> Arc<Settings>;

    /// Shared per-process state for executors.
    fn state(&self) -> &ProjectState;

    fn shells(&self) -> Option<Arc<dyn ShellRunner>> {
        None
    }

    fn chat_client(&self) -> Option<Arc<dyn ChatClient>> {
        None
    }

    fn tool(&self, _name: &str) -> Option<Arc<dyn Tool>> {
        None
    }

    fn tool_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Name of the currently running workflow (top of the manager stack).
    fn current_workflow(&self) -> Option<String> {
        None
    }

    fn set_current_workflow(&self, _name: Option<String>) {}

    /// Aggregate project-level LLM usage totals.
    fn llm_usage(&self) -> LlmUsageStats {
        LlmUsageStats::default()
    }

    fn add_llm_usage(&self, _usage: &LlmUsageStats) {}

    /// Schedule a background refresh after project files changed.
    fn schedule_refresh(&self, _files: Vec<FileChange>) {}

    /// Start project subsystems that need async initialization.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Gracefully shut down project subsystems.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
