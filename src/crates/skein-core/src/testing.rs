//! Test doubles shared by unit and integration tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Settings;
use crate::llm::{ChatChunk, ChatClient, ChatRequest, ChatStream, LlmError};
use crate::project::{ProjectContext, ProjectState, ShellCommand, ShellExit, ShellRunner};
use crate::state::LlmUsageStats;
use crate::tools::Tool;

/// Minimal in-memory project good enough for driving runners in tests.
pub struct StubProject {
    base_path: PathBuf,
    settings: parking_lot::Mutex<Arc<Settings>>,
    state: ProjectState,
    tools: parking_lot::Mutex<HashMap<String, Arc<dyn Tool>>>,
    shells: parking_lot::Mutex<Option<Arc<dyn ShellRunner>>>,
    chat: parking_lot::Mutex<Option<Arc<dyn ChatClient>>>,
    current_workflow: parking_lot::Mutex<Option<String>>,
    usage: parking_lot::Mutex<LlmUsageStats>,
}

impl StubProject {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            base_path: std::env::temp_dir(),
            settings: parking_lot::Mutex::new(Arc::new(settings)),
            state: ProjectState::new(),
            tools: parking_lot::Mutex::new(HashMap::new()),
            shells: parking_lot::Mutex::new(None),
            chat: parking_lot::Mutex::new(None),
            current_workflow: parking_lot::Mutex::new(None),
            usage: parking_lot::Mutex::new(LlmUsageStats::default()),
        }
    }

    pub fn set_base_path(&mut self, path: PathBuf) {
        self.base_path = path;
    }

    pub fn add_tool(&self, tool: Arc<dyn Tool>) {
        self.tools.lock().insert(tool.name().to_string(), tool);
    }

    pub fn set_shells(&self, shells: Arc<dyn ShellRunner>) {
        *self.shells.lock() = Some(shells);
    }

    pub fn set_chat_client(&self, client: Arc<dyn ChatClient>) {
        *self.chat.lock() = Some(client);
    }

    pub fn replace_settings(&self, settings: Settings) {
        *self.settings.lock() = Arc::new(settings);
    }
}

impl Default for StubProject {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProjectContext for StubProject {
    fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn settings(&self) -> Arc<Settings> {
        self.settings.lock().clone()
    }

    fn state(&self) -> &ProjectState {
        &self.state
    }

    fn shells(&self) -> Option<Arc<dyn ShellRunner>> {
        self.shells.lock().clone()
    }

    fn chat_client(&self) -> Option<Arc<dyn ChatClient>> {
        self.chat.lock().clone()
    }

    fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.lock().get(name).cloned()
    }

    fn tool_names(&self) -> Vec<String> {
        self.tools.lock().keys().cloned().collect()
    }

    fn current_workflow(&self) -> Option<String> {
        self.current_workflow.lock().clone()
    }

    fn set_current_workflow(&self, name: Option<String>) {
        *self.current_workflow.lock() = name;
    }

    fn llm_usage(&self) -> LlmUsageStats {
        self.usage.lock().clone()
    }

    fn add_llm_usage(&self, usage: &LlmUsageStats) {
        self.usage.lock().add(usage);
    }
}

/// Chat client replaying a scripted chunk sequence per request.
pub struct ScriptedChatClient {
    scripts: parking_lot::Mutex<Vec<Vec<Result<ChatChunk, LlmError>>>>,
}

impl ScriptedChatClient {
    /// Scripts are consumed in order, one per `stream_chat` call; the last
    /// script repeats once the list is exhausted.
    pub fn new(scripts: Vec<Vec<Result<ChatChunk, LlmError>>>) -> Self {
        Self {
            scripts: parking_lot::Mutex::new(scripts),
        }
    }
}

#[async_trait]
impl ChatClient for ScriptedChatClient {
    async fn stream_chat(&self, _request: ChatRequest) -> Result<ChatStream, LlmError> {
        let mut scripts = self.scripts.lock();
        let script = if scripts.len() > 1 {
            scripts.remove(0)
        } else {
            scripts
                .first()
                .cloned()
                .ok_or_else(|| LlmError::Configuration("no scripted responses left".into()))?
        };
        Ok(futures::stream::iter(script).boxed())
    }
}

/// Shell runner whose commands complete immediately with scripted output.
pub struct ScriptedShell {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit: ShellExit,
}

struct ScriptedShellCommand {
    stdout: parking_lot::Mutex<Option<Vec<String>>>,
    stderr: parking_lot::Mutex<Option<Vec<String>>>,
    exit: ShellExit,
}

#[async_trait]
impl ShellCommand for ScriptedShellCommand {
    fn stdout(&self) -> BoxStream<'static, String> {
        let lines = self.stdout.lock().take().unwrap_or_default();
        futures::stream::iter(lines).boxed()
    }

    fn stderr(&self) -> BoxStream<'static, String> {
        let lines = self.stderr.lock().take().unwrap_or_default();
        futures::stream::iter(lines).boxed()
    }

    async fn wait(&self) -> ShellExit {
        self.exit
    }

    async fn terminate(&self, _grace_s: f64) {}
}

#[async_trait]
impl ShellRunner for ScriptedShell {
    async fn run(
        &self,
        _command: &str,
        _timeout_s: Option<f64>,
    ) -> crate::error::Result<Arc<dyn ShellCommand>> {
        Ok(Arc::new(ScriptedShellCommand {
            stdout: parking_lot::Mutex::new(Some(self.stdout.clone())),
            stderr: parking_lot::Mutex::new(Some(self.stderr.clone())),
            exit: self.exit,
        }))
    }
}
