//! Concrete project.
//!
//! A project roots a working directory, owns the merged settings, and
//! wires the subsystems the core reaches through traits: the shell
//! manager, the internal HTTP server, the chat client, the tool registry
//! and background persistence.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use skein_checkpoint::WorkflowStateManager;
use skein_core::config::Settings;
use skein_core::llm::ChatClient;
use skein_core::project::{
    FileChange, ProjectContext, ProjectState, ShellRunner,
};
use skein_core::state::LlmUsageStats;
use skein_core::tools::{builtin_tools, Tool};

use crate::error::{Result, ServerError};
use crate::http::InternalHttpServer;
use crate::proc::{EnvPolicy, ProcessManager, ShellManager};
use crate::settings::load_settings;

/// Default relative location of the project configuration file.
pub const DEFAULT_CONFIG_RELPATH: &str = ".vocode/config.yaml";

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# skein project configuration
workflows: {}
tools:
  - exec
  - apply_patch
  - update_plan
"#;

pub struct Project {
    weak_self: Weak<Project>,
    base_path: PathBuf,
    config_relpath: PathBuf,
    settings: parking_lot::Mutex<Arc<Settings>>,
    state: ProjectState,
    tools: parking_lot::Mutex<HashMap<String, Arc<dyn Tool>>>,
    processes: parking_lot::Mutex<Option<Arc<ProcessManager>>>,
    shells: parking_lot::Mutex<Option<Arc<ShellManager>>>,
    http: Arc<InternalHttpServer>,
    chat: parking_lot::Mutex<Option<Arc<dyn ChatClient>>>,
    state_manager: parking_lot::Mutex<Option<Arc<WorkflowStateManager>>>,
    current_workflow: parking_lot::Mutex<Option<String>>,
    usage: parking_lot::Mutex<LlmUsageStats>,
}

impl Project {
    pub fn new(base_path: impl Into<PathBuf>, settings: Settings) -> Arc<Self> {
        Self::with_config_relpath(base_path, DEFAULT_CONFIG_RELPATH, settings)
    }

    pub fn with_config_relpath(
        base_path: impl Into<PathBuf>,
        config_relpath: impl Into<PathBuf>,
        settings: Settings,
    ) -> Arc<Self> {
        let http_settings = settings.internal_http.clone().unwrap_or_default();
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            base_path: base_path.into(),
            config_relpath: config_relpath.into(),
            settings: parking_lot::Mutex::new(Arc::new(settings)),
            state: ProjectState::new(),
            tools: parking_lot::Mutex::new(HashMap::new()),
            processes: parking_lot::Mutex::new(None),
            shells: parking_lot::Mutex::new(None),
            http: InternalHttpServer::new(http_settings),
            chat: parking_lot::Mutex::new(None),
            state_manager: parking_lot::Mutex::new(None),
            current_workflow: parking_lot::Mutex::new(None),
            usage: parking_lot::Mutex::new(LlmUsageStats::default()),
        })
    }

    /// Initialize a project from a directory.
    ///
    /// Walks upward looking for the config file; when none exists a
    /// default one is written at the starting directory.
    pub fn from_base_path(base_path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let start: PathBuf = base_path.into();
        let rel = PathBuf::from(DEFAULT_CONFIG_RELPATH);

        let mut found: Option<PathBuf> = None;
        let mut cursor: Option<&Path> = Some(start.as_path());
        while let Some(dir) = cursor {
            if dir.join(&rel).is_file() {
                found = Some(dir.to_path_buf());
                break;
            }
            cursor = dir.parent();
        }

        let base = match found {
            Some(base) => base,
            None => {
                let config_path = start.join(&rel);
                if let Some(parent) = config_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if !config_path.exists() {
                    std::fs::write(&config_path, DEFAULT_CONFIG_TEMPLATE)?;
                }
                start
            }
        };

        let settings = load_settings(&base.join(&rel))?;
        Ok(Self::with_config_relpath(base, rel, settings))
    }

    fn arc(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("project accessed after drop")
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_path.join(&self.config_relpath)
    }

    pub fn http(&self) -> Arc<InternalHttpServer> {
        self.http.clone()
    }

    pub fn shell_manager(&self) -> Option<Arc<ShellManager>> {
        self.shells.lock().clone()
    }

    pub fn state_manager(&self) -> Option<Arc<WorkflowStateManager>> {
        self.state_manager.lock().clone()
    }

    pub fn set_chat_client(&self, client: Arc<dyn ChatClient>) {
        *self.chat.lock() = Some(client);
    }

    pub fn replace_settings(&self, settings: Settings) {
        *self.settings.lock() = Arc::new(settings);
    }

    /// Rebuild the tool registry from the built-in set, honoring disabled
    /// entries in the settings.
    pub fn refresh_tools(&self) {
        let settings = self.settings();
        let disabled: Vec<&str> = settings
            .tools
            .iter()
            .filter(|t| !t.enabled)
            .map(|t| t.name.as_str())
            .collect();
        let mut tools = builtin_tools(self.arc() as Arc<dyn ProjectContext>);
        tools.retain(|name, _| !disabled.contains(&name.as_str()));
        *self.tools.lock() = tools;
    }

    pub fn add_tool(&self, tool: Arc<dyn Tool>) {
        self.tools.lock().insert(tool.name().to_string(), tool);
    }
}

#[async_trait]
impl ProjectContext for Project {
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
        self.shells
            .lock()
            .clone()
            .map(|s| s as Arc<dyn ShellRunner>)
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

    fn schedule_refresh(&self, files: Vec<FileChange>) {
        // The knowledge subsystem is an external collaborator; record the
        // change set so interested parties can observe it.
        tracing::debug!(changed = files.len(), "project refresh scheduled");
        for file in &files {
            tracing::trace!(kind = ?file.kind, path = %file.relative_filename, "file changed");
        }
    }

    async fn start(&self) -> skein_core::Result<()> {
        let settings = self.settings();

        // Process and shell managers.
        if self.processes.lock().is_none() {
            let env_policy =
                EnvPolicy::from_settings(settings.process.as_ref().map(|p| &p.env));
            *self.processes.lock() = Some(Arc::new(ProcessManager::new(
                Some(self.base_path.clone()),
                env_policy,
            )));
        }
        if self.shells.lock().is_none() {
            let pm = self.processes.lock().clone().expect("processes initialized");
            let shell_settings = settings.process.as_ref().map(|p| p.shell.clone());
            *self.shells.lock() = Some(ShellManager::new(pm, shell_settings, None));
        }

        // Chat client from settings, unless one was injected.
        if self.chat.lock().is_none() {
            if let Some(llm) = &settings.llm {
                if let (Some(base_url), Some(api_key_env)) = (&llm.base_url, &llm.api_key_env) {
                    match skein_llm::RemoteLlmConfig::from_env(api_key_env, base_url)
                        .and_then(skein_llm::OpenAiChatClient::new)
                    {
                        Ok(client) => *self.chat.lock() = Some(Arc::new(client)),
                        Err(error) => {
                            tracing::warn!(%error, "chat client not configured");
                        }
                    }
                }
            }
        }

        self.refresh_tools();

        // Background persistence.
        if self.state_manager.lock().is_none() {
            let persistence = settings.persistence.clone().unwrap_or_default();
            let session_id = uuid::Uuid::new_v4().simple().to_string();
            let manager = WorkflowStateManager::new(
                self.base_path.clone(),
                &session_id[..8.min(session_id.len())],
                persistence.save_interval_s,
                persistence.max_total_log_bytes,
            );
            if let Err(error) = manager.start() {
                tracing::warn!(%error, "state persistence disabled");
            } else {
                *self.state_manager.lock() = Some(manager);
            }
        }

        Ok(())
    }

    async fn shutdown(&self) -> skein_core::Result<()> {
        let shells = self.shells.lock().take();
        if let Some(shells) = shells {
            shells.stop().await;
        }
        self.processes.lock().take();
        let state_manager = self.state_manager.lock().take();
        if let Some(manager) = state_manager {
            if let Err(error) = manager.shutdown().await {
                tracing::warn!(%error, "final state flush failed");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("base_path", &self.base_path)
            .field("config_relpath", &self.config_relpath)
            .finish()
    }
}

/// Map a [`ServerError`] into the core error space at trait boundaries.
pub fn to_core(error: ServerError) -> skein_core::CoreError {
    skein_core::CoreError::Other(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_base_path_writes_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::from_base_path(dir.path()).unwrap();
        assert!(project.config_path().is_file());
        assert!(project.settings().workflows.is_empty());
    }

    #[tokio::test]
    async fn from_base_path_finds_ancestor_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join(DEFAULT_CONFIG_RELPATH);
        std::fs::create_dir_all(config.parent().unwrap()).unwrap();
        std::fs::write(&config, "default_workflow: main\nworkflows: {}\n").unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();

        let project = Project::from_base_path(&nested).unwrap();
        assert_eq!(project.base_path(), dir.path());
        assert_eq!(project.settings().default_workflow.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn start_builds_shells_and_tools() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::new(dir.path(), Settings::default());
        project.start().await.unwrap();
        assert!(project.shells().is_some());
        let mut names = project.tool_names();
        names.sort();
        assert!(names.contains(&"exec".to_string()));
        assert!(names.contains(&"apply_patch".to_string()));
        assert!(names.contains(&"run_agent".to_string()));
        assert!(names.contains(&"update_plan".to_string()));
        project.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn disabled_tools_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.tools = vec![{
            let mut spec = skein_core::config::ToolSpec::named("exec");
            spec.enabled = false;
            spec
        }];
        let project = Project::new(dir.path(), settings);
        project.refresh_tools();
        assert!(project.tool("exec").is_none());
        assert!(project.tool("apply_patch").is_some());
    }
}
