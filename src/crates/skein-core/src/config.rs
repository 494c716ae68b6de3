//! Project settings model.
//!
//! This is the validated shape of the merged configuration document. The
//! loader (include expansion, variable interpolation) lives in the server
//! crate; everything here is plain data shared across the workspace.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::model::{Edge, Node};

/// Default cap for combined stdout/stderr returned by the exec tool.
pub const EXEC_TOOL_MAX_OUTPUT_CHARS_DEFAULT: usize = 10 * 1024;

/// Default per-call timeout for exec tool invocations, in seconds.
pub const EXEC_TOOL_TIMEOUT_S_DEFAULT: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "error",
        }
    }
}

/// One workflow definition: a graph plus scheduling metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflow name; synced from the map key on load.
    #[serde(default)]
    pub name: Option<String>,
    /// Human-readable purpose, used in agent tool descriptions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub need_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub need_input_prompt: Option<String>,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// When set, restricts which workflows this workflow may launch as
    /// nested agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_workflows: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

/// Rule for auto-approving a tool call based on its decoded arguments.
///
/// `key` is a dot-separated path into the arguments object; `pattern` is a
/// regular expression applied to the stringified value at that path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolAutoApproveRule {
    pub key: String,
    pub pattern: String,
}

impl ToolAutoApproveRule {
    /// True when the rule matches the given decoded arguments.
    pub fn matches(&self, args: &Value) -> bool {
        let Some(value) = lookup_dotted(args, &self.key) else {
            return false;
        };
        let Ok(re) = Regex::new(&self.pattern) else {
            return false;
        };
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        re.is_match(&text)
    }
}

fn lookup_dotted<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in key.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Tool specification usable both globally and per node.
///
/// A bare string is shorthand for `{name: <string>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ToolSpecRepr")]
pub struct ToolSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approve: Option<bool>,
    #[serde(default)]
    pub auto_approve_rules: Vec<ToolAutoApproveRule>,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
}

impl ToolSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            auto_approve: None,
            auto_approve_rules: Vec::new(),
            config: Default::default(),
        }
    }

    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = Some(auto_approve);
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ToolSpecRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(default)]
        auto_approve: Option<bool>,
        #[serde(default)]
        auto_approve_rules: Vec<ToolAutoApproveRule>,
        #[serde(default)]
        config: serde_json::Map<String, Value>,
    },
}

impl TryFrom<ToolSpecRepr> for ToolSpec {
    type Error = String;

    fn try_from(repr: ToolSpecRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            ToolSpecRepr::Name(name) => {
                if name.is_empty() {
                    return Err("Tool spec must include non-empty 'name'".into());
                }
                Ok(ToolSpec::named(name))
            }
            ToolSpecRepr::Full {
                name,
                enabled,
                auto_approve,
                auto_approve_rules,
                config,
            } => {
                if name.is_empty() {
                    return Err("Tool spec must include non-empty 'name'".into());
                }
                Ok(ToolSpec {
                    name,
                    enabled,
                    auto_approve,
                    auto_approve_rules,
                    config,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub default_level: LogLevel,
    /// Logger target -> level override.
    #[serde(default)]
    pub enabled_loggers: HashMap<String, LogLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellMode {
    /// Each command runs in its own subprocess.
    Direct,
    /// Commands run via a long-lived shell with wrapped markers.
    #[default]
    Shell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellSettings {
    #[serde(default)]
    pub mode: ShellMode,
    #[serde(default = "default_shell_program")]
    pub program: String,
    #[serde(default = "default_shell_args")]
    pub args: Vec<String>,
    /// Default per-command timeout in seconds.
    #[serde(default = "default_shell_timeout")]
    pub default_timeout_s: f64,
}

fn default_shell_program() -> String {
    "bash".to_string()
}

fn default_shell_args() -> Vec<String> {
    vec!["--noprofile".to_string(), "--norc".to_string()]
}

fn default_shell_timeout() -> f64 {
    120.0
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            mode: ShellMode::default(),
            program: default_shell_program(),
            args: default_shell_args(),
            default_timeout_s: default_shell_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessEnvSettings {
    #[serde(default = "default_true")]
    pub inherit_parent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowlist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denylist: Option<Vec<String>>,
    #[serde(default)]
    pub defaults: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessSettings {
    #[serde(default)]
    pub env: ProcessEnvSettings,
    #[serde(default)]
    pub shell: ShellSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecToolSettings {
    /// Maximum characters of combined stdout/stderr returned by the exec
    /// tool; guards against runaway subprocess output.
    #[serde(default = "default_exec_max_chars")]
    pub max_output_chars: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<f64>,
}

fn default_exec_max_chars() -> usize {
    EXEC_TOOL_MAX_OUTPUT_CHARS_DEFAULT
}

impl Default for ExecToolSettings {
    fn default() -> Self {
        Self {
            max_output_chars: EXEC_TOOL_MAX_OUTPUT_CHARS_DEFAULT,
            timeout_s: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_tool: Option<ExecToolSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceSettings {
    #[serde(default = "default_save_interval")]
    pub save_interval_s: f64,
    #[serde(default = "default_max_log_bytes")]
    pub max_total_log_bytes: u64,
}

fn default_save_interval() -> f64 {
    120.0
}

fn default_max_log_bytes() -> u64 {
    1024 * 1024 * 1024
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            save_interval_s: default_save_interval(),
            max_total_log_bytes: default_max_log_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalHttpSettings {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for InternalHttpSettings {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: None,
            secret_key: None,
        }
    }
}

/// LLM provider connection used by the `llm` executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Base URL of an OpenAI-compatible chat completions endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

/// Merged project settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub workflows: HashMap<String, WorkflowConfig>,
    /// Workflow to auto-start in interactive UIs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_workflow: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_settings: Option<ToolSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_http: Option<InternalHttpSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmSettings>,
}

impl Settings {
    /// Sync workflow names from their map keys; called after load.
    pub fn sync_workflow_names(&mut self) {
        for (key, wf) in self.workflows.iter_mut() {
            wf.name = Some(key.clone());
        }
    }

    /// Global tool spec by name, if configured.
    pub fn tool_spec(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn exec_tool_settings(&self) -> ExecToolSettings {
        self.tool_settings
            .as_ref()
            .and_then(|t| t.exec_tool.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_spec_string_shorthand() {
        let spec: ToolSpec = serde_json::from_value(serde_json::json!("exec")).unwrap();
        assert_eq!(spec.name, "exec");
        assert!(spec.enabled);
        assert!(spec.auto_approve.is_none());
    }

    #[test]
    fn auto_approve_rule_matches_dotted_key() {
        let rule = ToolAutoApproveRule {
            key: "resource.action".to_string(),
            pattern: "^read".to_string(),
        };
        let args = serde_json::json!({"resource": {"action": "read_file"}});
        assert!(rule.matches(&args));
        let args = serde_json::json!({"resource": {"action": "write_file"}});
        assert!(!rule.matches(&args));
        let args = serde_json::json!({"other": 1});
        assert!(!rule.matches(&args));
    }

    #[test]
    fn settings_sync_workflow_names() {
        let mut settings: Settings = serde_json::from_value(serde_json::json!({
            "workflows": {"main": {"nodes": [], "edges": []}}
        }))
        .unwrap();
        settings.sync_workflow_names();
        assert_eq!(
            settings.workflows.get("main").unwrap().name.as_deref(),
            Some("main")
        );
    }
}
