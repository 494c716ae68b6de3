//! Tools callable by LLM nodes.
//!
//! A tool exposes an OpenAI function schema and executes with decoded JSON
//! arguments, returning either final text or a directive to start a nested
//! workflow. The effective [`ToolSpec`] for a call merges the node-level
//! spec with the project-level one (see
//! [`build_effective_tool_specs`]).

mod apply_patch;
mod exec;
mod run_agent;
mod update_plan;

pub use apply_patch::{changes_to_file_changes as apply_patch_changes_to_file_changes, ApplyPatchTool};
pub use exec::ExecTool;
pub use run_agent::RunAgentTool;
pub use update_plan::{Task, TaskList, TaskStatus, UpdatePlanTool};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ToolSpec;
use crate::error::Result;
use crate::project::ProjectContext;
use crate::state::{Message, SharedExecution};

/// What a tool produced.
#[derive(Debug, Clone)]
pub enum ToolResponse {
    /// Final textual result, recorded as the tool call response.
    Text { text: String },
    /// Request to start a nested workflow; the runner suspends the node
    /// until the child completes.
    StartWorkflow {
        workflow: String,
        initial_text: Option<String>,
        initial_message: Option<Message>,
    },
}

impl ToolResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Invocation context handed to a tool.
#[derive(Clone)]
pub struct ToolReq {
    /// The workflow execution the calling node belongs to.
    pub run: SharedExecution,
    /// Effective tool spec for this invocation.
    pub spec: ToolSpec,
}

/// A callable surface exposed to the LLM.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Execute with decoded arguments (an object, not a JSON string).
    async fn run(&self, req: ToolReq, args: Value) -> Result<ToolResponse>;

    /// This tool's definition in OpenAI function format.
    async fn openapi_spec(&self, spec: &ToolSpec) -> Result<Value>;
}

/// Instantiate the built-in tools against a project.
pub fn builtin_tools(project: Arc<dyn ProjectContext>) -> HashMap<String, Arc<dyn Tool>> {
    let mut tools: HashMap<String, Arc<dyn Tool>> = HashMap::new();
    let entries: Vec<Arc<dyn Tool>> = vec![
        Arc::new(ExecTool::new(project.clone())),
        Arc::new(ApplyPatchTool::new(project.clone())),
        Arc::new(RunAgentTool::new(project.clone())),
        Arc::new(UpdatePlanTool::new(project)),
    ];
    for tool in entries {
        tools.insert(tool.name().to_string(), tool);
    }
    tools
}

/// Merge node-level tool specs with project-level (global) specs by name.
///
/// Precedence: the global `enabled` and `auto_approve` override the node's
/// when set; `auto_approve_rules` concatenate so both scopes contribute
/// matchers; `config` merges shallowly with the global winning on key
/// conflicts. Only specs listed on the node are returned.
pub fn build_effective_tool_specs(
    project: &dyn ProjectContext,
    node_specs: &[ToolSpec],
) -> HashMap<String, ToolSpec> {
    let settings = project.settings();
    let mut effective = HashMap::new();
    for node_spec in node_specs {
        let mut base = node_spec.clone();
        if let Some(global) = settings.tool_spec(&node_spec.name) {
            base.enabled = global.enabled;
            if global.auto_approve.is_some() {
                base.auto_approve = global.auto_approve;
            }
            if !global.auto_approve_rules.is_empty() {
                base.auto_approve_rules
                    .extend(global.auto_approve_rules.iter().cloned());
            }
            let mut merged = node_spec.config.clone();
            for (k, v) in &global.config {
                merged.insert(k.clone(), v.clone());
            }
            base.config = merged;
        }
        effective.insert(node_spec.name.clone(), base);
    }
    effective
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Settings, ToolAutoApproveRule};
    use crate::testing::StubProject;

    #[test]
    fn effective_specs_merge_global_over_node() {
        let mut settings = Settings::default();
        settings.tools = vec![ToolSpec {
            name: "exec".into(),
            enabled: true,
            auto_approve: Some(true),
            auto_approve_rules: vec![ToolAutoApproveRule {
                key: "command".into(),
                pattern: "^ls".into(),
            }],
            config: serde_json::json!({"timeout_s": 5})
                .as_object()
                .unwrap()
                .clone(),
        }];
        let project = StubProject::with_settings(settings);

        let node_specs = vec![ToolSpec {
            name: "exec".into(),
            enabled: true,
            auto_approve: Some(false),
            auto_approve_rules: vec![ToolAutoApproveRule {
                key: "command".into(),
                pattern: "^cat".into(),
            }],
            config: serde_json::json!({"timeout_s": 1, "max_output_chars": 100})
                .as_object()
                .unwrap()
                .clone(),
        }];

        let effective = build_effective_tool_specs(&project, &node_specs);
        let spec = effective.get("exec").unwrap();
        assert_eq!(spec.auto_approve, Some(true));
        assert_eq!(spec.auto_approve_rules.len(), 2);
        assert_eq!(spec.config.get("timeout_s"), Some(&serde_json::json!(5)));
        assert_eq!(
            spec.config.get("max_output_chars"),
            Some(&serde_json::json!(100))
        );
    }

    #[test]
    fn effective_specs_only_cover_node_tools() {
        let project = StubProject::new();
        let node_specs = vec![ToolSpec::named("apply_patch")];
        let effective = build_effective_tool_specs(&project, &node_specs);
        assert_eq!(effective.len(), 1);
        assert!(effective.contains_key("apply_patch"));
    }
}
