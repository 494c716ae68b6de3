//! Nested workflow launcher tool.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::ToolSpec;
use crate::error::{CoreError, Result};
use crate::project::ProjectContext;
use crate::tools::{Tool, ToolReq, ToolResponse};

/// Requests starting a child workflow. The manager performs the actual
/// launch; this tool only validates the request and emits the directive.
pub struct RunAgentTool {
    project: Arc<dyn ProjectContext>,
}

impl RunAgentTool {
    pub fn new(project: Arc<dyn ProjectContext>) -> Self {
        Self { project }
    }
}

#[async_trait]
impl Tool for RunAgentTool {
    fn name(&self) -> &str {
        "run_agent"
    }

    async fn run(&self, _req: ToolReq, args: Value) -> Result<ToolResponse> {
        let Value::Object(map) = &args else {
            return Err(CoreError::Tool(
                "run_agent requires object args with a 'name' key".into(),
            ));
        };
        let workflow = map
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CoreError::Tool("run_agent requires 'name' argument (string)".into()))?
            .to_string();

        // When the parent workflow restricts its agents, the target must be
        // on the allow-list.
        let settings = self.project.settings();
        if let Some(parent) = self.project.current_workflow() {
            if let Some(parent_cfg) = settings.workflows.get(&parent) {
                if let Some(allowed) = &parent_cfg.agent_workflows {
                    if !allowed.contains(&workflow) {
                        return Err(CoreError::Tool(format!(
                            "Workflow '{workflow}' is not allowed to be executed by '{parent}'"
                        )));
                    }
                }
            }
        }

        let initial_text = map.get("text").and_then(Value::as_str).map(str::to_string);
        Ok(ToolResponse::StartWorkflow {
            workflow,
            initial_text,
            initial_message: None,
        })
    }

    async fn openapi_spec(&self, _spec: &ToolSpec) -> Result<Value> {
        Ok(json!({
            "name": self.name(),
            "description": "Run an agent by name. Provide 'name' as the agent name and 'text' \
                            as the agent prompt value.",
            "parameters": {
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string",
                        "description": "Name of the agent to run",
                    },
                    "text": {
                        "type": "string",
                        "description": "Free-form text to pass to an agent.",
                    },
                },
                "required": ["name"],
                "additionalProperties": false,
            },
        }))
    }
}
