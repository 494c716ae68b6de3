//! Shell command tool.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::{ToolSpec, EXEC_TOOL_TIMEOUT_S_DEFAULT};
use crate::error::{CoreError, Result};
use crate::project::ProjectContext;
use crate::tools::{Tool, ToolReq, ToolResponse};

/// Execute a command via the project's shell manager.
///
/// Collects combined stdout/stderr, enforces a per-call timeout and
/// returns a JSON payload `{output, exit_code, timed_out}`.
pub struct ExecTool {
    project: Arc<dyn ProjectContext>,
}

impl ExecTool {
    pub fn new(project: Arc<dyn ProjectContext>) -> Self {
        Self { project }
    }

    fn max_output_chars(&self, spec: &ToolSpec) -> usize {
        if let Some(n) = spec.config.get("max_output_chars").and_then(Value::as_u64) {
            if n > 0 {
                return n as usize;
            }
        }
        self.project.settings().exec_tool_settings().max_output_chars
    }

    fn timeout_s(&self, spec: &ToolSpec) -> f64 {
        if let Some(t) = spec.config.get("timeout_s").and_then(Value::as_f64) {
            return t;
        }
        self.project
            .settings()
            .exec_tool_settings()
            .timeout_s
            .unwrap_or(EXEC_TOOL_TIMEOUT_S_DEFAULT)
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    async fn run(&self, req: ToolReq, args: Value) -> Result<ToolResponse> {
        let shells = self
            .project
            .shells()
            .ok_or_else(|| CoreError::Tool("exec tool requires a shell manager".into()))?;

        let command = match &args {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("command")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| CoreError::Tool("exec tool requires 'command' (string)".into()))?,
            _ => return Err(CoreError::Tool("exec tool requires 'command' (string)".into())),
        };

        let timeout = self.timeout_s(&req.spec);
        let handle = shells.run(&command, Some(timeout)).await?;

        let mut stdout = handle.stdout();
        let mut stderr = handle.stderr();
        let stdout_task = tokio::spawn(async move {
            let mut out = String::new();
            while let Some(line) = stdout.next().await {
                out.push_str(&line);
            }
            out
        });
        let stderr_task = tokio::spawn(async move {
            let mut out = String::new();
            while let Some(line) = stderr.next().await {
                out.push_str(&line);
            }
            out
        });

        let exit = handle.wait().await;
        let mut output = stdout_task.await.unwrap_or_default();
        output.push_str(&stderr_task.await.unwrap_or_default());

        let max_chars = self.max_output_chars(&req.spec);
        if output.len() > max_chars {
            let mut cut = max_chars;
            while cut > 0 && !output.is_char_boundary(cut) {
                cut -= 1;
            }
            output.truncate(cut);
        }

        let payload = json!({
            "output": output,
            "exit_code": exit.code,
            "timed_out": exit.timed_out,
        });
        Ok(ToolResponse::text(payload.to_string()))
    }

    async fn openapi_spec(&self, _spec: &ToolSpec) -> Result<Value> {
        Ok(json!({
            "name": self.name(),
            "description": format!(
                "Execute a shell command and return combined stdout/stderr, exit code, and \
                 timeout status. Timeout is configurable via tool config (timeout_s) and \
                 defaults to {EXEC_TOOL_TIMEOUT_S_DEFAULT} seconds. Output is truncated to ~10KB."
            ),
            "parameters": {
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "Command to run (executed via system shell).",
                    },
                },
                "required": ["command"],
                "additionalProperties": false,
            },
        }))
    }
}
