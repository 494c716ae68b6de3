//! Patch application tool.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::ToolSpec;
use crate::error::{CoreError, Result};
use crate::project::{FileChange, FileChangeKind, ProjectContext};
use crate::tools::{Tool, ToolReq, ToolResponse};

/// Apply a repository patch to the project filesystem under the base path.
///
/// The patch format comes from the tool config (`config.format`), defaults
/// to `v4a`. Returns a human-readable summary of changes or errors.
pub struct ApplyPatchTool {
    project: Arc<dyn ProjectContext>,
}

impl ApplyPatchTool {
    pub fn new(project: Arc<dyn ProjectContext>) -> Self {
        Self { project }
    }
}

pub fn changes_to_file_changes(
    changes: &std::collections::BTreeMap<String, skein_patch::ChangeKind>,
) -> Vec<FileChange> {
    changes
        .iter()
        .map(|(rel, kind)| FileChange {
            kind: match kind {
                skein_patch::ChangeKind::Created => FileChangeKind::Created,
                skein_patch::ChangeKind::Updated => FileChangeKind::Updated,
                skein_patch::ChangeKind::Deleted => FileChangeKind::Deleted,
            },
            relative_filename: rel.clone(),
        })
        .collect()
}

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    async fn run(&self, req: ToolReq, args: Value) -> Result<ToolResponse> {
        let text = match &args {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default(),
            _ => String::new(),
        };
        if text.trim().is_empty() {
            return Err(CoreError::Tool(
                "apply_patch requires 'text' (patch content)".into(),
            ));
        }

        let fmt = req
            .spec
            .config
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or("v4a")
            .to_ascii_lowercase();
        if !skein_patch::supported_formats().contains(&fmt.as_str()) {
            let supported = skein_patch::supported_formats().join(", ");
            return Ok(ToolResponse::text(format!(
                "Unsupported patch format: {fmt}. Supported formats: {supported}"
            )));
        }

        match skein_patch::apply_patch(&fmt, &text, self.project.base_path()) {
            Ok(outcome) => {
                let changed = changes_to_file_changes(&outcome.changes);
                if !changed.is_empty() {
                    self.project.schedule_refresh(changed);
                }
                Ok(ToolResponse::text(outcome.summary))
            }
            Err(e) => Ok(ToolResponse::text(format!("Error applying patch: {e}"))),
        }
    }

    async fn openapi_spec(&self, _spec: &ToolSpec) -> Result<Value> {
        let fmts = skein_patch::supported_formats().join("/");
        Ok(json!({
            "name": self.name(),
            "description": format!(
                "Apply a repository patch to the current project. Patch format is configured \
                 in this tool's config (format={fmts}). Returns a human-readable summary of \
                 changes or errors."
            ),
            "parameters": {
                "type": "object",
                "properties": {
                    "text": {
                        "type": "string",
                        "description": "Patch content to apply.",
                    },
                },
                "required": ["text"],
                "additionalProperties": false,
            },
        }))
    }
}
