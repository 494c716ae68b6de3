//! Patch application executor.
//!
//! Takes the last input message's text, runs it through the patch engine
//! with the configured format and yields one terminal step whose outcome
//! is `success` or `fail` and whose text is the engine's summary. Changed
//! paths are handed to the project for a background refresh.

use async_stream::try_stream;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::executor::{Executor, ExecutorInput, StepStream};
use crate::model::{Node, StateResetPolicy};
use crate::project::ProjectContext;
use crate::state::{Message, Step, StepType};
use crate::tools::apply_patch_changes_to_file_changes;

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyPatchParams {
    /// Patch format identifier (`v4a` or `patch`).
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_format() -> String {
    "v4a".to_string()
}

pub struct ApplyPatchExecutor {
    params: ApplyPatchParams,
    project: Arc<dyn ProjectContext>,
}

impl std::fmt::Debug for ApplyPatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyPatchExecutor")
            .field("params", &self.params)
            .finish()
    }
}

impl ApplyPatchExecutor {
    pub fn new(node: &Node, project: Arc<dyn ProjectContext>) -> Result<Self> {
        if node.reset_policy != StateResetPolicy::Reset {
            return Err(CoreError::Configuration(format!(
                "apply_patch node '{}': reset_policy must be 'reset'",
                node.name
            )));
        }
        Ok(Self {
            params: node.typed_params()?,
            project,
        })
    }
}

fn terminal_step(execution_id: uuid::Uuid, text: String, outcome: &str) -> Step {
    let mut step =
        Step::new(execution_id, StepType::OutputMessage).with_message(Message::assistant(text));
    step.outcome_name = Some(outcome.to_string());
    step.is_final = true;
    step
}

impl Executor for ApplyPatchExecutor {
    fn run(&self, input: ExecutorInput) -> StepStream {
        let fmt = self.params.format.to_ascii_lowercase();
        let project = self.project.clone();
        Box::pin(try_stream! {
            let execution_id = input.execution.id;

            if !skein_patch::supported_formats().contains(&fmt.as_str()) {
                let supported = skein_patch::supported_formats().join(", ");
                yield terminal_step(
                    execution_id,
                    format!("Unsupported patch format: {fmt}. Supported formats: {supported}"),
                    "fail",
                );
                return;
            }

            let source_text = input
                .execution
                .input_messages
                .last()
                .map(|m| m.text.clone())
                .unwrap_or_default();
            if source_text.trim().is_empty() {
                yield terminal_step(
                    execution_id,
                    "No patch was provided. The patch application has failed.".to_string(),
                    "fail",
                );
                return;
            }

            match skein_patch::apply_patch(&fmt, &source_text, project.base_path()) {
                Ok(outcome) => {
                    let changed = apply_patch_changes_to_file_changes(&outcome.changes);
                    if !changed.is_empty() {
                        project.schedule_refresh(changed);
                    }
                    yield terminal_step(execution_id, outcome.summary, outcome.outcome);
                }
                Err(e) => {
                    yield terminal_step(execution_id, format!("Error applying patch: {e}"), "fail");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use crate::state::{shared, NodeExecution, WorkflowExecution};
    use crate::testing::StubProject;

    fn patch_node() -> Node {
        Node::new("patcher", "apply_patch")
    }

    async fn run_with_input(project: Arc<StubProject>, text: Option<&str>) -> Step {
        let executor = ApplyPatchExecutor::new(&patch_node(), project).unwrap();
        let mut run = WorkflowExecution::new("wf");
        let mut ne = NodeExecution::new("patcher");
        if let Some(text) = text {
            ne.input_messages = vec![Message::user(text)];
        }
        let execution = ne.clone();
        run.insert_node_execution(ne);
        let input = ExecutorInput {
            execution,
            run: shared(run),
        };
        let mut stream = executor.run(input);
        let mut last = None;
        while let Some(item) = stream.next().await {
            last = Some(item.unwrap());
        }
        last.unwrap()
    }

    #[test]
    fn keep_reset_policy_is_rejected() {
        let mut node = patch_node();
        node.reset_policy = StateResetPolicy::Keep;
        let err = ApplyPatchExecutor::new(&node, Arc::new(StubProject::new())).unwrap_err();
        assert!(err.to_string().contains("reset_policy"));
    }

    #[tokio::test]
    async fn missing_patch_text_fails() {
        let step = run_with_input(Arc::new(StubProject::new()), None).await;
        assert_eq!(step.outcome_name.as_deref(), Some("fail"));
        assert!(step.is_final);
        assert!(step
            .message
            .as_ref()
            .unwrap()
            .text
            .contains("No patch was provided"));
    }

    #[tokio::test]
    async fn applies_patch_against_base_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "pre\n old\npost\n").unwrap();
        let mut project = StubProject::new();
        project.set_base_path(dir.path().to_path_buf());
        let project = Arc::new(project);

        let patch = [
            "*** Begin Patch",
            "*** Update File: f.txt",
            " pre",
            "- old",
            "+ new",
            " post",
            "*** End Patch",
        ]
        .join("\n");
        let step = run_with_input(project, Some(&patch)).await;

        assert_eq!(step.outcome_name.as_deref(), Some("success"));
        assert!(step
            .message
            .as_ref()
            .unwrap()
            .text
            .starts_with("Applied patch successfully"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "pre\n new\npost\n"
        );
    }
}
