//! Shell command executor.
//!
//! Spawns a command through the shell manager and streams combined
//! stdout/stderr into one incrementally updated output step, capped at the
//! configured character count. On completion the step is tagged with
//! `success`/`fail` when `expected_return_code` is set, or with the single
//! declared outcome otherwise.

use async_stream::try_stream;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::executor::{Executor, ExecutorInput, StepStream};
use crate::model::Node;
use crate::project::ProjectContext;
use crate::state::{Message, Step, StepType};

#[derive(Debug, Clone, Deserialize)]
pub struct ExecParams {
    pub command: String,
    #[serde(default)]
    pub timeout_s: Option<f64>,
    #[serde(default)]
    pub expected_return_code: Option<i32>,
    /// Optional header line shown above the command output.
    #[serde(default)]
    pub message: Option<String>,
}

pub struct ExecExecutor {
    params: ExecParams,
    outcomes: Vec<String>,
    project: Arc<dyn ProjectContext>,
}

impl std::fmt::Debug for ExecExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecExecutor")
            .field("params", &self.params)
            .field("outcomes", &self.outcomes)
            .finish()
    }
}

impl ExecExecutor {
    pub fn new(node: &Node, project: Arc<dyn ProjectContext>) -> Result<Self> {
        let params: ExecParams = node.typed_params()?;
        let outcome_names: Vec<String> = node.outcomes.iter().map(|o| o.name.clone()).collect();

        // Outcome shape is validated against expected_return_code up front
        // so misconfigured nodes fail at load time.
        match params.expected_return_code {
            None => {
                if outcome_names.len() > 1 {
                    return Err(CoreError::Configuration(format!(
                        "exec node '{}': when 'expected_return_code' is not provided, at most \
                         one outcome is allowed",
                        node.name
                    )));
                }
            }
            Some(_) => {
                let mut names = outcome_names.clone();
                names.sort();
                if names != ["fail", "success"] {
                    return Err(CoreError::Configuration(format!(
                        "exec node '{}': when 'expected_return_code' is provided, outcomes must \
                         be exactly {{'success', 'fail'}}",
                        node.name
                    )));
                }
            }
        }

        Ok(Self {
            params,
            outcomes: outcome_names,
            project,
        })
    }
}

impl Executor for ExecExecutor {
    fn run(&self, input: ExecutorInput) -> StepStream {
        let params = self.params.clone();
        let outcomes = self.outcomes.clone();
        let project = self.project.clone();
        Box::pin(try_stream! {
            let shells = project
                .shells()
                .ok_or_else(|| CoreError::Shell("exec executor requires a shell manager".into()))?;

            let handle = shells.run(&params.command, params.timeout_s).await?;

            let mut header_parts: Vec<String> = Vec::new();
            if let Some(message) = &params.message {
                header_parts.push(message.clone());
            }
            header_parts.push(format!("> {}", params.command));
            let mut output = header_parts.join("\n");
            output.push('\n');

            let max_chars = project.settings().exec_tool_settings().max_output_chars;

            let mut step = Step::new(input.execution.id, StepType::OutputMessage)
                .with_message(Message::assistant(output.clone()))
                .incomplete();
            yield step.clone();

            // Combined stdout/stderr, streamed as it arrives. The merged
            // stream ends when the command finishes and both pipes drain.
            let mut merged = futures::stream::select(handle.stdout(), handle.stderr());
            while let Some(chunk) = merged.next().await {
                if output.len() < max_chars {
                    let remaining = max_chars - output.len();
                    let mut take = chunk;
                    if take.len() > remaining {
                        let mut cut = remaining;
                        while cut > 0 && !take.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        take.truncate(cut);
                    }
                    output.push_str(&take);
                }
                if let Some(message) = step.message.as_mut() {
                    message.text = output.clone();
                }
                yield step.clone();
            }

            let exit = handle.wait().await;

            let outcome_name = match params.expected_return_code {
                Some(expected) => {
                    if !exit.timed_out && exit.code == Some(expected) {
                        Some("success".to_string())
                    } else {
                        Some("fail".to_string())
                    }
                }
                None => outcomes.first().cloned(),
            };

            if let Some(message) = step.message.as_mut() {
                message.text = output.trim_end_matches('\n').to_string();
            }
            step.is_complete = true;
            step.outcome_name = outcome_name;
            yield step;
        })
    }
}
