//! User input executor.
//!
//! Emits a `prompt` step requesting input. The runner appends the reply as
//! an `input_message` step and re-runs the executor, which then completes
//! with an `output_message` echoing the reply.

use async_stream::try_stream;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::Result;
use crate::executor::{Executor, ExecutorInput, StepStream};
use crate::model::Node;
use crate::project::ProjectContext;
use crate::state::{Message, Step, StepType};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct InputParams {
    /// Prompt text shown to the user.
    #[serde(default)]
    pub message: Option<String>,
}

pub struct InputExecutor {
    params: InputParams,
}

impl InputExecutor {
    pub fn new(node: &Node, _project: Arc<dyn ProjectContext>) -> Result<Self> {
        Ok(Self {
            params: node.typed_params()?,
        })
    }
}

impl Executor for InputExecutor {
    fn run(&self, input: ExecutorInput) -> StepStream {
        let prompt_text = self
            .params
            .message
            .clone()
            .unwrap_or_else(|| "Provide input".to_string());
        Box::pin(try_stream! {
            let execution = input.execution;
            let last_input = execution
                .steps
                .iter()
                .rev()
                .find(|s| s.step_type == StepType::InputMessage && s.is_complete)
                .and_then(|s| s.message.clone());

            match last_input {
                Some(reply) => {
                    let step = Step::new(execution.id, StepType::OutputMessage)
                        .with_message(Message::assistant(reply.text));
                    yield step;
                }
                None => {
                    let step = Step::new(execution.id, StepType::Prompt)
                        .with_message(Message::assistant(prompt_text));
                    yield step;
                }
            }
        })
    }
}
