//! LLM chat executor.
//!
//! Builds an OpenAI-style conversation from the execution's message chain,
//! requests a streaming completion and yields an incremental assistant
//! step per content delta. On completion it assembles tool call requests,
//! extracts the outcome selection (trailing `OUTCOME: <name>` tag or the
//! synthetic `__choose_outcome__` tool, depending on the node strategy)
//! and records usage on the final step. Retriable provider errors are
//! retried up to three times with exponential backoff; on exhaustion the
//! node terminates with a rejection step and a fail outcome.

use async_stream::try_stream;
use futures::StreamExt;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::ToolSpec;
use crate::error::{CoreError, Result};
use crate::executor::{iter_execution_messages, Executor, ExecutorInput, StepStream};
use crate::llm::{accumulate, ChatChunk, ChatMessage, ChatRequest, ChatToolCall, LlmError};
use crate::model::{Node, OutcomeSlot, OutcomeStrategy, PreprocessorSpec, Role};
use crate::project::ProjectContext;
use crate::state::{LlmUsageStats, Message, Step, StepType, ToolCallProviderState, ToolCallReq};
use crate::tools::build_effective_tool_specs;

use super::preprocessors::PreprocessorRegistry;

/// Name of the synthetic outcome-selection tool.
pub const CHOOSE_OUTCOME_TOOL_NAME: &str = "__choose_outcome__";

const MAX_RETRIES: u32 = 3;

/// Step types whose messages feed the LLM conversation.
const INCLUDED_STEP_TYPES: [StepType; 4] = [
    StepType::OutputMessage,
    StepType::InputMessage,
    StepType::ToolResult,
    StepType::WorkflowResult,
];

fn outcome_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*OUTCOME\s*:\s*([A-Za-z0-9_\-]+)\s*$").unwrap())
}

fn outcome_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*OUTCOME\s*:\s*").unwrap())
}

/// Find the last valid `OUTCOME: <name>` line in the response text.
pub fn parse_outcome_from_text(text: &str, valid: &[String]) -> Option<String> {
    for line in text.lines().rev() {
        if let Some(caps) = outcome_tag_re().captures(line.trim()) {
            let cand = caps[1].to_string();
            if valid.contains(&cand) {
                return Some(cand);
            }
        }
    }
    None
}

/// Remove every `OUTCOME:` line from the response text.
pub fn strip_outcome_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !outcome_prefix_re().is_match(line.trim()))
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

fn outcome_desc_bullets(outcomes: &[OutcomeSlot]) -> String {
    outcomes
        .iter()
        .map(|s| {
            format!("- {}: {}", s.name, s.description.as_deref().unwrap_or(""))
                .trim_end()
                .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_tag_system_instruction(names: &[String], bullets: &str) -> String {
    format!(
        "Consider the available outcomes and pick the best fit based on the conversation:\n\
         {bullets}\n\nAfter producing your final answer, append a last line exactly as:\n\
         OUTCOME: <one of {names:?}>\nOnly output the outcome name on that line and nothing else."
    )
}

fn build_choose_outcome_tool(names: &[String], bullets: &str) -> Value {
    let choice_desc = if bullets.trim().is_empty() {
        "Choose the appropriate outcome.".to_string()
    } else {
        format!("Choose exactly one of the following outcomes:\n{bullets}")
    };
    json!({
        "type": "function",
        "function": {
            "name": CHOOSE_OUTCOME_TOOL_NAME,
            "description": format!(
                "Selects the conversation outcome to take next. Available outcomes:\n{bullets}"
            ),
            "parameters": {
                "type": "object",
                "properties": {
                    "outcome": {
                        "type": "string",
                        "enum": names,
                        "description": choice_desc,
                    }
                },
                "required": ["outcome"],
            },
        },
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmParams {
    pub model: String,
    #[serde(default)]
    pub system: Option<String>,
    /// Appended to the system prompt before preprocessors run.
    #[serde(default)]
    pub system_append: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub outcome_strategy: OutcomeStrategy,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub extra: serde_json::Map<String, Value>,
    #[serde(default)]
    pub preprocessors: Vec<PreprocessorSpec>,
    /// Maximum LLM rounds for this node before failing; 0 = unlimited.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
}

fn default_max_rounds() -> u32 {
    32
}

pub struct LlmExecutor {
    node_name: String,
    outcomes: Vec<OutcomeSlot>,
    params: LlmParams,
    project: Arc<dyn ProjectContext>,
    preprocessors: PreprocessorRegistry,
}

impl LlmExecutor {
    pub fn new(node: &Node, project: Arc<dyn ProjectContext>) -> Result<Self> {
        Ok(Self {
            node_name: node.name.clone(),
            outcomes: node.outcomes.clone(),
            params: node.typed_params()?,
            project,
            preprocessors: PreprocessorRegistry::new(),
        })
    }

    pub fn with_preprocessors(mut self, registry: PreprocessorRegistry) -> Self {
        self.preprocessors = registry;
        self
    }

    fn outcome_names(&self) -> Vec<String> {
        self.outcomes.iter().map(|s| s.name.clone()).collect()
    }

    /// Generate the OpenAI-compatible conversation from execution state.
    ///
    /// Walks the `previous` chain oldest first, keeps only conversational
    /// step types, optionally prepends the synthetic system message and
    /// runs configured preprocessors over the collected messages before
    /// serialization.
    pub fn build_messages(&self, input: &ExecutorInput) -> Vec<ChatMessage> {
        let cfg = &self.params;
        let outcome_names = self.outcome_names();

        let mut collected: Vec<Message> = Vec::new();
        let mut step_types: HashMap<uuid::Uuid, Option<StepType>> = HashMap::new();

        let mut system_parts: Vec<String> = Vec::new();
        if let Some(system) = &cfg.system {
            system_parts.push(system.clone());
        }
        if let Some(append) = &cfg.system_append {
            system_parts.push(append.clone());
        }
        if outcome_names.len() > 1 && cfg.outcome_strategy == OutcomeStrategy::Tag {
            let bullets = outcome_desc_bullets(&self.outcomes);
            system_parts.push(build_tag_system_instruction(&outcome_names, &bullets));
        }
        if !system_parts.is_empty() {
            let text = system_parts.join("\n\n").trim().to_string();
            if !text.is_empty() {
                let message = Message::new(Role::System, text);
                step_types.insert(message.id, None);
                collected.push(message);
            }
        }

        {
            let run = input.run.lock();
            for (message, step_type) in iter_execution_messages(&run, input.execution.id) {
                if let Some(st) = step_type {
                    if !INCLUDED_STEP_TYPES.contains(&st) {
                        continue;
                    }
                }
                step_types.insert(message.id, step_type);
                collected.push(message);
            }
        }

        let processed = if cfg.preprocessors.is_empty() {
            collected
        } else {
            self.preprocessors
                .apply(&cfg.preprocessors, self.project.as_ref(), collected)
        };

        let mut serialized: Vec<ChatMessage> = Vec::new();
        for message in &processed {
            let step_type = step_types.get(&message.id).copied().flatten();
            if matches!(
                step_type,
                Some(StepType::ToolResult) | Some(StepType::WorkflowResult)
            ) {
                for resp in &message.tool_call_responses {
                    serialized.push(tool_response_message(resp));
                }
                continue;
            }

            let mut chat = ChatMessage::new(message.role.as_str(), message.text.clone());
            for req in &message.tool_call_requests {
                chat.tool_calls.push(ChatToolCall {
                    id: req.id.clone(),
                    call_type: req.call_type.clone(),
                    name: req.name.clone(),
                    arguments: serde_json::to_string(&req.arguments)
                        .unwrap_or_else(|_| "{}".to_string()),
                    provider_fields: req.state.as_ref().and_then(|s| s.provider_state.clone()),
                });
            }
            serialized.push(chat);

            for resp in &message.tool_call_responses {
                serialized.push(tool_response_message(resp));
            }
        }

        serialized
    }

    fn fail_outcome(&self) -> Option<String> {
        self.outcomes
            .iter()
            .find(|s| s.name == "fail")
            .map(|s| s.name.clone())
    }
}

fn tool_response_message(resp: &crate::state::ToolCallResp) -> ChatMessage {
    let content = resp
        .result
        .as_ref()
        .map(|r| serde_json::to_string(r).unwrap_or_default())
        .unwrap_or_default();
    let mut chat = ChatMessage::new("tool", content);
    chat.tool_call_id = Some(resp.id.clone());
    chat.name = Some(resp.name.clone());
    chat
}

fn rejection_step(base: &Step, text: String, outcome: Option<String>) -> Step {
    let mut step = base.clone();
    step.step_type = StepType::Rejection;
    step.message = Some(Message::system(text));
    step.outcome_name = outcome;
    step.is_complete = true;
    step
}

impl Executor for LlmExecutor {
    fn run(&self, input: ExecutorInput) -> StepStream {
        let cfg = self.params.clone();
        let node_name = self.node_name.clone();
        let outcomes = self.outcomes.clone();
        let outcome_names = self.outcome_names();
        let project = self.project.clone();
        let conversation = self.build_messages(&input);
        let fail_outcome = self.fail_outcome();
        let effective_specs = build_effective_tool_specs(project.as_ref(), &cfg.tools);
        let usage_limit = cfg.extra.get("model_max_tokens").and_then(Value::as_u64);

        // Tool schemas are collected lazily inside the stream so the
        // executor itself stays borrow-free.
        let executor = Arc::new(LlmRunState {
            cfg,
            node_name,
            outcomes,
            outcome_names,
            project,
            fail_outcome,
            usage_limit,
        });

        Box::pin(try_stream! {
            let st = executor;
            let client = st.project.chat_client().ok_or_else(|| CoreError::Executor {
                node: st.node_name.clone(),
                error: "no chat client configured".into(),
            })?;

            let step = Step::new(input.execution.id, StepType::OutputMessage);

            // Enforce the round budget before issuing another request.
            if st.cfg.max_rounds > 0 {
                let rounds = input
                    .execution
                    .steps
                    .iter()
                    .filter(|s| s.step_type == StepType::OutputMessage && s.is_complete)
                    .count() as u32;
                if rounds >= st.cfg.max_rounds {
                    yield rejection_step(
                        &step,
                        format!("LLM node exceeded max_rounds ({})", st.cfg.max_rounds),
                        st.fail_outcome.clone(),
                    );
                    return;
                }
            }

            let mut tools = st.collect_tools(&effective_specs).await;
            if st.outcome_names.len() > 1 && st.cfg.outcome_strategy == OutcomeStrategy::Function {
                let bullets = outcome_desc_bullets(&st.outcomes);
                tools.push(build_choose_outcome_tool(&st.outcome_names, &bullets));
            }

            let request = ChatRequest {
                model: st.cfg.model.clone(),
                messages: conversation,
                temperature: st.cfg.temperature,
                max_tokens: st.cfg.max_tokens,
                reasoning_effort: st.cfg.reasoning_effort.clone(),
                tools,
                extra: st.cfg.extra.clone(),
            };

            tracing::debug!(node = %st.node_name, model = %st.cfg.model, "llm request");

            let mut attempt: u32 = 0;
            let chunks: Vec<ChatChunk> = 'attempts: loop {
                let mut failure: Option<LlmError> = None;
                match client.stream_chat(request.clone()).await {
                    Ok(mut stream) => {
                        let mut collected: Vec<ChatChunk> = Vec::new();
                        let mut partial = String::new();
                        while let Some(item) = stream.next().await {
                            match item {
                                Ok(chunk) => {
                                    if let Some(delta) = &chunk.content_delta {
                                        if !delta.is_empty() {
                                            partial.push_str(delta);
                                            let mut update = step.clone();
                                            update.message =
                                                Some(Message::assistant(partial.clone()));
                                            update.is_complete = false;
                                            yield update;
                                        }
                                    }
                                    collected.push(chunk);
                                }
                                Err(e) => {
                                    failure = Some(e);
                                    break;
                                }
                            }
                        }
                        if failure.is_none() {
                            break 'attempts collected;
                        }
                    }
                    Err(e) => failure = Some(e),
                }

                let e = failure.expect("failure set on this path");
                if e.is_retriable() && attempt < MAX_RETRIES {
                    attempt += 1;
                    tracing::warn!(
                        node = %st.node_name,
                        attempt,
                        error = %e,
                        "llm request failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(
                        (500.0 * 2f64.powi(attempt as i32 - 1)) as u64,
                    ))
                    .await;
                    continue 'attempts;
                }

                tracing::error!(node = %st.node_name, error = %e, "llm request failed");
                yield rejection_step(&step, format!("LLM error: {e}"), st.fail_outcome.clone());
                return;
            };

            let completion = accumulate(&chunks);
            let mut assistant_text = completion.text.clone();
            let mut outcome_name: Option<String> = None;

            if st.outcome_names.len() > 1 && st.cfg.outcome_strategy == OutcomeStrategy::Tag {
                if let Some(parsed) = parse_outcome_from_text(&assistant_text, &st.outcome_names) {
                    outcome_name = Some(parsed);
                    assistant_text = strip_outcome_lines(&assistant_text);
                }
            }

            let mut tool_call_reqs: Vec<ToolCallReq> = Vec::new();
            for call in &completion.tool_calls {
                let arguments: Value =
                    serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                if st.outcome_names.len() > 1
                    && st.cfg.outcome_strategy == OutcomeStrategy::Function
                    && call.name == CHOOSE_OUTCOME_TOOL_NAME
                {
                    if let Some(cand) = arguments.get("outcome").and_then(Value::as_str) {
                        if st.outcome_names.iter().any(|n| n == cand) {
                            outcome_name = Some(cand.to_string());
                        }
                    }
                    continue;
                }

                let mut req = ToolCallReq::new(call.id.clone(), call.name.clone(), arguments);
                req.call_type = call.call_type.clone();
                req.tool_spec = effective_specs.get(&call.name).cloned();
                if let Some(fields) = &call.provider_fields {
                    req.state = Some(ToolCallProviderState {
                        provider_state: Some(fields.clone()),
                    });
                }
                tool_call_reqs.push(req);
            }

            let usage = st.usage(&completion);
            let final_outcome = if st.outcome_names.len() > 1 { outcome_name } else { None };

            let mut message = Message::assistant(assistant_text);
            message.thinking_content = completion.thinking.clone();
            message.tool_call_requests = tool_call_reqs;

            let mut final_step = step;
            final_step.message = Some(message);
            final_step.llm_usage = Some(usage);
            final_step.outcome_name = final_outcome;
            final_step.is_complete = true;
            yield final_step;
        })
    }
}

/// Everything the stream needs once detached from the executor borrow.
struct LlmRunState {
    cfg: LlmParams,
    node_name: String,
    outcomes: Vec<OutcomeSlot>,
    outcome_names: Vec<String>,
    project: Arc<dyn ProjectContext>,
    fail_outcome: Option<String>,
    usage_limit: Option<u64>,
}

impl LlmRunState {
    async fn collect_tools(&self, effective: &HashMap<String, ToolSpec>) -> Vec<Value> {
        let mut tools: Vec<Value> = Vec::new();
        for spec in &self.cfg.tools {
            let Some(eff) = effective.get(&spec.name) else {
                continue;
            };
            if !eff.enabled {
                continue;
            }
            let Some(tool) = self.project.tool(&spec.name) else {
                continue;
            };
            if let Ok(schema) = tool.openapi_spec(eff).await {
                tools.push(json!({"type": "function", "function": schema}));
            }
        }
        tools
    }

    fn usage(&self, completion: &crate::llm::ChatCompletion) -> LlmUsageStats {
        match &completion.usage {
            Some(u) => LlmUsageStats {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                cost_dollars: u.cost_dollars,
                input_token_limit: self.usage_limit,
                output_token_limit: None,
            },
            None => LlmUsageStats {
                input_token_limit: self.usage_limit,
                ..Default::default()
            },
        }
    }
}
