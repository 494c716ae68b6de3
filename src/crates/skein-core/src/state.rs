//! Execution state model.
//!
//! Everything a workflow run produces is recorded here: messages, tool
//! calls, steps and node executions, all hanging off one
//! [`WorkflowExecution`]. Ownership is arena style to keep the graph of
//! back references serializable: node executions live in a map keyed by
//! id, every [`Step`] carries the id of its execution, and a
//! [`NodeExecution`] links to its predecessor by id. The flat
//! [`WorkflowExecution::step_order`] list preserves real-time ordering
//! across node executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::ToolSpec;
use crate::model::{OutputMode, Role};

/// Shared, mutable handle to a workflow execution.
///
/// Mutations happen at task boundaries under a short critical section; the
/// runner, manager and UI bridge all hold clones of the same handle.
pub type SharedExecution = Arc<parking_lot::Mutex<WorkflowExecution>>;

pub fn shared(execution: WorkflowExecution) -> SharedExecution {
    Arc::new(parking_lot::Mutex::new(execution))
}

/// Opaque executor or provider state, kept serializable without the runtime
/// knowing its shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpaqueState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
}

/// Runner lifecycle status. The stopped state serializes as `canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Idle,
    Running,
    WaitingInput,
    #[serde(rename = "canceled")]
    Stopped,
    Finished,
}

/// Status of a node or workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    #[serde(rename = "canceled")]
    Stopped,
}

/// Tool call response lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    #[default]
    Created,
    Completed,
    Rejected,
    Failed,
}

/// Tool call request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallReqStatus {
    RequiresConfirmation,
    PendingExecution,
    Executing,
    Rejected,
    Complete,
}

/// The kind of progress a [`Step`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    OutputMessage,
    InputMessage,
    Approval,
    Rejection,
    Prompt,
    PromptConfirm,
    ToolRequest,
    ToolResult,
    WorkflowRequest,
    WorkflowResult,
}

/// Aggregated LLM usage and limits. Used for per-step, per-workflow and
/// project-level accounting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsageStats {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub cost_dollars: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_token_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_token_limit: Option<u64>,
}

impl LlmUsageStats {
    pub fn add(&mut self, other: &LlmUsageStats) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cost_dollars += other.cost_dollars;
    }
}

/// Opaque provider-side state attached to a tool call request (for example
/// thought signatures that must round trip to the provider).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallProviderState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_state: Option<Value>,
}

/// A single tool call request issued by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallReq {
    /// Provider-issued id for this tool call (e.g. `call_...`).
    pub id: String,
    /// Tool call type, currently always `function`.
    #[serde(rename = "type", default = "default_tool_call_type")]
    pub call_type: String,
    pub name: String,
    /// Decoded JSON arguments passed to the function.
    #[serde(default)]
    pub arguments: Value,
    /// Effective [`ToolSpec`] used for this call, if resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_spec: Option<ToolSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolCallReqStatus>,
    /// Set at runtime when this call was auto-approved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approved: Option<bool>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handled_at: Option<DateTime<Utc>>,
    /// Provider-specific state preserved across turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ToolCallProviderState>,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

impl ToolCallReq {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            call_type: default_tool_call_type(),
            name: name.into(),
            arguments,
            tool_spec: None,
            status: None,
            auto_approved: None,
            created_at: Utc::now(),
            handled_at: None,
            state: None,
        }
    }
}

/// A single tool call response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResp {
    /// Matches the id of a preceding [`ToolCallReq`].
    pub id: String,
    #[serde(default)]
    pub status: ToolCallStatus,
    pub name: String,
    /// Decoded JSON result; an object or a list of objects. None until the
    /// call completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ToolCallResp {
    pub fn completed(id: impl Into<String>, name: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            status: ToolCallStatus::Completed,
            name: name.into(),
            result: Some(result),
            created_at: Utc::now(),
        }
    }

    pub fn rejected(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ToolCallStatus::Rejected,
            name: name.into(),
            result: None,
            created_at: Utc::now(),
        }
    }
}

/// A single human-readable message produced by a person, the model or a
/// tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    /// Model reasoning content, not shown as user-visible text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_content: Option<String>,
    #[serde(default)]
    pub tool_call_requests: Vec<ToolCallReq>,
    #[serde(default)]
    pub tool_call_responses: Vec<ToolCallResp>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
            thinking_content: None,
            tool_call_requests: Vec::new(),
            tool_call_responses: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn tool(text: impl Into<String>) -> Self {
        Self::new(Role::Tool, text)
    }

    pub fn with_tool_requests(mut self, requests: Vec<ToolCallReq>) -> Self {
        self.tool_call_requests = requests;
        self
    }

    pub fn with_tool_responses(mut self, responses: Vec<ToolCallResp>) -> Self {
        self.tool_call_responses = responses;
        self
    }
}

/// One concrete invocation of a node within a workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Node name this execution pertains to.
    pub node: String,
    /// Previous execution of the same node, forming a reverse chain used
    /// when assembling historical LLM context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<Uuid>,
    #[serde(default)]
    pub input_messages: Vec<Message>,
    #[serde(default)]
    pub steps: Vec<Step>,
    pub status: RunStatus,
    /// Executor-maintained state snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<OpaqueState>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl NodeExecution {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node: node.into(),
            previous_id: None,
            input_messages: Vec::new(),
            steps: Vec::new(),
            status: RunStatus::Running,
            state: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_input_messages(mut self, messages: Vec<Message>) -> Self {
        self.input_messages = messages;
        self
    }

    pub fn step(&self, id: Uuid) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn final_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.is_final)
    }
}

/// The atomic unit of progress inside a node execution.
///
/// Executors may yield the same step id repeatedly with `is_complete =
/// false` to stream progressive refinements; the last complete step of a
/// run is the one the runner interprets. At most one step per node
/// execution carries `is_final = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Id of the owning [`NodeExecution`].
    pub execution_id: Uuid,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<OpaqueState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_usage: Option<LlmUsageStats>,
    /// Runner status this step implies while pending (e.g. an executor
    /// parked on external input surfaces `waiting_input`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_hint: Option<RunnerStatus>,
    /// True when this step is a final, stable result rather than an
    /// intermediate update.
    #[serde(default = "default_true")]
    pub is_complete: bool,
    /// True for the step that triggered the transition to the next node.
    #[serde(default)]
    pub is_final: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Step {
    pub fn new(execution_id: Uuid, step_type: StepType) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            step_type,
            message: None,
            output_mode: OutputMode::default(),
            outcome_name: None,
            state: None,
            llm_usage: None,
            status_hint: None,
            is_complete: true,
            is_final: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome_name = Some(outcome.into());
        self
    }

    pub fn incomplete(mut self) -> Self {
        self.is_complete = false;
        self
    }

    /// Tool call requests carried by this step's message.
    pub fn tool_call_requests(&self) -> &[ToolCallReq] {
        self.message
            .as_ref()
            .map(|m| m.tool_call_requests.as_slice())
            .unwrap_or(&[])
    }

    /// Tool call response ids carried by this step's message.
    pub fn tool_response_ids(&self) -> Vec<&str> {
        self.message
            .as_ref()
            .map(|m| {
                m.tool_call_responses
                    .iter()
                    .map(|r| r.id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A single workflow execution: the arena owning node executions and the
/// flat, real-time ordered step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub workflow_name: String,
    #[serde(default)]
    pub node_executions: HashMap<Uuid, NodeExecution>,
    /// Step ids in append order across all node executions.
    #[serde(default)]
    pub step_order: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_usage: Option<LlmUsageStats>,
    /// Usage of the most recent usage-bearing step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step_llm_usage: Option<LlmUsageStats>,
    /// Stamped whenever an input_message step is appended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_user_input_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(workflow_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_name: workflow_name.into(),
            node_executions: HashMap::new(),
            step_order: Vec::new(),
            llm_usage: None,
            last_step_llm_usage: None,
            last_user_input_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Refresh `updated_at`; monotonic, never moves backward.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    pub fn insert_node_execution(&mut self, execution: NodeExecution) {
        self.node_executions.insert(execution.id, execution);
        self.touch();
    }

    pub fn node_execution(&self, id: Uuid) -> Option<&NodeExecution> {
        self.node_executions.get(&id)
    }

    pub fn node_execution_mut(&mut self, id: Uuid) -> Option<&mut NodeExecution> {
        self.node_executions.get_mut(&id)
    }

    /// Resolve a step by id through the flat ordering.
    pub fn step(&self, id: Uuid) -> Option<&Step> {
        self.node_executions
            .values()
            .find_map(|ne| ne.steps.iter().find(|s| s.id == id))
    }

    /// The most recently appended step, if any.
    pub fn last_step(&self) -> Option<&Step> {
        self.step_order.last().and_then(|id| self.step(*id))
    }

    /// All steps in real-time order.
    pub fn steps(&self) -> Vec<&Step> {
        self.step_order.iter().filter_map(|id| self.step(*id)).collect()
    }

    /// Insert or update a step.
    ///
    /// A step whose id already exists in its node execution is replaced in
    /// place and keeps its position in the flat ordering; otherwise it is
    /// appended to both lists. New usage on a step is aggregated into the
    /// workflow totals exactly once.
    pub fn upsert_step(&mut self, step: Step) {
        let had_usage_before = self
            .step(step.id)
            .map(|s| s.llm_usage.is_some())
            .unwrap_or(false);
        if step.llm_usage.is_some() && !had_usage_before {
            let usage = step.llm_usage.clone().unwrap();
            self.llm_usage.get_or_insert_with(Default::default).add(&usage);
            self.last_step_llm_usage = Some(usage);
        }
        if step.step_type == StepType::InputMessage {
            self.last_user_input_at = Some(Utc::now());
        }

        let Some(execution) = self.node_executions.get_mut(&step.execution_id) else {
            return;
        };
        if let Some(existing) = execution.steps.iter_mut().find(|s| s.id == step.id) {
            *existing = step;
        } else {
            self.step_order.push(step.id);
            execution.steps.push(step);
        }
        self.touch();
    }

    pub fn delete_step(&mut self, step_id: Uuid) {
        self.delete_steps(&[step_id]);
    }

    /// Delete steps from both the flat list and their node executions.
    pub fn delete_steps(&mut self, step_ids: &[Uuid]) {
        if step_ids.is_empty() {
            return;
        }
        let ids: std::collections::HashSet<Uuid> = step_ids.iter().copied().collect();
        self.step_order.retain(|id| !ids.contains(id));
        for execution in self.node_executions.values_mut() {
            execution.steps.retain(|s| !ids.contains(&s.id));
        }
        self.touch();
    }

    pub fn delete_node_execution(&mut self, execution_id: Uuid) {
        let Some(execution) = self.node_executions.get(&execution_id) else {
            return;
        };
        let step_ids: Vec<Uuid> = execution.steps.iter().map(|s| s.id).collect();
        self.delete_steps(&step_ids);
        self.node_executions.remove(&execution_id);
        self.touch();
    }

    /// Drop node executions that no longer carry any steps.
    pub fn trim_empty_node_executions(&mut self) {
        let empty: Vec<Uuid> = self
            .node_executions
            .values()
            .filter(|ne| ne.steps.is_empty())
            .map(|ne| ne.id)
            .collect();
        for id in empty {
            self.delete_node_execution(id);
        }
    }

    /// The most recent execution of the given node, by creation time.
    pub fn latest_execution_of(&self, node: &str) -> Option<&NodeExecution> {
        self.node_executions
            .values()
            .filter(|ne| ne.node == node)
            .max_by_key(|ne| ne.created_at)
    }
}
