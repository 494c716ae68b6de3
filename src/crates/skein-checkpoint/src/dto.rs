//! On-disk DTO for workflow executions.
//!
//! Mirrors the in-memory state model with all cross references expressed
//! as ids: node executions are keyed by id, every step carries its
//! execution id, and the flat step list preserves the real-time ordering.
//! Enum values serialize as their string representations and opaque
//! executor state travels as a `{model, data}` envelope, both for upgrade
//! tolerance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use skein_core::state::{
    LlmUsageStats, Message, NodeExecution, OpaqueState, RunStatus, Step, StepType,
    WorkflowExecution,
};
use skein_core::OutputMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionDto {
    pub id: Uuid,
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<Uuid>,
    #[serde(default)]
    pub input_messages: Vec<Message>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<OpaqueState>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDto {
    pub id: Uuid,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_hint: Option<skein_core::state::RunnerStatus>,
    pub is_complete: bool,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionDto {
    pub id: Uuid,
    pub workflow_name: String,
    #[serde(default)]
    pub node_executions: HashMap<Uuid, NodeExecutionDto>,
    /// Flat step list in real-time order across node executions.
    #[serde(default)]
    pub steps: Vec<StepDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_usage: Option<LlmUsageStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step_llm_usage: Option<LlmUsageStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_user_input_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Flatten an execution into its DTO.
pub fn to_dto(execution: &WorkflowExecution) -> WorkflowExecutionDto {
    let node_executions = execution
        .node_executions
        .values()
        .map(|ne| {
            (
                ne.id,
                NodeExecutionDto {
                    id: ne.id,
                    node: ne.node.clone(),
                    previous_id: ne.previous_id,
                    input_messages: ne.input_messages.clone(),
                    status: ne.status,
                    state: ne.state.clone(),
                    created_at: ne.created_at,
                },
            )
        })
        .collect();

    let steps = execution
        .steps()
        .into_iter()
        .map(|s| StepDto {
            id: s.id,
            execution_id: s.execution_id,
            step_type: s.step_type,
            message: s.message.clone(),
            output_mode: s.output_mode,
            outcome_name: s.outcome_name.clone(),
            state: s.state.clone(),
            llm_usage: s.llm_usage.clone(),
            status_hint: s.status_hint,
            is_complete: s.is_complete,
            is_final: s.is_final,
            created_at: s.created_at,
        })
        .collect();

    WorkflowExecutionDto {
        id: execution.id,
        workflow_name: execution.workflow_name.clone(),
        node_executions,
        steps,
        llm_usage: execution.llm_usage.clone(),
        last_step_llm_usage: execution.last_step_llm_usage.clone(),
        last_user_input_at: execution.last_user_input_at,
        created_at: execution.created_at,
        updated_at: execution.updated_at,
    }
}

/// Rebuild an execution from its DTO.
///
/// Steps are re-attached to their node executions in flat-list order,
/// which reconstructs both the per-node step lists and the global
/// ordering. Steps referencing a missing execution are dropped.
pub fn from_dto(dto: &WorkflowExecutionDto) -> WorkflowExecution {
    let mut run = WorkflowExecution {
        id: dto.id,
        workflow_name: dto.workflow_name.clone(),
        node_executions: HashMap::new(),
        step_order: Vec::new(),
        llm_usage: dto.llm_usage.clone(),
        last_step_llm_usage: dto.last_step_llm_usage.clone(),
        last_user_input_at: dto.last_user_input_at,
        created_at: dto.created_at,
        updated_at: dto.updated_at,
    };

    for (id, ne) in &dto.node_executions {
        run.node_executions.insert(
            *id,
            NodeExecution {
                id: ne.id,
                node: ne.node.clone(),
                previous_id: ne.previous_id,
                input_messages: ne.input_messages.clone(),
                steps: Vec::new(),
                status: ne.status,
                state: ne.state.clone(),
                created_at: ne.created_at,
            },
        );
    }

    for step in &dto.steps {
        let Some(execution) = run.node_executions.get_mut(&step.execution_id) else {
            continue;
        };
        execution.steps.push(Step {
            id: step.id,
            execution_id: step.execution_id,
            step_type: step.step_type,
            message: step.message.clone(),
            output_mode: step.output_mode,
            outcome_name: step.outcome_name.clone(),
            state: step.state.clone(),
            llm_usage: step.llm_usage.clone(),
            status_hint: step.status_hint,
            is_complete: step.is_complete,
            is_final: step.is_final,
            created_at: step.created_at,
        });
        run.step_order.push(step.id);
    }

    run
}
