//! UI transport packet schema.
//!
//! Envelopes carry a monotonically increasing `msg_id` and, for replies,
//! the `source_msg_id` they answer. Payloads are a tagged union keyed by
//! `kind`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use skein_core::model::OutputMode;
use skein_core::state::{LlmUsageStats, Message, RunnerStatus, Step};

use crate::logging::LogRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiServerStatus {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMessageFormat {
    #[default]
    Plain,
    Markdown,
}

/// Per-node display options forwarded with runner request packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerReqDisplayOpts {
    pub output_mode: OutputMode,
}

/// One frame of the runner stack summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerStackFrame {
    pub workflow_name: String,
    pub workflow_execution_id: String,
    pub node_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_execution_id: Option<String>,
    pub status: RunnerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutocompleteItem {
    pub title: String,
    pub replace_start: usize,
    pub replace_text: String,
    pub insert_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: usize,
    #[serde(flatten)]
    pub record: LogRecord,
}

/// Packet payloads, discriminated by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Packet {
    Ack,
    /// Free-form server-to-UI text (errors, command output).
    TextMessage {
        text: String,
        #[serde(default)]
        format: TextMessageFormat,
    },
    /// UI-to-server user input.
    UserInput { message: Message },
    /// Server-to-UI step notification.
    RunnerReq {
        workflow_id: String,
        workflow_name: String,
        workflow_execution_id: String,
        step: Step,
        input_required: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display: Option<RunnerReqDisplayOpts>,
    },
    /// Server-to-UI prompt control; an empty packet clears the prompt.
    InputPrompt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtitle: Option<String>,
    },
    /// Server status, stack summary and usage aggregates.
    UiState {
        status: UiServerStatus,
        runners: Vec<RunnerStackFrame>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active_node_started_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_user_input_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active_workflow_llm_usage: Option<LlmUsageStats>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_step_llm_usage: Option<LlmUsageStats>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_llm_usage: Option<LlmUsageStats>,
    },
    AutocompleteReq {
        text: String,
        row: usize,
        col: usize,
    },
    AutocompleteResp { items: Vec<AutocompleteItem> },
    StopReq,
    LogReq {
        #[serde(default)]
        offset: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    LogResp {
        offset: usize,
        total: usize,
        entries: Vec<LogEntry>,
    },
}

/// Discriminant used by the incoming-packet router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Ack,
    TextMessage,
    UserInput,
    RunnerReq,
    InputPrompt,
    UiState,
    AutocompleteReq,
    AutocompleteResp,
    StopReq,
    LogReq,
    LogResp,
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Ack => PacketKind::Ack,
            Packet::TextMessage { .. } => PacketKind::TextMessage,
            Packet::UserInput { .. } => PacketKind::UserInput,
            Packet::RunnerReq { .. } => PacketKind::RunnerReq,
            Packet::InputPrompt { .. } => PacketKind::InputPrompt,
            Packet::UiState { .. } => PacketKind::UiState,
            Packet::AutocompleteReq { .. } => PacketKind::AutocompleteReq,
            Packet::AutocompleteResp { .. } => PacketKind::AutocompleteResp,
            Packet::StopReq => PacketKind::StopReq,
            Packet::LogReq { .. } => PacketKind::LogReq,
            Packet::LogResp { .. } => PacketKind::LogResp,
        }
    }

    pub fn clear_prompt() -> Self {
        Packet::InputPrompt {
            title: None,
            subtitle: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketEnvelope {
    pub msg_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_msg_id: Option<u64>,
    pub payload: Packet,
}
