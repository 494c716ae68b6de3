//! Streaming chat-completion contract.
//!
//! The runtime only depends on this interface; concrete providers live in
//! the `skein-llm` crate. A provider accepts a [`ChatRequest`] and returns
//! a stream of [`ChatChunk`]s; [`accumulate`] folds the chunk stream into a
//! final [`ChatCompletion`] with assembled tool calls and usage.

use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use thiserror::Error;

/// Errors surfaced by chat providers.
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    /// HTTP-level failure with an optional status code.
    #[error("llm http error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Http { status: Option<u16>, message: String },

    /// Connection or stream transport failure.
    #[error("llm transport error: {0}")]
    Transport(String),

    /// The provider answered with something unparseable.
    #[error("llm response parse error: {0}")]
    Parse(String),

    /// Provider configuration is missing or invalid.
    #[error("llm configuration error: {0}")]
    Configuration(String),
}

impl LlmError {
    /// Whether retrying the request may help. Mirrors the usual provider
    /// guidance: timeouts, rate limits and 5xx responses are retriable.
    pub fn is_retriable(&self) -> bool {
        match self {
            LlmError::Http { status, .. } => matches!(
                status,
                Some(408) | Some(409) | Some(429) | Some(500..=599) | None
            ),
            LlmError::Transport(_) => true,
            LlmError::Parse(_) | LlmError::Configuration(_) => false,
        }
    }
}

/// One message of the serialized conversation sent to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ChatToolCall>,
    /// Set on `tool` role messages answering a tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }
}

/// A fully assembled tool call on an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub name: String,
    /// Raw JSON-encoded arguments as produced by the provider.
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_fields: Option<Value>,
}

fn default_call_type() -> String {
    "function".to_string()
}

/// A streaming chat-completion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    /// OpenAI-style function tool schemas.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    /// Provider-specific extra parameters merged into the request body.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

/// Token usage reported by the provider, with an optional computed cost.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(default)]
    pub cost_dollars: f64,
}

/// A partial tool call carried by one stream chunk. Fragments sharing an
/// index belong to the same call; argument deltas concatenate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallFragment {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments_delta: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_fields: Option<Value>,
}

/// One streamed delta of the completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_delta: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallFragment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ChatUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// A fully assembled completion.
#[derive(Debug, Clone, Default)]
pub struct ChatCompletion {
    pub text: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ChatToolCall>,
    pub usage: Option<ChatUsage>,
    pub finish_reason: Option<String>,
}

/// Fold a chunk sequence into a [`ChatCompletion`].
///
/// Content deltas concatenate; tool call fragments merge by index, with the
/// first fragment contributing id/name and later ones extending the raw
/// argument string; the last usage and finish reason win.
pub fn accumulate(chunks: &[ChatChunk]) -> ChatCompletion {
    let mut completion = ChatCompletion::default();
    let mut thinking = String::new();
    let mut calls: Vec<(usize, ChatToolCall)> = Vec::new();

    for chunk in chunks {
        if let Some(delta) = &chunk.content_delta {
            completion.text.push_str(delta);
        }
        if let Some(delta) = &chunk.thinking_delta {
            thinking.push_str(delta);
        }
        for frag in &chunk.tool_calls {
            match calls.iter_mut().find(|(idx, _)| *idx == frag.index) {
                Some((_, call)) => {
                    if let Some(id) = &frag.id {
                        if call.id.is_empty() {
                            call.id = id.clone();
                        }
                    }
                    if let Some(name) = &frag.name {
                        if call.name.is_empty() {
                            call.name = name.clone();
                        }
                    }
                    call.arguments.push_str(&frag.arguments_delta);
                    if frag.provider_fields.is_some() {
                        call.provider_fields = frag.provider_fields.clone();
                    }
                }
                None => {
                    calls.push((
                        frag.index,
                        ChatToolCall {
                            id: frag.id.clone().unwrap_or_default(),
                            call_type: default_call_type(),
                            name: frag.name.clone().unwrap_or_default(),
                            arguments: frag.arguments_delta.clone(),
                            provider_fields: frag.provider_fields.clone(),
                        },
                    ));
                }
            }
        }
        if chunk.usage.is_some() {
            completion.usage = chunk.usage.clone();
        }
        if chunk.finish_reason.is_some() {
            completion.finish_reason = chunk.finish_reason.clone();
        }
    }

    calls.sort_by_key(|(idx, _)| *idx);
    completion.tool_calls = calls.into_iter().map(|(_, c)| c).collect();
    if !thinking.is_empty() {
        completion.thinking = Some(thinking);
    }
    completion
}

/// Boxed stream of chat chunks.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>>;

/// Streaming chat-completion provider.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChatStream, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_concatenates_content_and_merges_tool_calls() {
        let chunks = vec![
            ChatChunk {
                content_delta: Some("Hel".into()),
                ..Default::default()
            },
            ChatChunk {
                content_delta: Some("lo".into()),
                tool_calls: vec![ToolCallFragment {
                    index: 0,
                    id: Some("call_1".into()),
                    name: Some("exec".into()),
                    arguments_delta: "{\"com".into(),
                    provider_fields: None,
                }],
                ..Default::default()
            },
            ChatChunk {
                tool_calls: vec![ToolCallFragment {
                    index: 0,
                    arguments_delta: "mand\":\"ls\"}".into(),
                    ..Default::default()
                }],
                usage: Some(ChatUsage {
                    prompt_tokens: 7,
                    completion_tokens: 3,
                    cost_dollars: 0.0,
                }),
                finish_reason: Some("tool_calls".into()),
                ..Default::default()
            },
        ];

        let completion = accumulate(&chunks);
        assert_eq!(completion.text, "Hello");
        assert_eq!(completion.tool_calls.len(), 1);
        let call = &completion.tool_calls[0];
        assert_eq!(call.id, "call_1");
        assert_eq!(call.name, "exec");
        assert_eq!(call.arguments, "{\"command\":\"ls\"}");
        assert_eq!(completion.usage.as_ref().unwrap().prompt_tokens, 7);
        assert_eq!(completion.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn retriable_classification() {
        assert!(LlmError::Http {
            status: Some(429),
            message: "slow down".into()
        }
        .is_retriable());
        assert!(LlmError::Http {
            status: Some(503),
            message: "unavailable".into()
        }
        .is_retriable());
        assert!(LlmError::Transport("reset".into()).is_retriable());
        assert!(!LlmError::Http {
            status: Some(401),
            message: "denied".into()
        }
        .is_retriable());
        assert!(!LlmError::Parse("bad json".into()).is_retriable());
    }
}
