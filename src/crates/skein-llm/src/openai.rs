//! OpenAI-compatible streaming chat client.
//!
//! Speaks the `/chat/completions` SSE protocol: one POST with
//! `stream: true`, a response stream of `data:` events holding chunk JSON,
//! terminated by `data: [DONE]`. Works against OpenAI itself and the many
//! gateways that mirror its wire format.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use skein_core::llm::{
    ChatChunk, ChatClient, ChatRequest, ChatStream, ChatUsage, LlmError, ToolCallFragment,
};

use crate::config::RemoteLlmConfig;

#[derive(Clone)]
pub struct OpenAiChatClient {
    config: RemoteLlmConfig,
    client: Client,
}

impl OpenAiChatClient {
    pub fn new(config: RemoteLlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("failed to build http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn request_body(request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        let obj = body.as_object_mut().expect("body is an object");
        if let Some(t) = request.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(m) = request.max_tokens {
            obj.insert("max_tokens".into(), json!(m));
        }
        if let Some(effort) = &request.reasoning_effort {
            obj.insert("reasoning_effort".into(), json!(effort));
        }
        if !request.tools.is_empty() {
            obj.insert("tools".into(), Value::Array(request.tools.clone()));
            obj.entry("tool_choice").or_insert(json!("auto"));
        }
        for (k, v) in &request.extra {
            obj.entry(k.as_str()).or_insert(v.clone());
        }
        body
    }
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChatStream, LlmError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = Self::request_body(&request);

        let mut http = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body);
        if let Some(org) = &self.config.organization {
            http = http.header("OpenAI-Organization", org);
        }

        let response = http
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: Some(status.as_u16()),
                message: text,
            });
        }

        let stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| async move {
                match event {
                    Ok(event) => {
                        if event.data.trim() == "[DONE]" {
                            None
                        } else {
                            Some(parse_chunk(&event.data))
                        }
                    }
                    Err(e) => Some(Err(LlmError::Transport(e.to_string()))),
                }
            });

        Ok(Box::pin(stream))
    }
}

/// Decode one SSE `data:` payload into a [`ChatChunk`].
pub fn parse_chunk(data: &str) -> Result<ChatChunk, LlmError> {
    let wire: WireChunk = serde_json::from_str(data)
        .map_err(|e| LlmError::Parse(format!("bad stream chunk: {e}: {data}")))?;

    let mut chunk = ChatChunk::default();
    if let Some(usage) = wire.usage {
        chunk.usage = Some(ChatUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost_dollars: 0.0,
        });
    }
    if let Some(choice) = wire.choices.into_iter().next() {
        chunk.finish_reason = choice.finish_reason;
        if let Some(delta) = choice.delta {
            chunk.content_delta = delta.content;
            chunk.thinking_delta = delta.reasoning_content;
            for call in delta.tool_calls.unwrap_or_default() {
                chunk.tool_calls.push(ToolCallFragment {
                    index: call.index.unwrap_or(0),
                    id: call.id,
                    name: call.function.as_ref().and_then(|f| f.name.clone()),
                    arguments_delta: call
                        .function
                        .and_then(|f| f.arguments)
                        .unwrap_or_default(),
                    provider_fields: call.provider_specific_fields,
                });
            }
        }
    }
    Ok(chunk)
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: Option<WireDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunction>,
    #[serde(default)]
    provider_specific_fields: Option<Value>,
}

#[derive(Deserialize)]
struct WireFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::llm::{accumulate, ChatMessage};

    #[test]
    fn parses_content_delta_chunk() {
        let chunk = parse_chunk(
            r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.content_delta.as_deref(), Some("Hel"));
        assert!(chunk.tool_calls.is_empty());
    }

    #[test]
    fn parses_tool_call_fragments_and_usage() {
        let first = parse_chunk(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"exec","arguments":"{\"com"}}]}}]}"#,
        )
        .unwrap();
        let second = parse_chunk(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"mand\":\"ls\"}"}}]},"finish_reason":"tool_calls"}],"usage":{"prompt_tokens":9,"completion_tokens":2}}"#,
        )
        .unwrap();

        let completion = accumulate(&[first, second]);
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].id, "call_1");
        assert_eq!(completion.tool_calls[0].arguments, "{\"command\":\"ls\"}");
        assert_eq!(completion.usage.as_ref().unwrap().prompt_tokens, 9);
        assert_eq!(completion.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn bad_chunk_is_a_parse_error() {
        let err = parse_chunk("{nope").unwrap_err();
        assert!(matches!(err, LlmError::Parse(_)));
        assert!(!err.is_retriable());
    }

    #[test]
    fn request_body_carries_tools_and_extra() {
        let mut request = ChatRequest {
            model: "gpt-test".into(),
            messages: vec![ChatMessage::new("user", "hi")],
            temperature: Some(0.2),
            max_tokens: Some(64),
            reasoning_effort: None,
            tools: vec![json!({"type": "function", "function": {"name": "exec"}})],
            extra: Default::default(),
        };
        request
            .extra
            .insert("top_p".into(), json!(0.9));

        let body = OpenAiChatClient::request_body(&request);
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["top_p"], 0.9);
        assert_eq!(body["tools"][0]["function"]["name"], "exec");
    }
}
