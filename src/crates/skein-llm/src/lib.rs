//! skein-llm: chat-completion providers for the skein runtime.
//!
//! Implements the [`skein_core::llm::ChatClient`] contract over the
//! OpenAI-compatible SSE wire format, plus the retry policy used for
//! standalone provider calls. Scripted test doubles live in
//! `skein_core::testing`.

pub mod config;
pub mod openai;
pub mod retry;

pub use config::RemoteLlmConfig;
pub use openai::OpenAiChatClient;
pub use retry::{with_retry, RetryPolicy};
