//! LLM provider abstraction.
//!
//! The voice pipeline talks to language models only through the
//! [`LlmProvider`] trait: hand it a chat request, get back a stream of
//! incremental completion chunks. [`openai::OpenAiClient`] speaks the
//! OpenAI-compatible chat-completions wire format and [`jllm::NomiLlm`] adapts
//! it to the hosted JLLM endpoint.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use nomi_core::chat::{ChatContext, FunctionContext};

pub mod jllm;
pub mod openai;
pub mod sse;

/// Credentials for authenticating with an LLM endpoint.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    /// Sent as `Authorization: Bearer <api_key>`.
    #[serde(rename = "api_key")]
    ApiKey { api_key: String },
    /// Unauthenticated endpoint (local servers).
    #[serde(rename = "none")]
    None,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey { .. } => f.write_str("ApiKey { api_key: <redacted> }"),
            Self::None => f.write_str("None"),
        }
    }
}

/// A chat-completion request as the pipeline issues it.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub chat_ctx: &'a ChatContext,
    pub fnc_ctx: Option<&'a FunctionContext>,
    pub temperature: Option<f64>,
    /// Number of completions to generate.
    pub n: Option<u32>,
}

impl<'a> ChatRequest<'a> {
    pub fn new(chat_ctx: &'a ChatContext) -> Self {
        Self {
            chat_ctx,
            fnc_ctx: None,
            temperature: None,
            n: None,
        }
    }
}

/// A streamed chunk from the LLM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    /// Choice this chunk belongs to (always 0 unless `n > 1`).
    #[serde(default)]
    pub index: u32,
    pub delta: Option<String>,
    pub tool_use: Option<ToolUseChunk>,
    pub usage: Option<ChunkUsage>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseChunk {
    pub id: String,
    pub name: String,
    pub input_json: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// Lazy, forward-only stream of completion chunks.
pub type CompletionStream = Pin<Box<dyn Stream<Item = anyhow::Result<CompletionChunk>> + Send>>;

/// The language-model capability consumed by the voice pipeline.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "jllm", "openai").
    fn id(&self) -> &str;

    /// Stream a chat completion.
    async fn chat(&self, request: ChatRequest<'_>) -> anyhow::Result<CompletionStream>;
}

/// Drain a completion stream and concatenate the text of the first choice.
///
/// Errors from the stream are returned as-is.
pub async fn collect_text(mut stream: CompletionStream) -> anyhow::Result<String> {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if chunk.index != 0 {
            continue;
        }
        if let Some(delta) = chunk.delta {
            text.push_str(&delta);
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: u32, delta: &str) -> anyhow::Result<CompletionChunk> {
        Ok(CompletionChunk {
            index,
            delta: Some(delta.into()),
            ..CompletionChunk::default()
        })
    }

    #[tokio::test]
    async fn test_collect_text_first_choice_only() {
        let stream: CompletionStream = Box::pin(futures::stream::iter(vec![
            chunk(0, "Hey "),
            chunk(1, "ignored"),
            chunk(0, "there"),
        ]));
        assert_eq!(collect_text(stream).await.unwrap(), "Hey there");
    }

    #[tokio::test]
    async fn test_collect_text_propagates_errors() {
        let stream: CompletionStream = Box::pin(futures::stream::iter(vec![
            chunk(0, "partial"),
            Err(anyhow::anyhow!("connection reset")),
        ]));
        let err = collect_text(stream).await.unwrap_err();
        assert_eq!(err.to_string(), "connection reset");
    }

    #[test]
    fn test_credentials_debug_redacts_key() {
        let creds = Credentials::ApiKey {
            api_key: "super-secret".into(),
        };
        assert!(!format!("{creds:?}").contains("super-secret"));
    }
}
