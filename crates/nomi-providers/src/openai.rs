//! OpenAI-compatible Chat Completions client.
//!
//! Streams chat completions from any endpoint that speaks the
//! `/v1/chat/completions` wire format. Used directly for OpenAI and as the
//! delegate behind [`crate::jllm::NomiLlm`].

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use nomi_core::chat::{ChatContext, FunctionContext};

use crate::sse::{SseEvent, parse_sse_stream};
use crate::{
    ChatRequest, ChunkUsage, CompletionChunk, CompletionStream, Credentials, LlmProvider,
    ToolUseChunk,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Reply budget when the caller does not set one.
pub const DEFAULT_MAX_TOKENS: u32 = 500;

pub struct OpenAiClient {
    /// Full URL requests are POSTed to.
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    credentials: Credentials,
    provider_id: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    /// Client for an explicit completions URL. Performs no I/O.
    pub fn new(endpoint: &str, credentials: Credentials, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            credentials,
            provider_id: "openai".into(),
            client: reqwest::Client::new(),
        }
    }

    /// Client for OpenAI proper (or a proxy mirroring its URL layout).
    pub fn openai(base_url: Option<&str>, credentials: Credentials, model: impl Into<String>) -> Self {
        let base = base_url.unwrap_or(OPENAI_BASE_URL).trim_end_matches('/');
        Self::new(&format!("{base}/v1/chat/completions"), credentials, model)
    }

    pub fn with_provider_id(mut self, id: impl Into<String>) -> Self {
        self.provider_id = id.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Build the JSON body for a streaming request.
    pub fn build_request(&self, request: &ChatRequest<'_>) -> OpenAiRequest {
        let tools = request
            .fnc_ctx
            .filter(|f| !f.is_empty())
            .map(format_tools);

        OpenAiRequest {
            model: self.model.clone(),
            messages: format_messages(request.chat_ctx),
            max_tokens: self.max_tokens,
            stream: true,
            temperature: request.temperature,
            n: request.n,
            tools,
        }
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Clone, Serialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<serde_json::Value>,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    delta: ChunkDelta,
    /// Non-streaming shape some compatible servers send inside SSE frames.
    #[serde(default)]
    message: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Accumulates tool call data across streaming deltas.
#[derive(Debug, Clone, Default)]
struct ToolCallAccumulator {
    choice: u32,
    id: String,
    name: String,
    arguments: String,
}

/// Convert the chat context into OpenAI `messages`.
pub fn format_messages(chat_ctx: &ChatContext) -> Vec<serde_json::Value> {
    chat_ctx
        .messages()
        .iter()
        .map(|m| {
            let mut msg = json!({ "role": m.role.as_str(), "content": m.content });
            if let Some(ref name) = m.name {
                msg["name"] = json!(name);
            }
            msg
        })
        .collect()
}

/// Convert a function context into OpenAI `tools`.
pub fn format_tools(fnc_ctx: &FunctionContext) -> Vec<serde_json::Value> {
    fnc_ctx
        .functions
        .iter()
        .map(|f| {
            json!({
                "type": "function",
                "function": {
                    "name": f.name,
                    "description": f.description,
                    "parameters": f.parameters_schema,
                }
            })
        })
        .collect()
}

/// Turns SSE `data:` payloads into completion chunks.
#[derive(Debug, Default)]
struct ChunkDecoder {
    tool_calls: Vec<Vec<ToolCallAccumulator>>,
    done: bool,
}

impl ChunkDecoder {
    fn decode(&mut self, data: &str) -> Vec<CompletionChunk> {
        let data = data.trim();
        if data.is_empty() {
            return Vec::new();
        }
        if data == "[DONE]" {
            return self.finish();
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                // keep-alives and partial frames
                trace!(%e, data, "Ignoring non-JSON completion frame");
                return Vec::new();
            }
        };

        let mut out = Vec::new();

        for choice in chunk.choices {
            let index = choice.index;
            let content = choice
                .delta
                .content
                .clone()
                .or_else(|| choice.message.as_ref().and_then(|m| m.content.clone()));
            let tool_deltas = choice
                .delta
                .tool_calls
                .or_else(|| choice.message.and_then(|m| m.tool_calls));

            if let Some(deltas) = tool_deltas {
                self.accumulate_tool_calls(index, deltas);
            }

            if let Some(content) = content.filter(|c| !c.is_empty()) {
                out.push(CompletionChunk {
                    index,
                    delta: Some(content),
                    ..CompletionChunk::default()
                });
            }

            if let Some(reason) = choice.finish_reason {
                let mut tools = self.drain_tool_calls(index);
                if let Some(last) = tools.last_mut() {
                    last.stop_reason = Some(reason);
                    out.extend(tools);
                } else {
                    out.push(CompletionChunk {
                        index,
                        stop_reason: Some(reason),
                        ..CompletionChunk::default()
                    });
                }
            }
        }

        if let Some(usage) = chunk.usage {
            out.push(CompletionChunk {
                usage: Some(ChunkUsage {
                    input_tokens: Some(usage.prompt_tokens),
                    output_tokens: Some(usage.completion_tokens),
                }),
                ..CompletionChunk::default()
            });
        }

        out
    }

    /// Flush tool calls that never saw a finish_reason and mark the stream done.
    fn finish(&mut self) -> Vec<CompletionChunk> {
        self.done = true;
        let mut out = Vec::new();
        for slot in std::mem::take(&mut self.tool_calls) {
            out.extend(slot.into_iter().map(tool_chunk));
        }
        out
    }

    fn accumulate_tool_calls(&mut self, choice: u32, deltas: Vec<ToolCallDelta>) {
        let slot = choice as usize;
        while self.tool_calls.len() <= slot {
            self.tool_calls.push(Vec::new());
        }
        let calls = &mut self.tool_calls[slot];
        for tc in deltas {
            while calls.len() <= tc.index {
                calls.push(ToolCallAccumulator {
                    choice,
                    ..ToolCallAccumulator::default()
                });
            }
            let acc = &mut calls[tc.index];
            if let Some(id) = tc.id {
                acc.id = id;
            }
            if let Some(f) = tc.function {
                if let Some(name) = f.name {
                    acc.name = name;
                }
                if let Some(args) = f.arguments {
                    acc.arguments.push_str(&args);
                }
            }
        }
    }

    fn drain_tool_calls(&mut self, choice: u32) -> Vec<CompletionChunk> {
        self.tool_calls
            .get_mut(choice as usize)
            .map(|calls| calls.drain(..).map(tool_chunk).collect())
            .unwrap_or_default()
    }
}

fn tool_chunk(tc: ToolCallAccumulator) -> CompletionChunk {
    CompletionChunk {
        index: tc.choice,
        tool_use: Some(ToolUseChunk {
            id: tc.id,
            name: tc.name,
            input_json: tc.arguments,
        }),
        ..CompletionChunk::default()
    }
}

struct ChunkState {
    sse: Pin<Box<dyn Stream<Item = anyhow::Result<SseEvent>> + Send>>,
    decoder: ChunkDecoder,
    pending: VecDeque<CompletionChunk>,
}

/// Map an SSE event stream onto completion chunks.
pub(crate) fn completion_chunks<S>(sse: S) -> CompletionStream
where
    S: Stream<Item = anyhow::Result<SseEvent>> + Send + 'static,
{
    let stream = futures::stream::unfold(
        ChunkState {
            sse: Box::pin(sse),
            decoder: ChunkDecoder::default(),
            pending: VecDeque::new(),
        },
        |mut state| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Some((Ok(chunk), state));
                }
                if state.decoder.done {
                    return None;
                }
                match state.sse.next().await {
                    Some(Ok(event)) => {
                        let chunks = state.decoder.decode(&event.data);
                        state.pending.extend(chunks);
                    }
                    Some(Err(e)) => {
                        state.decoder.done = true;
                        return Some((Err(e), state));
                    }
                    None => {
                        let chunks = state.decoder.finish();
                        state.pending.extend(chunks);
                    }
                }
            }
        },
    );
    Box::pin(stream)
}

#[async_trait]
impl LlmProvider for OpenAiClient {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn chat(&self, request: ChatRequest<'_>) -> anyhow::Result<CompletionStream> {
        let body = self.build_request(&request);

        debug!(
            model = %body.model,
            endpoint = %self.endpoint,
            messages = body.messages.len(),
            "Streaming OpenAI-compatible API"
        );

        let mut req_builder = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .header("accept", "text/event-stream");

        if let Credentials::ApiKey { api_key } = &self.credentials {
            req_builder = req_builder.header("authorization", format!("Bearer {api_key}"));
        }

        let response = req_builder.json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} API error {status}: {body}", self.provider_id);
        }

        Ok(completion_chunks(parse_sse_stream(response)))
    }
}
