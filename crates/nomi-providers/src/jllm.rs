//! Completion adapter for the hosted JLLM endpoint.
//!
//! JLLM speaks the OpenAI chat-completions format but lives at a fixed,
//! non-OpenAI URL and serves a single model, so the adapter builds an
//! [`OpenAiClient`] pointed at that URL on every call and forwards the request
//! untouched apart from the temperature default. Errors from the delegate are
//! returned as-is: no retry, no timeout override, no caching.

use async_trait::async_trait;
use tracing::debug;

use nomi_core::error::NomiError;

use crate::openai::OpenAiClient;
use crate::{ChatRequest, CompletionStream, Credentials, LlmProvider};

/// Completions URL requests are POSTed to.
pub const JLLM_URL: &str = "https://janitorai.com/hackathon/completions";

/// Environment variable overriding the bearer credential.
pub const JLLM_AUTH_ENV: &str = "JLLM_AUTH";

/// Development credential used when `JLLM_AUTH` is unset.
pub const DEFAULT_JLLM_AUTH: &str = "calhacks2047";

/// JLLM serves one model and ignores model selection.
pub const JLLM_MODEL: &str = "default";

pub const DEFAULT_TEMPERATURE: f64 = 0.8;

/// The language-model capability Nomi plugs into the voice pipeline.
#[derive(Clone)]
pub struct NomiLlm {
    auth: String,
    endpoint: String,
}

impl NomiLlm {
    /// Read the credential from `JLLM_AUTH`, falling back to the development
    /// default. Performs no network I/O.
    pub fn new() -> Self {
        Self::with_auth(std::env::var(JLLM_AUTH_ENV).ok())
    }

    pub fn with_auth(auth: Option<String>) -> Self {
        Self {
            auth: auth.unwrap_or_else(|| DEFAULT_JLLM_AUTH.to_string()),
            endpoint: JLLM_URL.to_string(),
        }
    }

    /// Point the adapter at a local stand-in for the hosted endpoint.
    #[cfg(test)]
    pub(crate) fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn auth(&self) -> &str {
        &self.auth
    }

    /// Delegate client for one completion call.
    pub fn delegate(&self) -> OpenAiClient {
        OpenAiClient::new(
            &self.endpoint,
            Credentials::ApiKey {
                api_key: self.auth.clone(),
            },
            JLLM_MODEL,
        )
        .with_provider_id("jllm")
    }

    /// The request as the delegate receives it.
    pub fn forward<'a>(request: ChatRequest<'a>) -> ChatRequest<'a> {
        ChatRequest {
            temperature: Some(resolve_temperature(request.temperature)),
            ..request
        }
    }
}

impl Default for NomiLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NomiLlm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NomiLlm")
            .field("url", &self.endpoint)
            .field("model", &JLLM_MODEL)
            .finish_non_exhaustive()
    }
}

/// Absent or zero temperature falls back to [`DEFAULT_TEMPERATURE`]; anything
/// else passes through unclamped.
pub fn resolve_temperature(temperature: Option<f64>) -> f64 {
    match temperature {
        Some(t) if t != 0.0 => t,
        _ => DEFAULT_TEMPERATURE,
    }
}

#[async_trait]
impl LlmProvider for NomiLlm {
    fn id(&self) -> &str {
        "jllm"
    }

    async fn chat(&self, request: ChatRequest<'_>) -> anyhow::Result<CompletionStream> {
        if !request.chat_ctx.has_prompt() {
            return Err(NomiError::Provider(
                "chat context needs at least one system or user entry".into(),
            )
            .into());
        }

        let request = Self::forward(request);
        debug!(
            temperature = ?request.temperature,
            n = ?request.n,
            entries = request.chat_ctx.len(),
            "Forwarding completion to JLLM"
        );

        self.delegate().chat(request).await
    }
}
