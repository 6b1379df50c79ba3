//! Streaming TTS. Sends audio chunks as they arrive from the provider.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use nomi_core::config::TtsConfig;

/// OpenAI `pcm` output: 24kHz 16-bit mono little-endian.
pub const OPENAI_TTS_SAMPLE_RATE: u32 = 24_000;

const OPENAI_TTS_URL: &str = "https://api.openai.com/v1/audio/speech";

/// Synthesizes text into PCM, streaming samples as they are produced.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Sample rate of the PCM sent on `chunk_tx`.
    fn sample_rate(&self) -> u32;

    /// Synthesize `text`. Returns once the provider is done or the receiver
    /// is dropped.
    async fn synthesize(&self, text: &str, chunk_tx: mpsc::UnboundedSender<Vec<i16>>) -> Result<()>;
}

/// OpenAI speech endpoint with a fixed voice.
pub struct OpenAiTts {
    url: String,
    voice: String,
    model: String,
    speed: Option<f32>,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiTts {
    pub fn new(config: &TtsConfig, voice: &str) -> Self {
        Self {
            url: OPENAI_TTS_URL.to_string(),
            voice: voice.to_string(),
            model: config.model.clone().unwrap_or_else(|| "tts-1".into()),
            speed: config.speed,
            api_key: config.resolve_api_key(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn voice(&self) -> &str {
        &self.voice
    }

    pub fn request_body(&self, text: &str) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "response_format": "pcm",
        });
        if let Some(speed) = self.speed {
            body["speed"] = serde_json::json!(speed);
        }
        body
    }
}

#[async_trait]
impl TextToSpeech for OpenAiTts {
    fn sample_rate(&self) -> u32 {
        OPENAI_TTS_SAMPLE_RATE
    }

    async fn synthesize(&self, text: &str, chunk_tx: mpsc::UnboundedSender<Vec<i16>>) -> Result<()> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No TTS API key configured"))?;

        debug!(voice = %self.voice, model = %self.model, text_len = text.len(), "Starting TTS stream");

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&self.request_body(text))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }

        let mut stream = resp.bytes_stream();
        let mut decoder = PcmDecoder::default();

        while let Some(chunk_result) = stream.next().await {
            let bytes = chunk_result.map_err(|e| anyhow::anyhow!("TTS stream error: {e}"))?;
            let samples = decoder.push(&bytes);
            if samples.is_empty() {
                continue;
            }
            if chunk_tx.send(samples).is_err() {
                debug!("TTS chunk receiver dropped, stopping stream");
                break;
            }
        }

        Ok(())
    }
}

/// Little-endian i16 decoder that carries odd bytes across chunk boundaries.
#[derive(Debug, Default)]
pub struct PcmDecoder {
    carry: Option<u8>,
}

impl PcmDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<i16> {
        let mut input = bytes;
        let mut samples = Vec::with_capacity(bytes.len() / 2 + 1);

        if let Some(lo) = self.carry.take() {
            match input.split_first() {
                Some((&hi, rest)) => {
                    samples.push(i16::from_le_bytes([lo, hi]));
                    input = rest;
                }
                None => {
                    self.carry = Some(lo);
                    return samples;
                }
            }
        }

        let mut pairs = input.chunks_exact(2);
        samples.extend(pairs.by_ref().map(|p| i16::from_le_bytes([p[0], p[1]])));
        self.carry = pairs.remainder().first().copied();
        samples
    }
}
