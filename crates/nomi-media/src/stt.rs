//! Speech-to-text over OpenAI-compatible Whisper endpoints.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use nomi_core::config::TranscriptionConfig;

use crate::vad::Utterance;

/// Turns a finished utterance into text.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn recognize(&self, utterance: &Utterance) -> Result<String>;
}

/// Wrap raw 16-bit PCM in a WAV container.
pub fn pcm_to_wav(pcm: &[i16], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let data_len = pcm.len() * 2; // 2 bytes per i16 sample
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;
    let file_size = 36 + data_len as u32;

    let mut wav = Vec::with_capacity(44 + data_len);

    // RIFF header
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&file_size.to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    // fmt chunk
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes()); // chunk size
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());

    // data chunk
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&(data_len as u32).to_le_bytes());
    for &sample in pcm {
        wav.extend_from_slice(&sample.to_le_bytes());
    }

    wav
}

/// Get the transcription API URL for a given provider.
pub fn provider_url(config: &TranscriptionConfig) -> &'static str {
    match config.provider.as_str() {
        "groq" => "https://api.groq.com/openai/v1/audio/transcriptions",
        _ => "https://api.openai.com/v1/audio/transcriptions",
    }
}

/// Default Whisper model for a provider.
pub fn default_model(config: &TranscriptionConfig) -> &'static str {
    match config.provider.as_str() {
        "groq" => "whisper-large-v3-turbo",
        _ => "whisper-1",
    }
}

/// Whisper transcription client.
pub struct OpenAiStt {
    url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiStt {
    pub fn from_config(config: &TranscriptionConfig) -> Self {
        Self {
            url: provider_url(config).to_string(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| default_model(config).to_string()),
            api_key: config.resolve_api_key(),
            client: reqwest::Client::new(),
        }
    }

    /// Point at a different transcription endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl SpeechToText for OpenAiStt {
    async fn recognize(&self, utterance: &Utterance) -> Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No transcription API key configured"))?;

        let wav_data = pcm_to_wav(&utterance.pcm_data, utterance.sample_rate, 1, 16);

        debug!(
            url = %self.url,
            model = %self.model,
            wav_bytes = wav_data.len(),
            duration_ms = utterance.duration_ms,
            "Sending audio for transcription"
        );

        let part = reqwest::multipart::Part::bytes(wav_data)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;

        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {api_key}"))
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Transcription API error {status}: {body}");
        }

        let text = resp.text().await?;
        Ok(text.trim().to_string())
    }
}
