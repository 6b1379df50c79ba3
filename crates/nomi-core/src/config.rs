//! Configuration loading and validation.
//!
//! The completions endpoint, its credential variable and the agent persona are
//! compiled-in constants; this file only covers the pieces a deployment tunes:
//! speech providers, VAD sensitivity, the room relay and logging.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{NomiError, Result};

/// Environment variable consulted for OpenAI-hosted speech services.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Room joined when neither the CLI nor the config names one.
pub const DEFAULT_ROOM: &str = "global";

/// Top-level Nomi configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<TranscriptionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad: Option<VadConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Provider: "openai" or "groq" (default: "openai").
    #[serde(default = "default_speech_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_openai_key_env")]
    pub api_key_env: Option<String>,

    /// Model name (default: "whisper-1").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: default_speech_provider(),
            api_key: None,
            api_key_env: default_openai_key_env(),
            model: None,
        }
    }
}

impl TranscriptionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Text-to-speech configuration. The voice itself is fixed by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_openai_key_env")]
    pub api_key_env: Option<String>,

    /// Model name (default: "tts-1").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Playback speed multiplier, 0.25 to 4.0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_openai_key_env(),
            model: None,
            speed: None,
        }
    }
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

fn default_speech_provider() -> String {
    "openai".into()
}

fn default_openai_key_env() -> Option<String> {
    Some(OPENAI_API_KEY_ENV.into())
}

/// Voice activity detection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// RMS energy above which a frame counts as speech.
    #[serde(default = "default_vad_threshold")]
    pub threshold: f64,

    /// Silence needed to close an utterance.
    #[serde(default = "default_min_silence_ms")]
    pub min_silence_ms: u32,

    /// Speech needed before an utterance is considered started.
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u32,

    /// Analysis frame length.
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: default_vad_threshold(),
            min_silence_ms: default_min_silence_ms(),
            min_speech_ms: default_min_speech_ms(),
            frame_ms: default_frame_ms(),
            sample_rate: default_sample_rate(),
        }
    }
}

fn default_vad_threshold() -> f64 {
    300.0
}

fn default_min_silence_ms() -> u32 {
    300
}

fn default_min_speech_ms() -> u32 {
    60
}

fn default_frame_ms() -> u32 {
    20
}

fn default_sample_rate() -> u32 {
    16_000
}

/// Real-time room relay the worker connects to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomConfig {
    /// WebSocket URL of the room relay (e.g. "ws://localhost:7880/rtc").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    /// Identity the agent joins with (default: "nomi").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl RoomConfig {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Rooms dispatched as jobs at startup.
    #[serde(default)]
    pub rooms: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "nomi_media=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| NomiError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw)?;

        let config = json5::from_str(&substituted).map_err(|e| NomiError::Config(e.to_string()))?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn transcription(&self) -> TranscriptionConfig {
        self.transcription.clone().unwrap_or_default()
    }

    pub fn tts(&self) -> TtsConfig {
        self.tts.clone().unwrap_or_default()
    }

    pub fn vad(&self) -> VadConfig {
        self.vad.clone().unwrap_or_default()
    }

    pub fn room(&self) -> RoomConfig {
        self.room.clone().unwrap_or_default()
    }

    /// Rooms to join at startup, falling back to the shared default room.
    pub fn startup_rooms(&self) -> Vec<String> {
        let rooms = self
            .worker
            .as_ref()
            .map(|w| w.rooms.clone())
            .unwrap_or_default();
        if rooms.is_empty() {
            vec![DEFAULT_ROOM.to_string()]
        } else {
            rooms
        }
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.transcription().resolve_api_key().is_none() {
            warnings.push("Transcription has no API key configured".to_string());
        }
        if self.tts().resolve_api_key().is_none() {
            warnings.push("TTS has no API key configured".to_string());
        }
        if self.room().url.is_none() {
            warnings.push("No room relay URL configured (room.url)".to_string());
        }

        let vad = self.vad();
        if vad.frame_ms == 0 {
            errors.push("vad.frame_ms cannot be 0".to_string());
        }
        if vad.sample_rate == 0 {
            errors.push("vad.sample_rate cannot be 0".to_string());
        }
        if vad.threshold < 0.0 {
            errors.push(format!("vad.threshold must be >= 0, got {}", vad.threshold));
        }

        if let Some(speed) = self.tts.as_ref().and_then(|t| t.speed) {
            if !(0.25..=4.0).contains(&speed) {
                errors.push(format!("tts.speed must be within 0.25..=4.0, got {speed}"));
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Nomi data: `~/.nomi/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nomi")
}
