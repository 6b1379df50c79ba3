//! Energy-based Voice Activity Detection (VAD).
//!
//! [`VadModel`] is the loaded, immutable detector shared by every session in
//! the process. Each session opens its own [`VadStream`] to track speech
//! boundaries in one audio feed.

use anyhow::Result;
use tracing::info;

use nomi_core::config::VadConfig;
use nomi_core::error::NomiError;

/// A completed utterance ready for STT processing.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    /// Raw 16-bit mono PCM.
    pub pcm_data: Vec<i16>,
    pub sample_rate: u32,
    pub duration_ms: u64,
}

/// Speech boundary detected by a [`VadStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    SpeechStarted,
    SpeechEnded(Utterance),
}

/// Loaded voice activity detector. Immutable, safe to share across sessions.
#[derive(Debug, Clone)]
pub struct VadModel {
    threshold: f64,
    frame_size: usize,
    min_speech_frames: usize,
    min_silence_frames: usize,
    sample_rate: u32,
}

impl VadModel {
    /// Load the detector with default tuning for 16kHz 20ms frames.
    pub fn load() -> Result<Self> {
        Self::load_with(&VadConfig::default())
    }

    pub fn load_with(config: &VadConfig) -> Result<Self> {
        if config.frame_ms == 0 || config.sample_rate == 0 {
            return Err(NomiError::Media("VAD frame_ms and sample_rate must be non-zero".into()).into());
        }
        if config.threshold < 0.0 {
            return Err(NomiError::Media(format!(
                "VAD threshold must be >= 0, got {}",
                config.threshold
            ))
            .into());
        }

        let frame_size = (config.sample_rate as usize * config.frame_ms as usize) / 1000;
        if frame_size == 0 {
            anyhow::bail!("VAD frame of {}ms holds no samples", config.frame_ms);
        }
        let frames_for = |ms: u32| (ms.div_ceil(config.frame_ms) as usize).max(1);

        let model = Self {
            threshold: config.threshold,
            frame_size,
            min_speech_frames: frames_for(config.min_speech_ms),
            min_silence_frames: frames_for(config.min_silence_ms),
            sample_rate: config.sample_rate,
        };
        info!(
            threshold = model.threshold,
            frame_size = model.frame_size,
            sample_rate = model.sample_rate,
            "VAD model loaded"
        );
        Ok(model)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Open a detection stream for one audio feed.
    pub fn stream(&self) -> VadStream {
        VadStream {
            model: self.clone(),
            pending: Vec::new(),
            candidate: Vec::new(),
            utterance: Vec::new(),
            speech_frames: 0,
            silent_count: 0,
            speech_active: false,
        }
    }

    /// Compute RMS energy of a PCM frame.
    pub fn rms(samples: &[i16]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / samples.len() as f64).sqrt()
    }
}

/// Per-feed detector state.
pub struct VadStream {
    model: VadModel,
    /// Samples not yet forming a whole frame.
    pending: Vec<i16>,
    /// Speech frames seen before the start is confirmed.
    candidate: Vec<i16>,
    /// Audio of the utterance in progress.
    utterance: Vec<i16>,
    speech_frames: usize,
    silent_count: usize,
    speech_active: bool,
}

impl VadStream {
    /// Feed samples and collect any boundary events they complete.
    pub fn push_samples(&mut self, samples: &[i16]) -> Vec<VadEvent> {
        self.pending.extend_from_slice(samples);

        let frame_size = self.model.frame_size;
        let mut events = Vec::new();
        let mut offset = 0;
        while self.pending.len() - offset >= frame_size {
            let frame: Vec<i16> = self.pending[offset..offset + frame_size].to_vec();
            offset += frame_size;
            if let Some(event) = self.process_frame(&frame) {
                events.push(event);
            }
        }
        self.pending.drain(..offset);
        events
    }

    fn process_frame(&mut self, frame: &[i16]) -> Option<VadEvent> {
        let is_speech = VadModel::rms(frame) > self.model.threshold;

        if self.speech_active {
            self.utterance.extend_from_slice(frame);
            if is_speech {
                self.silent_count = 0;
                return None;
            }
            self.silent_count += 1;
            if self.silent_count >= self.model.min_silence_frames {
                self.speech_active = false;
                self.silent_count = 0;
                return Some(VadEvent::SpeechEnded(self.take_utterance()));
            }
            return None;
        }

        if is_speech {
            self.candidate.extend_from_slice(frame);
            self.speech_frames += 1;
            if self.speech_frames >= self.model.min_speech_frames {
                self.speech_active = true;
                self.speech_frames = 0;
                self.utterance = std::mem::take(&mut self.candidate);
                return Some(VadEvent::SpeechStarted);
            }
        } else {
            self.candidate.clear();
            self.speech_frames = 0;
        }
        None
    }

    fn take_utterance(&mut self) -> Utterance {
        let pcm_data = std::mem::take(&mut self.utterance);
        let duration_ms = (pcm_data.len() as u64 * 1000) / self.model.sample_rate as u64;
        Utterance {
            pcm_data,
            sample_rate: self.model.sample_rate,
            duration_ms,
        }
    }

    /// Whether speech is currently active.
    pub fn is_active(&self) -> bool {
        self.speech_active
    }

    /// Reset the detector state.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.candidate.clear();
        self.utterance.clear();
        self.speech_frames = 0;
        self.silent_count = 0;
        self.speech_active = false;
    }
}
