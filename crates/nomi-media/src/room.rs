//! Room audio seam between the voice pipeline and a transport.

use async_trait::async_trait;

/// A block of 16-bit mono PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    /// Remote participant that produced the audio, if inbound.
    pub participant: Option<String>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            participant: None,
        }
    }

    pub fn with_participant(mut self, participant: impl Into<String>) -> Self {
        self.participant = Some(participant.into());
        self
    }

    /// Decode little-endian PCM bytes; a trailing odd byte is dropped.
    pub fn from_le_bytes(bytes: &[u8], sample_rate: u32) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
            .collect();
        Self::new(samples, sample_rate)
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// Linearly interpolate to `sample_rate`. A frame already at that rate,
    /// or one with an unknown (zero) rate, is returned unchanged.
    pub fn resampled(self, sample_rate: u32) -> Self {
        if self.sample_rate == sample_rate || self.sample_rate == 0 || sample_rate == 0 {
            return self;
        }
        let samples = resample_linear(&self.samples, self.sample_rate, sample_rate);
        Self {
            samples,
            sample_rate,
            participant: self.participant,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }
}

fn resample_linear(samples: &[i16], src_rate: u32, dst_rate: u32) -> Vec<i16> {
    if samples.len() < 2 {
        return samples.to_vec();
    }

    let ratio = dst_rate as f64 / src_rate as f64;
    let out_len = ((samples.len() as f64) * ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 / ratio;
            let left = (pos.floor() as usize).min(last);
            let right = (left + 1).min(last);
            let frac = pos - left as f64;
            let value = samples[left] as f64 * (1.0 - frac) + samples[right] as f64 * frac;
            value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
        })
        .collect()
}

/// A connected room the agent listens to and speaks into.
#[async_trait]
pub trait Room: Send + Sync {
    fn name(&self) -> &str;

    /// Next inbound audio frame; `None` once the room is closed.
    async fn recv_audio(&self) -> Option<AudioFrame>;

    async fn publish_audio(&self, frame: AudioFrame) -> anyhow::Result<()>;

    /// Drop any agent audio still queued for playback.
    async fn clear_playout(&self) -> anyhow::Result<()>;
}
