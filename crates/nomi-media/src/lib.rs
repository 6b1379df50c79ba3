//! Media pipeline: VAD, STT, TTS streaming and the voice agent loop.

pub mod pipeline;
pub mod room;
pub mod stt;
pub mod tts;
pub mod vad;
