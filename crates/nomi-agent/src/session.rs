//! Nomi session bootstrap.
//!
//! For each room job: join audio-only, assemble the VAD → STT → LLM → TTS
//! pipeline around the persona prompt, start it, wait [`GREETING_DELAY`] and
//! greet the room.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use nomi_core::chat::{ChatContext, ChatRole};
use nomi_core::config::Config;
use nomi_media::pipeline::{PipelineOptions, VoicePipelineAgent};
use nomi_media::stt::{OpenAiStt, SpeechToText};
use nomi_media::tts::{OpenAiTts, TextToSpeech};
use nomi_media::vad::VadModel;
use nomi_providers::LlmProvider;
use nomi_providers::jllm::NomiLlm;

use crate::room::{AutoSubscribe, RoomConnector};
use crate::worker::{JobContext, JobProcess, WorkerOptions};

pub const PERSONA: &str = "You are Nomi, a witty AI character in a voice chat room. \
Keep responses concise (2-3 sentences max for voice). \
Be friendly, fun, and engaging. \
Remember user names and context from the conversation.";

pub const GREETING: &str = "Hey everyone! Nomi here. Ready to chat?";

/// Pause between starting the pipeline and greeting, so the room has
/// settled before Nomi speaks.
pub const GREETING_DELAY: Duration = Duration::from_secs(1);

pub const TTS_VOICE: &str = "nova";

/// Process-wide data built once by [`prewarm`] and shared by every job.
#[derive(Debug)]
pub struct NomiProcessData {
    pub vad: Arc<VadModel>,
    pub config: Arc<Config>,
}

/// Load the VAD model once per worker process.
pub fn prewarm(process: &JobProcess) -> anyhow::Result<NomiProcessData> {
    let vad = VadModel::load_with(&process.config().vad())?;
    Ok(NomiProcessData {
        vad: Arc::new(vad),
        config: process.config().clone(),
    })
}

/// A fresh conversation seeded with the persona prompt.
pub fn initial_chat_context() -> ChatContext {
    ChatContext::new().append(ChatRole::System, PERSONA)
}

/// The speech and language capabilities a session runs on.
pub struct SessionServices {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TextToSpeech>,
}

impl SessionServices {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stt: Arc::new(OpenAiStt::from_config(&config.transcription())),
            llm: Arc::new(NomiLlm::new()),
            tts: Arc::new(OpenAiTts::new(&config.tts(), TTS_VOICE)),
        }
    }
}

/// Join the job's room, start the pipeline and say the greeting.
pub async fn bootstrap_session(
    ctx: &JobContext<NomiProcessData>,
    services: SessionServices,
) -> anyhow::Result<VoicePipelineAgent> {
    info!(room = ctx.room_name(), "Starting Nomi session");
    let room = ctx.connect(AutoSubscribe::AudioOnly).await?;

    let agent = VoicePipelineAgent::with_options(
        ctx.proc().vad.clone(),
        services.stt,
        services.llm,
        services.tts,
        initial_chat_context(),
        PipelineOptions {
            allow_interruptions: true,
            cancel: ctx.cancel_token().child_token(),
        },
    );
    agent.start(room)?;

    tokio::time::sleep(GREETING_DELAY).await;
    if let Err(e) = agent.say(GREETING, true).await {
        agent.close();
        return Err(e);
    }
    Ok(agent)
}

/// Job entrypoint: runs a session until its room closes or the worker stops.
pub async fn entrypoint(ctx: JobContext<NomiProcessData>) -> anyhow::Result<()> {
    let services = SessionServices::from_config(&ctx.proc().config);
    let agent = bootstrap_session(&ctx, services).await?;

    // pipeline token is a child of the job's, so worker shutdown lands here too
    agent.closed().await;
    info!(
        room = ctx.room_name(),
        messages = agent.chat_ctx().len(),
        "Nomi session ended"
    );
    Ok(())
}

/// Worker options wiring [`prewarm`] and [`entrypoint`] to a room connector.
pub fn worker_options(connector: Arc<dyn RoomConnector>) -> WorkerOptions<NomiProcessData> {
    WorkerOptions::new(prewarm, entrypoint, connector)
}
