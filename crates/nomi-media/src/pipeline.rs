//! Voice pipeline: VAD → STT → LLM → TTS over a connected room.
//!
//! Once started, the pipeline listens to room audio. Each finished utterance
//! is transcribed, appended to the chat context as a user turn, answered by
//! the LLM and spoken back. User speech that starts while the agent is talking
//! cancels interruptible playback and clears the room's playout queue. When
//! interruptions are allowed it also abandons any reply still waiting on the
//! LLM, so a stale answer is never spoken over the new turn.
//!
//! Inbound audio is resampled to the VAD rate before detection.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nomi_core::chat::{ChatContext, ChatMessage, ChatRole};
use nomi_providers::{ChatRequest, LlmProvider, collect_text};

use crate::room::{AudioFrame, Room};
use crate::stt::SpeechToText;
use crate::tts::TextToSpeech;
use crate::vad::{Utterance, VadEvent, VadModel};

/// Tuning for a [`VoicePipelineAgent`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Whether user speech may cut off LLM replies.
    pub allow_interruptions: bool,
    /// Stops the pipeline when cancelled.
    pub cancel: CancellationToken,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            allow_interruptions: true,
            cancel: CancellationToken::new(),
        }
    }
}

/// Result of speaking one utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechOutcome {
    pub interrupted: bool,
}

/// Handle to a voice pipeline. Clones share the same session.
#[derive(Clone)]
pub struct VoicePipelineAgent {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for VoicePipelineAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoicePipelineAgent").finish_non_exhaustive()
    }
}

struct Playout {
    cancel: CancellationToken,
    allow_interruptions: bool,
}

struct Inner {
    vad: Arc<VadModel>,
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LlmProvider>,
    tts: Arc<dyn TextToSpeech>,
    chat_ctx: Mutex<ChatContext>,
    room: OnceLock<Arc<dyn Room>>,
    playout: Mutex<Option<Playout>>,
    /// Cancelled when user speech supersedes pending replies.
    turn_cancel: Mutex<CancellationToken>,
    /// One reply turn at a time, in utterance order.
    turn_lock: tokio::sync::Mutex<()>,
    /// One speech at a time.
    speech_lock: tokio::sync::Mutex<()>,
    allow_interruptions: bool,
    cancel: CancellationToken,
}

impl VoicePipelineAgent {
    pub fn new(
        vad: Arc<VadModel>,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LlmProvider>,
        tts: Arc<dyn TextToSpeech>,
        chat_ctx: ChatContext,
    ) -> Self {
        Self::with_options(vad, stt, llm, tts, chat_ctx, PipelineOptions::default())
    }

    pub fn with_options(
        vad: Arc<VadModel>,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LlmProvider>,
        tts: Arc<dyn TextToSpeech>,
        chat_ctx: ChatContext,
        options: PipelineOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                vad,
                stt,
                llm,
                tts,
                chat_ctx: Mutex::new(chat_ctx),
                room: OnceLock::new(),
                playout: Mutex::new(None),
                turn_cancel: Mutex::new(options.cancel.child_token()),
                turn_lock: tokio::sync::Mutex::new(()),
                speech_lock: tokio::sync::Mutex::new(()),
                allow_interruptions: options.allow_interruptions,
                cancel: options.cancel,
            }),
        }
    }

    /// Attach to `room` and begin listening. Must be called from within a
    /// tokio runtime.
    pub fn start(&self, room: Arc<dyn Room>) -> anyhow::Result<()> {
        if self.inner.room.set(room.clone()).is_err() {
            anyhow::bail!("voice pipeline already started");
        }
        info!(room = room.name(), "Voice pipeline started");
        tokio::spawn(self.inner.clone().listen(room));
        Ok(())
    }

    /// Speak `text` into the room and record it as an assistant turn.
    pub async fn say(&self, text: &str, allow_interruptions: bool) -> anyhow::Result<SpeechOutcome> {
        self.inner.speak(text, allow_interruptions).await
    }

    /// Snapshot of the conversation so far.
    pub fn chat_ctx(&self) -> ChatContext {
        self.inner.lock_ctx().clone()
    }

    pub fn is_started(&self) -> bool {
        self.inner.room.get().is_some()
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.lock_playout().is_some()
    }

    /// Stop listening and cut off any speech in progress.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// Resolves once the pipeline is closed or its room stops sending audio.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await;
    }
}

impl Inner {
    fn lock_ctx(&self) -> MutexGuard<'_, ChatContext> {
        self.chat_ctx.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_playout(&self) -> MutexGuard<'_, Option<Playout>> {
        self.playout.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_turn(&self) -> CancellationToken {
        self.turn_cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Abandon replies queued for earlier utterances.
    fn supersede_turns(&self) {
        let mut turn = self.turn_cancel.lock().unwrap_or_else(|e| e.into_inner());
        turn.cancel();
        *turn = self.cancel.child_token();
    }

    async fn listen(self: Arc<Self>, room: Arc<dyn Room>) {
        let mut vad = self.vad.stream();
        let vad_rate = self.vad.sample_rate();
        let mut inbound_rate = vad_rate;
        // latest participant heard, and who opened the current utterance
        let mut last_participant: Option<String> = None;
        let mut speaker: Option<String> = None;

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = room.recv_audio() => frame,
            };
            let Some(frame) = frame else {
                info!(room = room.name(), "Room audio closed");
                break;
            };
            if frame.sample_rate != inbound_rate {
                debug!(from = frame.sample_rate, to = vad_rate, "Room audio rate changed");
                inbound_rate = frame.sample_rate;
            }
            let frame = frame.resampled(vad_rate);
            if frame.participant.is_some() {
                last_participant = frame.participant;
            }

            for event in vad.push_samples(&frame.samples) {
                match event {
                    VadEvent::SpeechStarted => {
                        speaker = last_participant.clone();
                        debug!(speaker = ?speaker, "User speech started");
                        if self.allow_interruptions {
                            self.supersede_turns();
                        }
                        self.interrupt(room.as_ref()).await;
                    }
                    VadEvent::SpeechEnded(utterance) => {
                        debug!(duration_ms = utterance.duration_ms, "User speech ended");
                        let inner = self.clone();
                        let speaker = speaker.take();
                        let turn = self.current_turn();
                        tokio::spawn(async move {
                            if let Err(e) = inner.reply(utterance, speaker, turn).await {
                                warn!(error = %e, "Reply turn dropped");
                            }
                        });
                    }
                }
            }
        }

        self.cancel.cancel();
        info!(room = room.name(), "Voice pipeline stopped");
    }

    async fn interrupt(&self, room: &dyn Room) {
        let target = self
            .lock_playout()
            .as_ref()
            .filter(|p| p.allow_interruptions && !p.cancel.is_cancelled())
            .map(|p| p.cancel.clone());
        let Some(cancel) = target else {
            return;
        };

        info!("User speech interrupted agent");
        cancel.cancel();
        if let Err(e) = room.clear_playout().await {
            warn!(error = %e, "Failed to clear playout");
        }
    }

    async fn reply(
        &self,
        utterance: Utterance,
        speaker: Option<String>,
        turn: CancellationToken,
    ) -> anyhow::Result<()> {
        let _turn_guard = self.turn_lock.lock().await;

        let text = self.stt.recognize(&utterance).await?;
        if text.trim().is_empty() {
            debug!("Empty transcript, skipping turn");
            return Ok(());
        }
        debug!(speaker = ?speaker, text = %text, "Transcribed user turn");

        let mut message = ChatMessage::new(ChatRole::User, text);
        if let Some(name) = speaker {
            message = message.with_name(name);
        }
        let snapshot = {
            let mut ctx = self.lock_ctx();
            ctx.push(message);
            ctx.clone()
        };

        if turn.is_cancelled() {
            debug!("Reply superseded before completion");
            return Ok(());
        }
        let reply = tokio::select! {
            _ = turn.cancelled() => {
                debug!(provider = self.llm.id(), "Reply superseded by new user speech");
                return Ok(());
            }
            reply = self.complete(&snapshot) => reply?,
        };
        let reply = reply.trim();
        if reply.is_empty() {
            debug!(provider = self.llm.id(), "LLM returned an empty reply");
            return Ok(());
        }

        self.speak(reply, self.allow_interruptions).await?;
        Ok(())
    }

    async fn complete(&self, chat_ctx: &ChatContext) -> anyhow::Result<String> {
        let stream = self.llm.chat(ChatRequest::new(chat_ctx)).await?;
        collect_text(stream).await
    }

    async fn speak(&self, text: &str, allow_interruptions: bool) -> anyhow::Result<SpeechOutcome> {
        let room = self
            .room
            .get()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("voice pipeline is not started"))?;

        let _speech = self.speech_lock.lock().await;
        let cancel = self.cancel.child_token();
        *self.lock_playout() = Some(Playout {
            cancel: cancel.clone(),
            allow_interruptions,
        });

        let result = self.play(room.as_ref(), text, &cancel).await;
        *self.lock_playout() = None;
        let interrupted = result?;

        self.lock_ctx().push(ChatMessage::new(ChatRole::Assistant, text));
        if interrupted {
            debug!(text_len = text.len(), "Agent speech interrupted");
        }
        Ok(SpeechOutcome { interrupted })
    }

    /// Stream synthesized audio into the room. Returns whether playback was
    /// cut off.
    async fn play(&self, room: &dyn Room, text: &str, cancel: &CancellationToken) -> anyhow::Result<bool> {
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let sample_rate = self.tts.sample_rate();
        let synthesis = self.tts.synthesize(text, chunk_tx);
        tokio::pin!(synthesis);
        let mut synthesized = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(true),
                result = &mut synthesis, if !synthesized => {
                    result?;
                    synthesized = true;
                }
                chunk = chunk_rx.recv() => match chunk {
                    Some(samples) => room.publish_audio(AudioFrame::new(samples, sample_rate)).await?,
                    None => return Ok(false),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use nomi_providers::{CompletionChunk, CompletionStream};

    use super::*;

    struct FakeRoom {
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<AudioFrame>>,
        published: Mutex<Vec<AudioFrame>>,
        clears: AtomicUsize,
    }

    impl FakeRoom {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<AudioFrame>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let room = Arc::new(Self {
                inbound: tokio::sync::Mutex::new(rx),
                published: Mutex::new(Vec::new()),
                clears: AtomicUsize::new(0),
            });
            (room, tx)
        }

        fn published_frames(&self) -> usize {
            self.published.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Room for FakeRoom {
        fn name(&self) -> &str {
            "test-room"
        }

        async fn recv_audio(&self) -> Option<AudioFrame> {
            self.inbound.lock().await.recv().await
        }

        async fn publish_audio(&self, frame: AudioFrame) -> anyhow::Result<()> {
            self.published.lock().unwrap().push(frame);
            Ok(())
        }

        async fn clear_playout(&self) -> anyhow::Result<()> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeStt(&'static str);

    #[async_trait]
    impl SpeechToText for FakeStt {
        async fn recognize(&self, _utterance: &Utterance) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    /// Records what it was asked to transcribe.
    struct RecordingStt {
        heard: Mutex<Vec<Utterance>>,
    }

    #[async_trait]
    impl SpeechToText for RecordingStt {
        async fn recognize(&self, utterance: &Utterance) -> anyhow::Result<String> {
            self.heard.lock().unwrap().push(utterance.clone());
            Ok("hello from the lobby".into())
        }
    }

    #[derive(Default)]
    struct FakeLlm {
        fail: bool,
        delay: Duration,
        seen: Mutex<Vec<ChatContext>>,
    }

    #[async_trait]
    impl LlmProvider for FakeLlm {
        fn id(&self) -> &str {
            "fake"
        }

        async fn chat(&self, request: ChatRequest<'_>) -> anyhow::Result<CompletionStream> {
            self.seen.lock().unwrap().push(request.chat_ctx.clone());
            tokio::time::sleep(self.delay).await;
            if self.fail {
                anyhow::bail!("fake API error 500: boom");
            }
            let chunks = ["Nice to ", "meet you, Sam!"].map(|text| -> anyhow::Result<CompletionChunk> {
                Ok(CompletionChunk {
                    delta: Some(text.into()),
                    ..CompletionChunk::default()
                })
            });
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    struct FakeTts {
        chunks: usize,
        delay: Duration,
    }

    #[async_trait]
    impl TextToSpeech for FakeTts {
        fn sample_rate(&self) -> u32 {
            24_000
        }

        async fn synthesize(&self, _text: &str, chunk_tx: mpsc::UnboundedSender<Vec<i16>>) -> anyhow::Result<()> {
            for _ in 0..self.chunks {
                if chunk_tx.send(vec![7; 480]).is_err() {
                    break;
                }
                tokio::time::sleep(self.delay).await;
            }
            Ok(())
        }
    }

    fn agent(llm: Arc<FakeLlm>, stt: &'static str, tts: FakeTts) -> VoicePipelineAgent {
        VoicePipelineAgent::new(
            Arc::new(VadModel::load().unwrap()),
            Arc::new(FakeStt(stt)),
            llm,
            Arc::new(tts),
            ChatContext::new().append(ChatRole::System, "You are Nomi."),
        )
    }

    fn quick_tts() -> FakeTts {
        FakeTts {
            chunks: 3,
            delay: Duration::from_millis(1),
        }
    }

    /// 100ms of loud audio from `who`.
    fn speech(who: &str) -> AudioFrame {
        AudioFrame::new(vec![2000; 1600], 16_000).with_participant(who)
    }

    /// 400ms of silence, enough to close an utterance.
    fn silence() -> AudioFrame {
        AudioFrame::new(vec![0; 6400], 16_000)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_say_before_start_fails() {
        let agent = agent(Arc::default(), "", quick_tts());
        let err = agent.say("hello", true).await.unwrap_err();
        assert!(err.to_string().contains("not started"));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let agent = agent(Arc::default(), "", quick_tts());
        let (room, _tx) = FakeRoom::new();
        agent.start(room.clone()).unwrap();
        assert!(agent.start(room).is_err());
        assert!(agent.is_started());
    }

    #[tokio::test]
    async fn test_say_publishes_audio_and_records_turn() {
        let agent = agent(Arc::default(), "", quick_tts());
        let (room, _tx) = FakeRoom::new();
        agent.start(room.clone()).unwrap();

        let outcome = agent.say("Hey everyone!", true).await.unwrap();
        assert!(!outcome.interrupted);
        assert_eq!(room.published_frames(), 3);
        assert_eq!(room.published.lock().unwrap()[0].sample_rate, 24_000);

        let ctx = agent.chat_ctx();
        let last = ctx.messages().last().unwrap();
        assert_eq!(last.role, ChatRole::Assistant);
        assert_eq!(last.content, "Hey everyone!");
        assert!(!agent.is_speaking());
    }

    #[tokio::test]
    async fn test_utterance_runs_full_turn() {
        let llm = Arc::new(FakeLlm::default());
        let agent = agent(llm.clone(), "Hi, I'm Sam", quick_tts());
        let (room, tx) = FakeRoom::new();
        agent.start(room.clone()).unwrap();

        tx.send(speech("sam")).unwrap();
        tx.send(silence()).unwrap();

        wait_for(|| agent.chat_ctx().len() == 3).await;

        let ctx = agent.chat_ctx();
        let messages = ctx.messages();
        assert_eq!(messages[1].role, ChatRole::User);
        assert_eq!(messages[1].content, "Hi, I'm Sam");
        assert_eq!(messages[1].name.as_deref(), Some("sam"));
        assert_eq!(messages[2].role, ChatRole::Assistant);
        assert_eq!(messages[2].content, "Nice to meet you, Sam!");

        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), 2);
        assert_eq!(room.published_frames(), 3);
    }

    #[tokio::test]
    async fn test_user_speech_interrupts_greeting() {
        let agent = agent(
            Arc::default(),
            "",
            FakeTts {
                chunks: 100,
                delay: Duration::from_millis(20),
            },
        );
        let (room, tx) = FakeRoom::new();
        agent.start(room.clone()).unwrap();

        let speaker = agent.clone();
        let greeting = tokio::spawn(async move { speaker.say("Hey everyone!", true).await });

        wait_for(|| room.published_frames() > 0).await;
        tx.send(speech("sam")).unwrap();

        let outcome = greeting.await.unwrap().unwrap();
        assert!(outcome.interrupted);
        assert_eq!(room.clears.load(Ordering::SeqCst), 1);
        assert!(room.published_frames() < 100);
    }

    #[tokio::test]
    async fn test_uninterruptible_speech_plays_out() {
        let agent = agent(
            Arc::default(),
            "",
            FakeTts {
                chunks: 5,
                delay: Duration::from_millis(20),
            },
        );
        let (room, tx) = FakeRoom::new();
        agent.start(room.clone()).unwrap();

        let speaker = agent.clone();
        let speech_task = tokio::spawn(async move { speaker.say("Listen up", false).await });

        wait_for(|| room.published_frames() > 0).await;
        tx.send(speech("sam")).unwrap();

        let outcome = speech_task.await.unwrap().unwrap();
        assert!(!outcome.interrupted);
        assert_eq!(room.published_frames(), 5);
        assert_eq!(room.clears.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_llm_error_drops_turn() {
        let llm = Arc::new(FakeLlm {
            fail: true,
            ..FakeLlm::default()
        });
        let agent = agent(llm.clone(), "anyone there?", quick_tts());
        let (room, tx) = FakeRoom::new();
        agent.start(room.clone()).unwrap();

        tx.send(speech("sam")).unwrap();
        tx.send(silence()).unwrap();

        wait_for(|| !llm.seen.lock().unwrap().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // user turn kept, no reply spoken, pipeline still listening
        let ctx = agent.chat_ctx();
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.messages()[1].role, ChatRole::User);
        assert_eq!(room.published_frames(), 0);
        assert!(!tx.is_closed());
    }

    #[tokio::test]
    async fn test_empty_transcript_skips_llm() {
        let llm = Arc::new(FakeLlm::default());
        let agent = agent(llm.clone(), "   ", quick_tts());
        let (room, tx) = FakeRoom::new();
        agent.start(room).unwrap();

        tx.send(speech("sam")).unwrap();
        tx.send(silence()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(llm.seen.lock().unwrap().is_empty());
        assert_eq!(agent.chat_ctx().len(), 1);
    }

    #[tokio::test]
    async fn test_room_close_stops_pipeline() {
        let agent = agent(Arc::default(), "", quick_tts());
        let (room, tx) = FakeRoom::new();
        agent.start(room).unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), agent.closed())
            .await
            .expect("pipeline should stop when the room closes");
    }

    #[tokio::test]
    async fn test_wideband_room_audio_is_resampled_for_vad() {
        let stt = Arc::new(RecordingStt {
            heard: Mutex::new(Vec::new()),
        });
        let agent = VoicePipelineAgent::new(
            Arc::new(VadModel::load().unwrap()),
            stt.clone(),
            Arc::new(FakeLlm::default()),
            Arc::new(quick_tts()),
            ChatContext::new().append(ChatRole::System, "You are Nomi."),
        );
        let (room, tx) = FakeRoom::new();
        agent.start(room).unwrap();

        // 300ms of speech then 500ms of silence, in 20ms frames at 48kHz
        for _ in 0..15 {
            tx.send(AudioFrame::new(vec![2000; 960], 48_000).with_participant("sam"))
                .unwrap();
        }
        for _ in 0..25 {
            tx.send(AudioFrame::new(vec![0; 960], 48_000)).unwrap();
        }

        wait_for(|| !stt.heard.lock().unwrap().is_empty()).await;
        let heard = stt.heard.lock().unwrap()[0].clone();
        assert_eq!(heard.sample_rate, 16_000);
        // speech plus the 300ms silence tail
        assert_eq!(heard.pcm_data.len(), 9_600);
        assert_eq!(heard.duration_ms, 600);
    }

    #[tokio::test]
    async fn test_new_speech_supersedes_pending_reply() {
        let llm = Arc::new(FakeLlm {
            delay: Duration::from_millis(300),
            ..FakeLlm::default()
        });
        let agent = agent(llm.clone(), "wait, one more thing", quick_tts());
        let (room, tx) = FakeRoom::new();
        agent.start(room.clone()).unwrap();

        tx.send(speech("sam")).unwrap();
        tx.send(silence()).unwrap();
        wait_for(|| llm.seen.lock().unwrap().len() == 1).await;

        // sam keeps talking while the first reply is still generating
        tx.send(speech("sam")).unwrap();
        tx.send(silence()).unwrap();

        wait_for(|| agent.chat_ctx().len() == 4).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let ctx = agent.chat_ctx();
        let roles: Vec<ChatRole> = ctx.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ChatRole::System, ChatRole::User, ChatRole::User, ChatRole::Assistant]
        );
        assert_eq!(llm.seen.lock().unwrap().len(), 2);
        assert_eq!(room.published_frames(), 3);
    }

    #[tokio::test]
    async fn test_utterance_keeps_opening_speaker() {
        let agent = agent(Arc::default(), "is it my turn?", quick_tts());
        let (room, tx) = FakeRoom::new();
        agent.start(room).unwrap();

        tx.send(speech("sam")).unwrap();
        tx.send(speech("ana")).unwrap();
        tx.send(silence()).unwrap();

        wait_for(|| agent.chat_ctx().len() >= 2).await;
        assert_eq!(agent.chat_ctx().messages()[1].name.as_deref(), Some("sam"));
    }
}
