//! Room connections over a WebSocket relay.
//!
//! The relay speaks a small protocol: JSON text messages for control and
//! room events, binary messages for 16-bit little-endian mono PCM. After
//! connecting the agent sends a `join`; inbound binary audio is attributed
//! to the most recent `active_speaker`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use nomi_core::config::RoomConfig;
use nomi_core::error::NomiError;
use nomi_media::room::{AudioFrame, Room};

/// Default identity the agent joins rooms with.
pub const DEFAULT_IDENTITY: &str = "nomi";

/// Sample rate assumed for inbound audio until the relay announces one.
const DEFAULT_INBOUND_SAMPLE_RATE: u32 = 16_000;

const CHANNEL_CAPACITY: usize = 256;

/// Which remote tracks to subscribe to on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoSubscribe {
    #[default]
    SubscribeAll,
    SubscribeNone,
    AudioOnly,
    VideoOnly,
}

impl AutoSubscribe {
    pub fn audio(&self) -> bool {
        matches!(self, Self::SubscribeAll | Self::AudioOnly)
    }

    pub fn video(&self) -> bool {
        matches!(self, Self::SubscribeAll | Self::VideoOnly)
    }
}

/// Opens room connections for jobs.
#[async_trait]
pub trait RoomConnector: Send + Sync {
    async fn connect(&self, room: &str, subscribe: AutoSubscribe) -> anyhow::Result<Arc<dyn Room>>;
}

/// Text messages exchanged with the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Join {
        room: String,
        identity: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        subscribe: AutoSubscribe,
    },
    ParticipantJoined {
        identity: String,
    },
    ParticipantLeft {
        identity: String,
    },
    /// Following binary audio belongs to this participant.
    ActiveSpeaker {
        identity: String,
    },
    /// Sample rate of the binary audio that follows.
    AudioFormat {
        sample_rate: u32,
    },
    TrackVideo {
        #[serde(default)]
        identity: Option<String>,
    },
    PlayoutClear,
}

impl RelayMessage {
    fn to_message(&self) -> anyhow::Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

/// Connects to rooms through a WebSocket relay.
#[derive(Clone)]
pub struct WsRoomConnector {
    url: String,
    identity: String,
    token: Option<String>,
}

impl WsRoomConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            identity: DEFAULT_IDENTITY.to_string(),
            token: None,
        }
    }

    pub fn from_config(config: &RoomConfig) -> Result<Self, NomiError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| NomiError::Config("room.url is not set".into()))?;
        let mut connector = Self::new(url);
        if let Some(identity) = &config.identity {
            connector.identity = identity.clone();
        }
        connector.token = config.resolve_token();
        Ok(connector)
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for WsRoomConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsRoomConnector")
            .field("url", &self.url)
            .field("identity", &self.identity)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl RoomConnector for WsRoomConnector {
    async fn connect(&self, room: &str, subscribe: AutoSubscribe) -> anyhow::Result<Arc<dyn Room>> {
        info!(url = %self.url, room, ?subscribe, "Connecting to room relay");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| NomiError::Transport(format!("Failed to connect to {}: {e}", self.url)))?;
        let (mut ws_sink, ws_source) = ws_stream.split();

        let join = RelayMessage::Join {
            room: room.to_string(),
            identity: self.identity.clone(),
            token: self.token.clone(),
            subscribe,
        };
        ws_sink
            .send(join.to_message()?)
            .await
            .map_err(|e| NomiError::Transport(format!("Failed to send join: {e}")))?;

        let (audio_tx, audio_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let participants = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(outbound_loop(outbound_rx, ws_sink, room.to_string()));
        tokio::spawn(inbound_loop(
            ws_source,
            audio_tx,
            subscribe,
            participants.clone(),
            room.to_string(),
        ));

        info!(room, identity = %self.identity, "Joined room");
        Ok(Arc::new(WsRoom {
            name: room.to_string(),
            audio_rx: tokio::sync::Mutex::new(audio_rx),
            outbound_tx,
            announced_rate: Mutex::new(None),
            participants,
        }))
    }
}

/// A room joined through [`WsRoomConnector`].
pub struct WsRoom {
    name: String,
    audio_rx: tokio::sync::Mutex<mpsc::Receiver<AudioFrame>>,
    outbound_tx: mpsc::Sender<Message>,
    /// Outbound sample rate last announced to the relay.
    announced_rate: Mutex<Option<u32>>,
    participants: Arc<Mutex<Vec<String>>>,
}

impl WsRoom {
    /// Remote participants currently in the room.
    pub fn participants(&self) -> Vec<String> {
        self.participants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn send(&self, message: Message) -> anyhow::Result<()> {
        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| NomiError::Transport(format!("room {} connection closed", self.name)).into())
    }

    fn set_announced_rate(&self, rate: Option<u32>) -> bool {
        let mut announced = self.announced_rate.lock().unwrap_or_else(|e| e.into_inner());
        let changed = *announced != rate;
        *announced = rate;
        changed
    }
}

#[async_trait]
impl Room for WsRoom {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv_audio(&self) -> Option<AudioFrame> {
        self.audio_rx.lock().await.recv().await
    }

    async fn publish_audio(&self, frame: AudioFrame) -> anyhow::Result<()> {
        if self.set_announced_rate(Some(frame.sample_rate)) {
            let format = RelayMessage::AudioFormat {
                sample_rate: frame.sample_rate,
            };
            self.send(format.to_message()?).await?;
        }
        self.send(Message::Binary(frame.to_le_bytes().into())).await
    }

    async fn clear_playout(&self) -> anyhow::Result<()> {
        // next utterance re-announces its format
        self.set_announced_rate(None);
        self.send(RelayMessage::PlayoutClear.to_message()?).await
    }
}

async fn outbound_loop<S>(mut rx: mpsc::Receiver<Message>, mut sink: S, room: String)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            warn!(room = %room, error = %e, "Room send failed, closing outbound loop");
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    debug!(room = %room, "Room outbound loop terminated");
}

async fn inbound_loop<S, E>(
    mut source: S,
    audio_tx: mpsc::Sender<AudioFrame>,
    subscribe: AutoSubscribe,
    participants: Arc<Mutex<Vec<String>>>,
    room: String,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut sample_rate = DEFAULT_INBOUND_SAMPLE_RATE;
    let mut speaker: Option<String> = None;

    while let Some(message) = source.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!(room = %room, error = %e, "Room receive failed");
                break;
            }
        };

        match message {
            Message::Binary(data) => {
                if !subscribe.audio() {
                    continue;
                }
                let mut frame = AudioFrame::from_le_bytes(&data, sample_rate);
                frame.participant = speaker.clone();
                if audio_tx.send(frame).await.is_err() {
                    debug!(room = %room, "Audio receiver dropped");
                    break;
                }
            }
            Message::Text(text) => match serde_json::from_str::<RelayMessage>(text.as_str()) {
                Ok(event) => {
                    handle_event(event, &mut sample_rate, &mut speaker, &participants, subscribe, &room)
                }
                Err(e) => debug!(room = %room, error = %e, "Ignoring unknown room message"),
            },
            Message::Close(_) => {
                info!(room = %room, "Room relay closed the connection");
                break;
            }
            _ => {}
        }
    }
    debug!(room = %room, "Room inbound loop terminated");
}

fn handle_event(
    event: RelayMessage,
    sample_rate: &mut u32,
    speaker: &mut Option<String>,
    participants: &Mutex<Vec<String>>,
    subscribe: AutoSubscribe,
    room: &str,
) {
    let mut participants = participants.lock().unwrap_or_else(|e| e.into_inner());
    match event {
        RelayMessage::ParticipantJoined { identity } => {
            info!(room, participant = %identity, "Participant joined");
            if !participants.contains(&identity) {
                participants.push(identity);
            }
        }
        RelayMessage::ParticipantLeft { identity } => {
            info!(room, participant = %identity, "Participant left");
            participants.retain(|p| p != &identity);
            if speaker.as_deref() == Some(identity.as_str()) {
                *speaker = None;
            }
        }
        RelayMessage::ActiveSpeaker { identity } => *speaker = Some(identity),
        RelayMessage::AudioFormat { sample_rate: rate } if rate > 0 => *sample_rate = rate,
        RelayMessage::TrackVideo { identity } => {
            if subscribe.video() {
                debug!(room, participant = ?identity, "Video tracks are not processed");
            }
        }
        other => debug!(room, event = ?other, "Ignoring room event"),
    }
}
