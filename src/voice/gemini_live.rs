//! Gemini Live WebSocket client for the voice assistant.
//!
//! Implements the bidirectional streaming protocol for Google's Gemini
//! Live API (BidiGenerateContent): microphone audio goes up as
//! `realtimeInput`, synthesized speech, transcriptions and tool calls come
//! back as `serverContent` / `toolCall`.
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: open WebSocket to Gemini Live endpoint
//! 2. **Setup**: send initial configuration (model, voice, persona, tools,
//!    transcription) and wait for `setupComplete`
//! 3. **Stream**: send audio chunks as `realtimeInput`, receive audio,
//!    transcripts and `toolCall` requests; answer tool calls with
//!    `toolResponse`
//! 4. **Close**: gracefully close the WebSocket session
//!
//! Gemini Live sends its JSON control messages as Binary frames as well as
//! Text frames; both are parsed the same way.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::codec::{AudioFrame, OUTPUT_SAMPLE_RATE};
use super::persona;
use super::LiveEvent;
use crate::error::VoiceError;

// ── Constants ──────────────────────────────────────────────────────

/// Gemini Live WebSocket endpoint.
pub const GEMINI_LIVE_WS_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Native-audio dialog model used by the assistant.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Prebuilt synthesized voice.
pub const DEFAULT_VOICE: &str = "Puck";

/// Capacity of the outbound and inbound channels.
const CHANNEL_CAPACITY: usize = 256;

// ── Setup message (JSON sent as first frame) ───────────────────────

/// Top-level setup message for Gemini Live session initialization.
#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
pub struct SetupPayload {
    pub model: String,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(rename = "inputAudioTranscription", skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(rename = "outputAudioTranscription", skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

#[derive(Debug, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<String>,
    #[serde(rename = "speechConfig", skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize)]
pub struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct VoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct Tool {
    #[serde(rename = "functionDeclarations")]
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// A function the model may call.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Empty object that switches a transcription stream on.
#[derive(Debug, Default, Serialize)]
pub struct AudioTranscriptionConfig {}

/// Build the setup message for an assistant session.
///
/// Audio-only responses, the persona instruction, the enquiry tool, both
/// transcription streams and a fixed prebuilt voice.
pub fn build_setup_message(model: &str, voice: &str) -> SetupMessage {
    let model = if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    };

    SetupMessage {
        setup: SetupPayload {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.to_string(),
                        },
                    },
                }),
            },
            system_instruction: Some(SystemInstruction {
                parts: vec![TextPart {
                    text: persona::SYSTEM_INSTRUCTION.to_string(),
                }],
            }),
            tools: vec![Tool {
                function_declarations: vec![persona::enquiry_tool()],
            }],
            input_audio_transcription: Some(AudioTranscriptionConfig::default()),
            output_audio_transcription: Some(AudioTranscriptionConfig::default()),
        },
    }
}

// ── Audio input message ────────────────────────────────────────────

/// Audio input message sent to Gemini Live.
///
/// The SDKs still put microphone audio in `mediaChunks` on the wire.
#[derive(Debug, Serialize)]
pub struct RealtimeInputMessage {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    #[serde(rename = "mediaChunks")]
    pub media_chunks: Vec<MediaChunk>,
}

/// Audio chunk with MIME type and base64-encoded data.
#[derive(Debug, Serialize)]
pub struct MediaChunk {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String, // base64-encoded audio
}

/// Build a realtime audio input message from one captured frame.
///
/// Wire format: `{"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "<base64>"}]}}`
pub fn build_audio_message(frame: &AudioFrame) -> RealtimeInputMessage {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: frame.mime_type(),
                data: super::codec::encode_base64(&frame.to_bytes()),
            }],
        },
    }
}

// ── Tool calls ─────────────────────────────────────────────────────

/// One function invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Our answer to a [`FunctionCall`], correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: serde_json::Value,
}

impl FunctionResponse {
    /// The fixed acknowledgement sent for every enquiry tool call.
    pub fn acknowledge(call: &FunctionCall) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            response: serde_json::json!({ "result": persona::ENQUIRY_TOOL_ACK }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ToolResponseMessage {
    #[serde(rename = "toolResponse")]
    pub tool_response: ToolResponse,
}

#[derive(Debug, Serialize)]
pub struct ToolResponse {
    #[serde(rename = "functionResponses")]
    pub function_responses: Vec<FunctionResponse>,
}

/// Wire format: `{"toolResponse": {"functionResponses": [{"id": .., "name": .., "response": {..}}]}}`
pub fn build_tool_response_message(responses: Vec<FunctionResponse>) -> ToolResponseMessage {
    ToolResponseMessage {
        tool_response: ToolResponse {
            function_responses: responses,
        },
    }
}

// ── Server response parsing ────────────────────────────────────────

/// Sample rate from a MIME type like `audio/pcm;rate=24000`.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("rate="))
        .and_then(|rate| rate.trim().parse().ok())
        .filter(|rate| *rate > 0)
}

fn transcription_text<'a>(
    value: &'a serde_json::Value,
    content: Option<&'a serde_json::Value>,
    key: &str,
) -> Option<&'a str> {
    content
        .and_then(|c| c.get(key))
        .or_else(|| value.get(key))
        .and_then(|t| t.get("text"))
        .and_then(|v| v.as_str())
        .filter(|text| !text.is_empty())
}

/// Parse a JSON frame from Gemini Live into a list of events.
///
/// A single server message can carry several kinds at once (audio plus
/// transcription plus turn completion). Events are returned in the order
/// they must be applied: transcripts, audio, interruption, turn completion,
/// tool calls.
pub fn parse_server_message(json_text: &str) -> Vec<LiveEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            events.push(LiveEvent::Error {
                message: format!("Failed to parse server message: {e}"),
            });
            return events;
        }
    };

    if value.get("setupComplete").is_some() {
        events.push(LiveEvent::SetupComplete);
    }

    let content = value.get("serverContent");

    // Transcriptions (user speech in, model speech out)
    if let Some(text) = transcription_text(&value, content, "inputTranscription") {
        events.push(LiveEvent::InputTranscript {
            text: text.to_string(),
        });
    }
    if let Some(text) = transcription_text(&value, content, "outputTranscription") {
        events.push(LiveEvent::OutputTranscript {
            text: text.to_string(),
        });
    }

    if let Some(content) = content {
        // Inline audio from modelTurn.parts
        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(|v| v.as_array())
        {
            for part in parts {
                let Some(inline) = part.get("inlineData") else {
                    continue;
                };
                let mime = inline
                    .get("mimeType")
                    .and_then(|v| v.as_str())
                    .unwrap_or("audio/pcm");
                if !mime.starts_with("audio/") {
                    continue;
                }
                if let Some(data) = inline.get("data").and_then(|v| v.as_str()) {
                    events.push(LiveEvent::Audio {
                        data: data.to_string(),
                        sample_rate: parse_pcm_rate(mime).unwrap_or(OUTPUT_SAMPLE_RATE),
                    });
                }
            }
        }

        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(LiveEvent::Interrupted);
        }
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(LiveEvent::TurnComplete);
        }
    }

    // toolCall.functionCalls
    if let Some(calls) = value
        .pointer("/toolCall/functionCalls")
        .and_then(|v| v.as_array())
    {
        let calls: Vec<FunctionCall> = calls
            .iter()
            .filter_map(|call| match serde_json::from_value(call.clone()) {
                Ok(call) => Some(call),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed function call");
                    None
                }
            })
            .collect();
        if !calls.is_empty() {
            events.push(LiveEvent::ToolCall { calls });
        }
    }

    // goAway: the server is about to drop us, end the session now
    if let Some(go_away) = value.get("goAway") {
        tracing::warn!(time_left = ?go_away.get("timeLeft"), "Gemini Live announced disconnect");
        events.push(LiveEvent::Closed {
            reason: Some("server sent goAway".into()),
        });
    }

    // Error
    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown server error");
        events.push(LiveEvent::Error {
            message: message.to_string(),
        });
    }

    events
}

// ── Live link (transport-neutral handle) ───────────────────────────

/// Outbound message to send to the Gemini Live WebSocket.
#[derive(Debug)]
pub enum OutboundMessage {
    /// One microphone frame (wrapped in realtimeInput).
    Audio(AudioFrame),
    /// Answers to a toolCall.
    ToolResponse(Vec<FunctionResponse>),
    /// Close the connection.
    Close,
}

/// Cloneable, non-blocking sender half of an open session.
///
/// Audio and control travel on separate queues. Sends never wait: the
/// microphone callback must not stall on the network, so a full audio queue
/// drops the frame. Tool responses and `Close` go on an unbounded queue and
/// are always delivered.
#[derive(Debug, Clone)]
pub struct LiveSender {
    audio: mpsc::Sender<AudioFrame>,
    control: mpsc::UnboundedSender<OutboundMessage>,
}

impl LiveSender {
    /// Queue one microphone frame; dropped if the audio queue is full.
    pub fn send_audio(&self, frame: AudioFrame) -> Result<(), VoiceError> {
        if frame.samples().is_empty() {
            return Ok(());
        }
        match self.audio.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("Outbound audio queue full, dropping frame");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(VoiceError::ChannelClosed),
        }
    }

    /// Queue tool-call answers.
    pub fn send_tool_response(&self, responses: Vec<FunctionResponse>) -> Result<(), VoiceError> {
        self.control
            .send(OutboundMessage::ToolResponse(responses))
            .map_err(|_| VoiceError::ChannelClosed)
    }

    /// Ask the transport to close the connection.
    pub fn close(&self) -> Result<(), VoiceError> {
        self.control
            .send(OutboundMessage::Close)
            .map_err(|_| VoiceError::ChannelClosed)
    }
}

/// Receiving end of a [`LiveSender`]. Control messages are handed out
/// before any queued audio.
#[derive(Debug)]
pub struct OutboundQueue {
    audio: mpsc::Receiver<AudioFrame>,
    control: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl OutboundQueue {
    /// Next message; `None` once every sender is gone and both queues are drained.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        tokio::select! {
            biased;
            Some(msg) = self.control.recv() => Some(msg),
            Some(frame) = self.audio.recv() => Some(OutboundMessage::Audio(frame)),
            else => None,
        }
    }

    pub fn try_recv(&mut self) -> Result<OutboundMessage, mpsc::error::TryRecvError> {
        use mpsc::error::TryRecvError;

        match self.control.try_recv() {
            Ok(msg) => Ok(msg),
            Err(control_err) => match self.audio.try_recv() {
                Ok(frame) => Ok(OutboundMessage::Audio(frame)),
                Err(TryRecvError::Disconnected) if control_err == TryRecvError::Disconnected => {
                    Err(TryRecvError::Disconnected)
                }
                Err(_) => Err(TryRecvError::Empty),
            },
        }
    }
}

/// An open session: where to send, and where server events arrive.
pub struct LiveLink {
    pub sender: LiveSender,
    pub events: mpsc::Receiver<LiveEvent>,
}

impl LiveLink {
    /// In-memory link; the returned ends play the part of the remote service.
    ///
    /// `capacity` bounds the audio and event queues.
    pub fn pair(capacity: usize) -> (Self, OutboundQueue, mpsc::Sender<LiveEvent>) {
        let (audio_tx, audio_rx) = mpsc::channel(capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(capacity);
        (
            Self {
                sender: LiveSender {
                    audio: audio_tx,
                    control: control_tx,
                },
                events: event_rx,
            },
            OutboundQueue {
                audio: audio_rx,
                control: control_rx,
            },
            event_tx,
        )
    }
}

/// Opens sessions with the remote conversational service.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Connect, send `setup`, and resolve once the service is ready to stream.
    async fn connect(&self, session_id: &str, setup: &SetupMessage) -> Result<LiveLink, VoiceError>;
}

// ── WebSocket connector ────────────────────────────────────────────

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, WsMessage>;
type WsSource = futures_util::stream::SplitStream<WsStream>;

/// [`LiveConnector`] over the real Gemini Live WebSocket.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    endpoint: String,
    api_key: String,
    setup_timeout: Duration,
}

impl GeminiLiveConnector {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, setup_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            setup_timeout,
        }
    }

    /// Wait for `setupComplete` before the stream is split.
    async fn await_setup_complete(ws_stream: &mut WsStream, session_id: &str) -> Result<(), VoiceError> {
        while let Some(msg_result) = ws_stream.next().await {
            match msg_result {
                Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                    if let Ok(text) = std::str::from_utf8(&data) {
                        if Self::check_setup_frame(text, session_id)? {
                            return Ok(());
                        }
                    }
                }
                Ok(WsMessage::Text(text)) => {
                    if Self::check_setup_frame(text.as_str(), session_id)? {
                        return Ok(());
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    return Err(VoiceError::Connection(format!(
                        "Connection closed before setupComplete: {frame:?}"
                    )));
                }
                Err(e) => {
                    return Err(VoiceError::Connection(format!(
                        "WebSocket error before setupComplete: {e}"
                    )));
                }
                other => {
                    tracing::debug!(
                        session_id = %session_id,
                        msg = ?other,
                        "Gemini Live setup phase: non-text/binary frame"
                    );
                }
            }
        }
        Err(VoiceError::Connection("Stream ended before setupComplete".into()))
    }

    /// `Ok(true)` on `setupComplete`, `Err` if the frame reports an error.
    fn check_setup_frame(text: &str, session_id: &str) -> Result<bool, VoiceError> {
        if serde_json::from_str::<serde_json::Value>(text).is_err() {
            tracing::debug!(session_id = %session_id, "Gemini Live setup phase: skipping non-JSON frame");
            return Ok(false);
        }
        let events = parse_server_message(text);
        if events.contains(&LiveEvent::SetupComplete) {
            tracing::info!(session_id = %session_id, "Gemini Live setup complete — ready to stream");
            return Ok(true);
        }
        match events.into_iter().find(|e| matches!(e, LiveEvent::Error { .. })) {
            Some(LiveEvent::Error { message }) => Err(VoiceError::Connection(message)),
            _ => Ok(false),
        }
    }

    /// Outbound loop: encode queued messages and send to the WebSocket.
    async fn outbound_loop(mut rx: OutboundQueue, mut ws_sender: WsSink, session_id: String) {
        let mut audio_chunk_count: u64 = 0;
        let mut total_bytes: u64 = 0;

        while let Some(msg) = rx.recv().await {
            let json = match msg {
                OutboundMessage::Audio(frame) => {
                    audio_chunk_count += 1;
                    total_bytes += (frame.samples().len() * super::codec::SAMPLE_WIDTH) as u64;
                    // Log first chunk and every 50th chunk
                    if audio_chunk_count == 1 || audio_chunk_count.is_multiple_of(50) {
                        tracing::info!(
                            session_id = %session_id,
                            chunk = audio_chunk_count,
                            samples = frame.samples().len(),
                            total_bytes = total_bytes,
                            "Sending audio chunk to Gemini"
                        );
                    }
                    serde_json::to_string(&build_audio_message(&frame))
                }
                OutboundMessage::ToolResponse(responses) => {
                    tracing::info!(
                        session_id = %session_id,
                        count = responses.len(),
                        "Sending toolResponse to Gemini Live"
                    );
                    serde_json::to_string(&build_tool_response_message(responses))
                }
                OutboundMessage::Close => {
                    if let Err(e) = ws_sender.send(WsMessage::Close(None)).await {
                        tracing::debug!(session_id = %session_id, error = %e, "WebSocket close failed");
                    }
                    break;
                }
            };

            match json {
                Ok(json) => {
                    if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                        tracing::warn!(
                            session_id = %session_id,
                            "WebSocket send failed, closing outbound loop"
                        );
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %session_id,
                        error = %e,
                        "Failed to serialize outbound message"
                    );
                }
            }
        }

        tracing::debug!(session_id = %session_id, "Outbound loop terminated");
    }

    /// Log one parsed event the way the inbound loop reports progress.
    fn log_event(session_id: &str, event: &LiveEvent, elapsed: f32, audio_count: &mut u64, turn_count: &mut u64) {
        match event {
            LiveEvent::Audio { data, sample_rate } => {
                *audio_count += 1;
                tracing::debug!(
                    session_id = %session_id,
                    t = format!("{elapsed:.1}s"),
                    audio_n = *audio_count,
                    b64_len = data.len(),
                    sample_rate = *sample_rate,
                    "⬇ Gemini audio response"
                );
            }
            LiveEvent::TurnComplete => {
                *turn_count += 1;
                tracing::info!(
                    session_id = %session_id,
                    t = format!("{elapsed:.1}s"),
                    turn = *turn_count,
                    audio_chunks_this_session = *audio_count,
                    "⬇ Turn complete"
                );
            }
            LiveEvent::OutputTranscript { text } => {
                tracing::debug!(session_id = %session_id, t = format!("{elapsed:.1}s"), text = %text, "⬇ Output transcript");
            }
            LiveEvent::InputTranscript { text } => {
                tracing::debug!(session_id = %session_id, t = format!("{elapsed:.1}s"), text = %text, "⬇ Input transcript");
            }
            LiveEvent::Interrupted => {
                tracing::info!(session_id = %session_id, t = format!("{elapsed:.1}s"), "⬇ Interrupted");
            }
            LiveEvent::ToolCall { calls } => {
                tracing::info!(
                    session_id = %session_id,
                    t = format!("{elapsed:.1}s"),
                    calls = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                    "⬇ Tool call"
                );
            }
            _ => {}
        }
    }

    /// Inbound loop: receive frames from Gemini Live and forward events.
    async fn inbound_loop(mut ws_receiver: WsSource, event_tx: mpsc::Sender<LiveEvent>, session_id: String) {
        let start_time = Instant::now();
        let mut audio_response_count: u64 = 0;
        let mut turn_count: u64 = 0;

        let closed = loop {
            let Some(msg_result) = ws_receiver.next().await else {
                break LiveEvent::Closed { reason: None };
            };

            let text = match msg_result {
                Ok(WsMessage::Text(text)) => text.as_str().to_string(),
                Ok(WsMessage::Binary(data)) => {
                    if data.first() != Some(&b'{') {
                        // Gemini Live sends responses as JSON-in-Binary; anything
                        // else is not a message we understand.
                        if !data.is_empty() {
                            tracing::warn!(
                                session_id = %session_id,
                                len = data.len(),
                                "Unexpected non-JSON binary frame from Gemini Live — skipping"
                            );
                        }
                        continue;
                    }
                    match std::str::from_utf8(&data) {
                        Ok(text) => text.to_string(),
                        Err(_) => continue,
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!(session_id = %session_id, close_frame = ?frame, "Gemini Live connection closed");
                    break LiveEvent::Closed {
                        reason: frame.map(|f| f.reason.as_str().to_string()),
                    };
                }
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {
                    // Handled by tungstenite automatically
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %session_id,
                        error = %e,
                        "Gemini Live WebSocket error"
                    );
                    break LiveEvent::Error {
                        message: format!("WebSocket error: {e}"),
                    };
                }
            };

            let events = parse_server_message(&text);
            let elapsed = start_time.elapsed().as_secs_f32();
            for event in events {
                Self::log_event(&session_id, &event, elapsed, &mut audio_response_count, &mut turn_count);
                if event_tx.send(event).await.is_err() {
                    tracing::debug!(
                        session_id = %session_id,
                        "Event receiver dropped, closing inbound loop"
                    );
                    return;
                }
            }
        };

        let _ = event_tx.send(closed).await;
        tracing::debug!(session_id = %session_id, "Inbound loop terminated");
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(&self, session_id: &str, setup: &SetupMessage) -> Result<LiveLink, VoiceError> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);

        tracing::info!(
            session_id = %session_id,
            model = %setup.setup.model,
            "Connecting to Gemini Live"
        );

        let (mut ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| VoiceError::Connection(format!("Failed to connect to Gemini Live: {e}")))?;

        // Send setup message on the unsplit stream
        let setup_json = serde_json::to_string(setup)
            .map_err(|e| VoiceError::Connection(format!("Failed to encode setup message: {e}")))?;
        tracing::debug!(session_id = %session_id, setup_len = setup_json.len(), "Sending Gemini Live setup");
        ws_stream
            .send(WsMessage::Text(setup_json.into()))
            .await
            .map_err(|e| VoiceError::Connection(format!("Failed to send setup message: {e}")))?;

        match tokio::time::timeout(
            self.setup_timeout,
            Self::await_setup_complete(&mut ws_stream, session_id),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(VoiceError::Connection(format!(
                    "Gemini Live setupComplete timeout ({}s)",
                    self.setup_timeout.as_secs()
                )))
            }
        }

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (link, out_rx, event_tx) = LiveLink::pair(CHANNEL_CAPACITY);

        let sid_out = session_id.to_string();
        tokio::spawn(async move {
            Self::outbound_loop(out_rx, ws_sender, sid_out).await;
        });

        let sid_in = session_id.to_string();
        tokio::spawn(async move {
            Self::inbound_loop(ws_receiver, event_tx, sid_in).await;
        });

        Ok(link)
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::codec::{self, INPUT_SAMPLE_RATE};

    #[test]
    fn build_setup_message_is_audio_only_with_voice() {
        let msg = build_setup_message(DEFAULT_MODEL, DEFAULT_VOICE);

        assert_eq!(msg.setup.model, format!("models/{DEFAULT_MODEL}"));
        assert_eq!(msg.setup.generation_config.response_modalities, vec!["AUDIO"]);
        let voice = &msg
            .setup
            .generation_config
            .speech_config
            .as_ref()
            .unwrap()
            .voice_config
            .prebuilt_voice_config
            .voice_name;
        assert_eq!(voice, "Puck");
    }

    #[test]
    fn build_setup_message_keeps_prefixed_model() {
        let msg = build_setup_message("models/custom", DEFAULT_VOICE);
        assert_eq!(msg.setup.model, "models/custom");
    }

    #[test]
    fn build_setup_message_serializes_to_json() {
        let msg = build_setup_message(DEFAULT_MODEL, DEFAULT_VOICE);
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        let setup = &json["setup"];

        assert!(setup["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("Posso"));
        assert_eq!(
            setup["tools"][0]["functionDeclarations"][0]["name"],
            "open_enquiry_form"
        );
        assert!(setup["inputAudioTranscription"].is_object());
        assert!(setup["outputAudioTranscription"].is_object());
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
    }

    #[test]
    fn build_audio_message_encodes_base64() {
        let frame = AudioFrame::from_float(&[0.0, 0.5, -0.5], INPUT_SAMPLE_RATE, 1).unwrap();
        let msg = build_audio_message(&frame);
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("realtimeInput"));
        assert!(json.contains("mediaChunks"));
        assert!(json.contains("audio/pcm;rate=16000"));
        let decoded = codec::decode_base64(&msg.realtime_input.media_chunks[0].data).unwrap();
        assert_eq!(decoded, frame.to_bytes());
    }

    #[test]
    fn build_tool_response_message_format() {
        let call = FunctionCall {
            id: "call-7".into(),
            name: "open_enquiry_form".into(),
            args: serde_json::json!({}),
        };
        let msg = build_tool_response_message(vec![FunctionResponse::acknowledge(&call)]);
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        let response = &json["toolResponse"]["functionResponses"][0];

        assert_eq!(response["id"], "call-7");
        assert_eq!(response["name"], "open_enquiry_form");
        assert_eq!(response["response"]["result"], "ok, enquiry opened successfully");
    }

    #[test]
    fn parse_setup_complete() {
        let events = parse_server_message(r#"{"setupComplete": {}}"#);
        assert_eq!(events, vec![LiveEvent::SetupComplete]);
    }

    #[test]
    fn parse_turn_complete() {
        let events = parse_server_message(r#"{"serverContent": {"turnComplete": true}}"#);
        assert_eq!(events, vec![LiveEvent::TurnComplete]);
    }

    #[test]
    fn parse_interrupted() {
        let events = parse_server_message(r#"{"serverContent": {"interrupted": true}}"#);
        assert_eq!(events, vec![LiveEvent::Interrupted]);
    }

    #[test]
    fn parse_audio_response_keeps_payload_encoded() {
        let audio_b64 = codec::encode_base64(&[10u8, 20, 30, 40]);
        let json = format!(
            r#"{{"serverContent": {{"modelTurn": {{"parts": [{{"inlineData": {{"mimeType": "audio/pcm;rate=24000", "data": "{audio_b64}"}}}}]}}}}}}"#
        );
        let events = parse_server_message(&json);
        assert_eq!(
            events,
            vec![LiveEvent::Audio {
                data: audio_b64,
                sample_rate: 24_000
            }]
        );
    }

    #[test]
    fn parse_every_audio_part() {
        let json = r#"{"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "audio/pcm;rate=16000", "data": "AAAA"}},
            {"text": "thinking"},
            {"inlineData": {"mimeType": "audio/pcm", "data": "AQAB"}},
            {"inlineData": {"mimeType": "image/png", "data": "AAAA"}}
        ]}}}"#;
        let events = parse_server_message(json);
        assert_eq!(
            events,
            vec![
                LiveEvent::Audio {
                    data: "AAAA".into(),
                    sample_rate: 16_000
                },
                LiveEvent::Audio {
                    data: "AQAB".into(),
                    sample_rate: OUTPUT_SAMPLE_RATE
                },
            ]
        );
    }

    #[test]
    fn parse_transcriptions_under_server_content() {
        let json = r#"{"serverContent": {
            "inputTranscription": {"text": "I want a quote"},
            "outputTranscription": {"text": "Certainly"}
        }}"#;
        let events = parse_server_message(json);
        assert_eq!(
            events,
            vec![
                LiveEvent::InputTranscript {
                    text: "I want a quote".into()
                },
                LiveEvent::OutputTranscript {
                    text: "Certainly".into()
                },
            ]
        );
    }

    #[test]
    fn parse_top_level_transcription() {
        let events = parse_server_message(r#"{"outputTranscription": {"text": "Hello"}}"#);
        assert_eq!(
            events,
            vec![LiveEvent::OutputTranscript {
                text: "Hello".into()
            }]
        );
    }

    #[test]
    fn parse_text_before_turn_complete() {
        let json = r#"{"serverContent": {"outputTranscription": {"text": "Bye"}, "turnComplete": true}}"#;
        let events = parse_server_message(json);
        assert_eq!(
            events,
            vec![
                LiveEvent::OutputTranscript { text: "Bye".into() },
                LiveEvent::TurnComplete
            ]
        );
    }

    #[test]
    fn parse_tool_call() {
        let json = r#"{"toolCall": {"functionCalls": [
            {"id": "fc-1", "name": "open_enquiry_form", "args": {"customer_name": "Jane Doe"}}
        ]}}"#;
        let events = parse_server_message(json);
        match &events[..] {
            [LiveEvent::ToolCall { calls }] => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].id, "fc-1");
                assert_eq!(calls[0].name, "open_enquiry_form");
                assert_eq!(calls[0].args["customer_name"], "Jane Doe");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn parse_error() {
        let events = parse_server_message(r#"{"error": {"message": "Rate limit exceeded"}}"#);
        assert!(events.iter().any(|e| matches!(
            e,
            LiveEvent::Error { message } if message.contains("Rate limit")
        )));
    }

    #[test]
    fn parse_invalid_json() {
        let events = parse_server_message("not json at all");
        assert!(events.iter().any(|e| matches!(e, LiveEvent::Error { .. })));
    }

    #[test]
    fn parse_empty_transcription_ignored() {
        let events = parse_server_message(r#"{"serverContent": {"inputTranscription": {"text": ""}}}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn parse_go_away_closes() {
        let events = parse_server_message(r#"{"goAway": {"timeLeft": "5s"}}"#);
        assert!(matches!(&events[..], [LiveEvent::Closed { reason: Some(_) }]));
    }

    #[test]
    fn pcm_rate_from_mime() {
        assert_eq!(parse_pcm_rate("audio/pcm;rate=24000"), Some(24_000));
        assert_eq!(parse_pcm_rate("audio/pcm; rate=16000"), Some(16_000));
        assert_eq!(parse_pcm_rate("audio/pcm"), None);
        assert_eq!(parse_pcm_rate("audio/pcm;rate=0"), None);
    }

    #[tokio::test]
    async fn live_sender_queues_and_reports_closed() {
        let (link, mut out_rx, _event_tx) = LiveLink::pair(4);
        let frame = AudioFrame::from_float(&[0.25; 8], INPUT_SAMPLE_RATE, 1).unwrap();

        link.sender.send_audio(frame.clone()).unwrap();
        assert!(matches!(out_rx.recv().await, Some(OutboundMessage::Audio(f)) if f == frame));
        link.sender.close().unwrap();
        assert!(matches!(out_rx.recv().await, Some(OutboundMessage::Close)));

        drop(out_rx);
        assert!(matches!(
            link.sender.send_tool_response(Vec::new()),
            Err(VoiceError::ChannelClosed)
        ));
        assert!(matches!(link.sender.send_audio(frame), Err(VoiceError::ChannelClosed)));
    }

    #[test]
    fn full_audio_queue_drops_frames_but_not_control() {
        let (link, mut out_rx, _event_tx) = LiveLink::pair(1);
        let frame = AudioFrame::from_float(&[0.1; 4], INPUT_SAMPLE_RATE, 1).unwrap();
        link.sender.send_audio(frame.clone()).unwrap();
        // Does not fit; dropped rather than blocking.
        link.sender.send_audio(frame).unwrap();

        let call = FunctionCall {
            id: "fc-1".into(),
            name: persona::ENQUIRY_TOOL_NAME.into(),
            args: serde_json::Value::Null,
        };
        link.sender
            .send_tool_response(vec![FunctionResponse::acknowledge(&call)])
            .unwrap();
        link.sender.close().unwrap();

        // Control jumps the queued audio.
        assert!(matches!(out_rx.try_recv(), Ok(OutboundMessage::ToolResponse(r)) if r[0].id == "fc-1"));
        assert!(matches!(out_rx.try_recv(), Ok(OutboundMessage::Close)));
        assert!(matches!(out_rx.try_recv(), Ok(OutboundMessage::Audio(_))));
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn outbound_queue_ends_when_senders_drop() {
        let (link, mut out_rx, _event_tx) = LiveLink::pair(4);
        drop(link);
        assert!(out_rx.recv().await.is_none());
        assert_eq!(
            out_rx.try_recv().unwrap_err(),
            mpsc::error::TryRecvError::Disconnected
        );
    }

    #[test]
    fn setup_frames_complete_fail_or_wait() {
        assert!(GeminiLiveConnector::check_setup_frame(r#"{"setupComplete": {}}"#, "s").unwrap());
        assert!(!GeminiLiveConnector::check_setup_frame(r#"{"serverContent": {}}"#, "s").unwrap());
        assert!(!GeminiLiveConnector::check_setup_frame("not json", "s").unwrap());

        let err = GeminiLiveConnector::check_setup_frame(
            r#"{"error": {"message": "API key not valid"}}"#,
            "s",
        )
        .unwrap_err();
        assert!(matches!(err, VoiceError::Connection(m) if m.contains("API key not valid")));
    }
}
