//! Session Channel: the connection state machine.
//!
//! `SessionChannel` owns everything a live session holds (outbound sender,
//! capture pipeline, playback scheduler, per-role text buffers) and mutates
//! it only from the single event-processing task. It is synchronous: the
//! suspension points (microphone, connect) live in [`super::assistant`],
//! which reports their outcome back here tagged with the generation that
//! requested them.
//!
//! ```text
//! Disconnected ──start──▶ Connecting ──opened──▶ Connected
//!      ▲                      │                     │
//!      └────stop / close──────┴─────────────────────┤
//!                             │                     │
//!                             └──fail──▶ Error ◀────┘
//! ```

use chrono::Local;
use serde::Serialize;

use super::capture::{CapturePipeline, InputSource};
use super::codec;
use super::gemini_live::{FunctionCall, FunctionResponse, LiveSender};
use super::persona::ENQUIRY_TOOL_NAME;
use super::playback::{AudioOutput, PlaybackHandle, PlaybackScheduler};
use super::transcript::{Feedback, Role, TranscriptAssembler, TranscriptEntry};
use super::LiveEvent;
use crate::enquiry::EnquiryBridge;
use crate::error::VoiceError;

/// Shown when the microphone or the connection could not be set up.
pub const START_FAILURE_MESSAGE: &str = "Could not access microphone or connect to AI.";

/// Shown when the remote side reports an error mid-session.
pub const CONNECTION_ERROR_MESSAGE: &str = "Connection error occurred.";

/// Connection state exposed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// What the UI renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub state: ConnectionState,
    pub transcript: Vec<TranscriptEntry>,
    pub last_error: Option<String>,
    pub recording: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            transcript: Vec::new(),
            last_error: None,
            recording: false,
        }
    }
}

pub struct SessionChannel {
    state: ConnectionState,
    generation: u64,
    link: Option<LiveSender>,
    capture: Option<CapturePipeline>,
    playback: PlaybackScheduler,
    user_text: String,
    assistant_text: String,
    transcript: TranscriptAssembler,
    enquiries: EnquiryBridge,
    last_error: Option<String>,
    frame_size: usize,
}

impl SessionChannel {
    pub fn new(output: Box<dyn AudioOutput>, enquiries: EnquiryBridge, frame_size: usize) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            link: None,
            capture: None,
            playback: PlaybackScheduler::new(output),
            user_text: String::new(),
            assistant_text: String::new(),
            transcript: TranscriptAssembler::new(),
            enquiries,
            last_error: None,
            frame_size,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Tear down whatever is running and begin a new session.
    ///
    /// Returns the generation the caller must tag the connect outcome and
    /// every server event of this session with.
    pub fn start(&mut self) -> u64 {
        self.teardown();
        self.generation += 1;
        self.last_error = None;
        self.state = ConnectionState::Connecting;
        tracing::info!(generation = self.generation, "Voice session connecting");
        self.generation
    }

    /// The connection for `generation` is open and the microphone granted.
    ///
    /// Returns false when the result is stale; the source and link are then
    /// released here.
    pub fn on_open(&mut self, generation: u64, source: Box<dyn InputSource>, sender: LiveSender) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            tracing::debug!(
                generation,
                current = self.generation,
                state = %self.state,
                "Discarding stale connection result"
            );
            if let Err(e) = sender.close() {
                tracing::debug!(error = %e, "Stale link already closed");
            }
            let mut source = source;
            if let Err(e) = source.stop() {
                tracing::debug!(error = %e, "Stale input source stop failed");
            }
            return false;
        }

        let mut capture = CapturePipeline::new(source, self.frame_size);
        let frame_sender = sender.clone();
        let started = capture.start(move |frame| {
            // Fire-and-forget; a closed channel means teardown is under way.
            if let Err(e) = frame_sender.send_audio(frame) {
                tracing::trace!(error = %e, "Dropping captured frame");
            }
        });

        self.link = Some(sender);
        self.capture = Some(capture);

        match started {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                tracing::info!(generation, "Voice session connected");
                true
            }
            Err(e) => {
                self.fail(START_FAILURE_MESSAGE, &e);
                false
            }
        }
    }

    /// Microphone acquisition or connect failed for `generation`.
    pub fn on_start_failed(&mut self, generation: u64, error: VoiceError) {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            tracing::debug!(generation, error = %error, "Ignoring failure of a superseded start");
            return;
        }
        self.fail(START_FAILURE_MESSAGE, &error);
    }

    /// User-initiated stop. No-op unless connecting or connected.
    pub fn stop(&mut self) {
        if !self.is_live() {
            return;
        }
        self.teardown();
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        tracing::info!("Voice session stopped by user");
    }

    fn fail(&mut self, message: &str, cause: &VoiceError) {
        tracing::error!(error = %cause, "Voice session failed");
        self.last_error = Some(message.to_string());
        self.teardown();
        self.state = ConnectionState::Error;
    }

    /// Release everything the session holds. Idempotent; every step runs
    /// even if an earlier one fails.
    fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            if let Err(e) = link.close() {
                tracing::debug!(error = %e, "Link close during teardown failed");
            }
        }
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.stop() {
                tracing::warn!(error = %e, "Capture stop during teardown failed");
            }
        }
        self.playback.stop_all();
        self.user_text.clear();
        self.assistant_text.clear();
    }

    fn is_live(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    // ── Server events ────────────────────────────────────────────

    /// Dispatch one server event of `generation`.
    pub fn handle_event(&mut self, generation: u64, event: LiveEvent) {
        if generation != self.generation || !self.is_live() {
            tracing::trace!(generation, "Dropping event from a closed session");
            return;
        }

        match event {
            LiveEvent::SetupComplete => {}
            LiveEvent::InputTranscript { text } => self.user_text.push_str(&text),
            LiveEvent::OutputTranscript { text } => self.assistant_text.push_str(&text),
            LiveEvent::TurnComplete => self.flush_turn(),
            LiveEvent::Audio { data, sample_rate } => self.play_audio(&data, sample_rate),
            LiveEvent::Interrupted => {
                tracing::debug!("Barge-in, flushing playback");
                self.playback.stop_all();
            }
            LiveEvent::ToolCall { calls } => self.handle_tool_calls(calls),
            LiveEvent::Error { message } => {
                self.fail(CONNECTION_ERROR_MESSAGE, &VoiceError::Connection(message));
            }
            LiveEvent::Closed { reason } => {
                tracing::info!(reason = ?reason, "Voice session closed by remote");
                self.teardown();
                self.state = ConnectionState::Disconnected;
            }
        }
    }

    /// Commit the user entry, then the assistant entry, then clear both.
    fn flush_turn(&mut self) {
        let user = std::mem::take(&mut self.user_text);
        let assistant = std::mem::take(&mut self.assistant_text);
        self.transcript.commit(Role::User, &user);
        self.transcript.commit(Role::Assistant, &assistant);
    }

    fn play_audio(&mut self, data: &str, sample_rate: u32) {
        let buffer = match codec::decode_audio_payload(data, sample_rate, 1) {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed audio chunk");
                return;
            }
        };
        if let Err(e) = self.playback.enqueue(buffer) {
            tracing::warn!(error = %e, "Failed to schedule audio chunk");
        }
    }

    fn handle_tool_calls(&mut self, calls: Vec<FunctionCall>) {
        let mut responses = Vec::with_capacity(calls.len());
        for call in &calls {
            if call.name == ENQUIRY_TOOL_NAME {
                // Acknowledged even when invalid so the model's turn can go on.
                if let Err(e) = self.enquiries.submit(&call.args, Local::now()) {
                    tracing::warn!(call_id = %call.id, error = %e, "Enquiry rejected");
                }
                responses.push(FunctionResponse::acknowledge(call));
            } else {
                tracing::warn!(call_id = %call.id, name = %call.name, "Unknown function requested");
                responses.push(FunctionResponse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    response: serde_json::json!({ "error": format!("unknown function `{}`", call.name) }),
                });
            }
        }

        if let Some(link) = &self.link {
            if let Err(e) = link.send_tool_response(responses) {
                tracing::warn!(error = %e, "Failed to send tool response");
            }
        }
    }

    // ── Playback completions & UI ────────────────────────────────

    pub fn on_playback_ended(&mut self, handle: PlaybackHandle) {
        self.playback.on_ended(handle);
    }

    pub fn set_feedback(&mut self, index: usize, tag: Feedback) {
        self.transcript.set_feedback(index, tag);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        self.transcript.entries()
    }

    pub fn is_recording(&self) -> bool {
        self.capture.as_ref().is_some_and(CapturePipeline::is_running)
    }

    pub fn active_playback(&self) -> usize {
        self.playback.active_count()
    }

    pub fn pending_text(&self) -> (&str, &str) {
        (&self.user_text, &self.assistant_text)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state,
            transcript: self.transcript.entries().to_vec(),
            last_error: self.last_error.clone(),
            recording: self.is_recording(),
        }
    }
}
