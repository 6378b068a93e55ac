//! Real-time voice session core for the Posso assistant.
//!
//! Streams microphone audio to Gemini Live, plays the synthesized reply,
//! assembles the transcript and turns `open_enquiry_form` tool calls into
//! enquiries.
//!
//! ## Design
//! - Pure PCM framing in [`codec`], shared by both audio directions
//! - Trait seams for the platform: [`capture::InputSource`],
//!   [`playback::AudioOutput`] and [`gemini_live::LiveConnector`]
//! - One synchronous state machine ([`session::SessionChannel`]) driven by a
//!   single async task ([`assistant`]); no locks around session state
//! - Every inbound event is tagged with a session generation so results from
//!   a torn-down session are discarded

pub mod assistant;
pub mod capture;
pub mod codec;
#[cfg(feature = "audio-device")]
pub mod device;
pub mod gemini_live;
pub mod persona;
pub mod playback;
pub mod session;
pub mod transcript;

// ── Server event type ────────────────────────────────────────────

/// Event produced by the live connection, one per payload kind.
///
/// A single server message may yield several of these; they are dispatched
/// in the order the parser returns them.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Service setup completed; ready to stream.
    SetupComplete,
    /// Synthesized speech chunk, still base64 PCM16 as received.
    Audio { data: String, sample_rate: u32 },
    /// Partial transcription of the user's speech.
    InputTranscript { text: String },
    /// Partial transcription of the assistant's speech.
    OutputTranscript { text: String },
    /// Model finished a response turn.
    TurnComplete,
    /// The user barged in; queued speech must stop.
    Interrupted,
    /// The model wants one or more functions invoked.
    ToolCall { calls: Vec<gemini_live::FunctionCall> },
    /// Error from the service or the transport.
    Error { message: String },
    /// Connection closed by the remote side.
    Closed { reason: Option<String> },
}

pub use assistant::{Assistant, AssistantHandle};
pub use capture::{CapturePipeline, InputSource, MicrophoneAccess};
pub use codec::{AudioBuffer, AudioFrame};
pub use gemini_live::{FunctionCall, GeminiLiveConnector, LiveConnector, LiveLink, LiveSender, OutboundQueue};
pub use playback::{AudioOutput, PlaybackHandle, PlaybackScheduler};
pub use session::{ConnectionState, SessionChannel, Snapshot};
pub use transcript::{Feedback, Role, TranscriptAssembler, TranscriptEntry};
