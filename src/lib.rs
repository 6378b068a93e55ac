//! Posso voice assistant core.
//!
//! Streams microphone audio to Gemini Live, plays back the synthesized reply
//! without gaps, keeps a committed transcript and turns the model's
//! `open_enquiry_form` tool calls into sales enquiries for a hand-off
//! collaborator (WhatsApp by default).

pub mod config;
pub mod enquiry;
pub mod error;
pub mod voice;

pub use config::Config;
pub use error::VoiceError;
