//! Error taxonomy for the voice session core.
//!
//! Only `PermissionDenied` and `Connection` are fatal to a session. `Decode`
//! drops the offending audio chunk, `InvalidEnquiry` drops the enquiry but the
//! tool call is still acknowledged. Playback stop failures never leave the
//! scheduler.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoiceError {
    /// Microphone access was refused or no input device could be opened.
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    /// Transport-level failure while connecting or mid-session.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed audio payload (bad base64, odd byte length, bad format).
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Tool-call arguments could not be turned into an enquiry.
    #[error("Invalid enquiry: {0}")]
    InvalidEnquiry(String),

    /// Audio device failure that is not a permission problem.
    #[error("Audio device error: {0}")]
    Device(String),

    /// The outbound channel to the remote service is gone.
    #[error("Channel closed")]
    ChannelClosed,
}
