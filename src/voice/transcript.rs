//! Committed conversation transcript.
//!
//! Partial text is accumulated by the session; this module only holds the
//! entries committed at turn boundaries plus the UI feedback annotation.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Who spoke a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Thumbs up/down annotation set from the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Up,
    Down,
}

/// One committed turn of speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Local>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
}

/// Append-only list of committed entries; insertion order is display order.
#[derive(Debug, Clone, Default)]
pub struct TranscriptAssembler {
    entries: Vec<TranscriptEntry>,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit `text` for `role` stamped with the current time.
    ///
    /// Empty text is ignored. Returns whether an entry was appended.
    pub fn commit(&mut self, role: Role, text: &str) -> bool {
        self.commit_at(role, text, Local::now())
    }

    pub fn commit_at(&mut self, role: Role, text: &str, timestamp: DateTime<Local>) -> bool {
        if text.is_empty() {
            return false;
        }
        self.entries.push(TranscriptEntry {
            role,
            text: text.to_string(),
            timestamp,
            feedback: None,
        });
        true
    }

    /// Set (or replace) the feedback tag of entry `index`.
    ///
    /// Out-of-range indices are ignored.
    pub fn set_feedback(&mut self, index: usize, tag: Feedback) -> bool {
        match self.entries.get_mut(index) {
            Some(entry) => {
                entry.feedback = Some(tag);
                tracing::debug!(index, feedback = ?tag, "Transcript feedback recorded");
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }
}
