//! Sales enquiries captured from `open_enquiry_form` tool calls.
//!
//! The model collects the customer's details by voice and then calls the
//! tool; [`EnquiryBridge`] validates the arguments and hands the resulting
//! [`Enquiry`] to whatever [`EnquiryHandoff`] the application installed.
//! The core keeps no copy once the hand-off has been invoked.

pub mod whatsapp;

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;

use crate::error::VoiceError;

/// Shown downstream when the customer did not name a product.
pub const PRODUCT_INTEREST_PLACEHOLDER: &str = "General Info";

/// Shown downstream when the customer gave no extra notes.
pub const NOTES_PLACEHOLDER: &str = "No additional notes";

/// A validated lead, immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Enquiry {
    pub customer_name: String,
    pub phone_number: String,
    pub email_address: String,
    pub product_interest: String,
    pub notes: String,
    pub timestamp: DateTime<Local>,
}

fn string_arg<'a>(args: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn required_arg(args: &serde_json::Value, key: &str) -> Result<String, VoiceError> {
    string_arg(args, key)
        .map(str::to_string)
        .ok_or_else(|| VoiceError::InvalidEnquiry(format!("missing or empty `{key}`")))
}

impl Enquiry {
    /// Build an enquiry from the tool call's JSON arguments.
    ///
    /// `customer_name`, `phone_number` and `email_address` must be non-empty
    /// strings. Missing optional fields take their placeholder text.
    pub fn from_tool_args(args: &serde_json::Value, now: DateTime<Local>) -> Result<Self, VoiceError> {
        if !args.is_object() {
            return Err(VoiceError::InvalidEnquiry(
                "tool arguments are not an object".into(),
            ));
        }

        Ok(Self {
            customer_name: required_arg(args, "customer_name")?,
            phone_number: required_arg(args, "phone_number")?,
            email_address: required_arg(args, "email_address")?,
            product_interest: string_arg(args, "product_interest")
                .unwrap_or(PRODUCT_INTEREST_PLACEHOLDER)
                .to_string(),
            notes: string_arg(args, "notes")
                .unwrap_or(NOTES_PLACEHOLDER)
                .to_string(),
            timestamp: now,
        })
    }
}

/// Receives each enquiry exactly once. Implementations own everything that
/// happens afterwards (building a message, asking the user to confirm).
pub trait EnquiryHandoff: Send + Sync {
    fn hand_off(&self, enquiry: Enquiry);
}

/// Validates tool arguments and forwards good enquiries to the hand-off.
#[derive(Clone)]
pub struct EnquiryBridge {
    handoff: Arc<dyn EnquiryHandoff>,
}

impl EnquiryBridge {
    pub fn new(handoff: Arc<dyn EnquiryHandoff>) -> Self {
        Self { handoff }
    }

    /// Build the enquiry and, on success, invoke the hand-off once.
    ///
    /// The returned copy is for logging by the caller only.
    pub fn submit(&self, args: &serde_json::Value, now: DateTime<Local>) -> Result<Enquiry, VoiceError> {
        let enquiry = Enquiry::from_tool_args(args, now)?;
        tracing::info!(
            customer = %enquiry.customer_name,
            product = %enquiry.product_interest,
            "Enquiry captured, handing off"
        );
        self.handoff.hand_off(enquiry.clone());
        Ok(enquiry)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Hand-off that just records what it was given.
    #[derive(Default)]
    pub struct RecordingHandoff {
        pub received: Mutex<Vec<Enquiry>>,
    }

    impl EnquiryHandoff for RecordingHandoff {
        fn hand_off(&self, enquiry: Enquiry) {
            self.received.lock().push(enquiry);
        }
    }
}
