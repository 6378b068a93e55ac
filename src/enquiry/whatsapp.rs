//! WhatsApp hand-off: turns an enquiry into a pre-filled `wa.me` link.
//!
//! Sending stays with the user; we only prepare the link and pass it on.

use tokio::sync::mpsc;

use super::{Enquiry, EnquiryHandoff};

/// Base URL for WhatsApp click-to-chat links.
const WA_ME_BASE: &str = "https://wa.me";

/// A message ready for the user to confirm and send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMessage {
    pub customer_name: String,
    pub url: String,
}

/// Render the message body the sales team receives.
pub fn message_body(enquiry: &Enquiry) -> String {
    format!(
        "*New Sales Enquiry from Posso AI*\n\n\
         *Name:* {}\n\
         *Phone:* {}\n\
         *Email:* {}\n\
         *Interested In:* {}\n\
         *Notes:* {}\n\n\
         _Sent via Posso AI Assistant_",
        enquiry.customer_name,
        enquiry.phone_number,
        enquiry.email_address,
        enquiry.product_interest,
        enquiry.notes,
    )
}

/// Build the click-to-chat URL for `number` (international format, digits only).
pub fn build_link(number: &str, enquiry: &Enquiry) -> String {
    let digits: String = number.chars().filter(char::is_ascii_digit).collect();
    format!(
        "{WA_ME_BASE}/{digits}?text={}",
        urlencoding::encode(&message_body(enquiry))
    )
}

/// Hand-off that prepares a WhatsApp link and forwards it to the UI.
pub struct WhatsAppHandoff {
    number: String,
    tx: mpsc::UnboundedSender<PreparedMessage>,
}

impl WhatsAppHandoff {
    pub fn new(number: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<PreparedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                number: number.into(),
                tx,
            },
            rx,
        )
    }
}

impl EnquiryHandoff for WhatsAppHandoff {
    fn hand_off(&self, enquiry: Enquiry) {
        let url = build_link(&self.number, &enquiry);
        tracing::info!(customer = %enquiry.customer_name, "Enquiry ready for WhatsApp");
        if self
            .tx
            .send(PreparedMessage {
                customer_name: enquiry.customer_name,
                url,
            })
            .is_err()
        {
            tracing::warn!("WhatsApp hand-off receiver dropped; enquiry link discarded");
        }
    }
}
