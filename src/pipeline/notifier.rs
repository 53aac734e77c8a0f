//! Success/failure replies.

use std::sync::Arc;

use tracing::info;

use crate::channels::transport::{OutboundTransport, OutgoingMail};
use crate::error::DeliveryError;

pub const SUCCESS_SUBJECT: &str = "Verification succeeded";
pub const FAILURE_SUBJECT: &str = "Verification failed";
const FAILURE_TEXT: &str = "Invalid message";

/// Composes fixed-template replies and hands them to the outbound transport.
///
/// Failures are returned, never retried.
pub struct Notifier {
    outbound: Arc<dyn OutboundTransport>,
    from: String,
    success_link: String,
}

impl Notifier {
    pub fn new(
        outbound: Arc<dyn OutboundTransport>,
        from: impl Into<String>,
        success_link: impl Into<String>,
    ) -> Self {
        Self {
            outbound,
            from: from.into(),
            success_link: success_link.into(),
        }
    }

    /// Reply with the follow-up link. Returns the sent message id.
    pub async fn send_success(&self, to: &str) -> Result<String, DeliveryError> {
        let mail = self.success_mail(to);
        let message_id = self.outbound.send(mail).await?;
        info!(to = %to, message_id = %message_id, "Success reply sent");
        Ok(message_id)
    }

    /// Reply with a generic rejection. `reason` is logged, not mailed.
    pub async fn send_failure(&self, to: &str, reason: &str) -> Result<String, DeliveryError> {
        let mail = self.failure_mail(to);
        let message_id = self.outbound.send(mail).await?;
        info!(to = %to, message_id = %message_id, reason = %reason, "Failure reply sent");
        Ok(message_id)
    }

    fn success_mail(&self, to: &str) -> OutgoingMail {
        OutgoingMail {
            from: self.from.clone(),
            to: to.to_string(),
            subject: SUCCESS_SUBJECT.to_string(),
            html_body: format!(
                r#"<a href="{}">Continue to the next stage</a>"#,
                self.success_link
            ),
            text_body: format!("Next stage: {}", self.success_link),
        }
    }

    fn failure_mail(&self, to: &str) -> OutgoingMail {
        OutgoingMail {
            from: self.from.clone(),
            to: to.to_string(),
            subject: FAILURE_SUBJECT.to_string(),
            html_body: format!("<b>{FAILURE_TEXT}</b>"),
            text_body: FAILURE_TEXT.to_string(),
        }
    }
}
