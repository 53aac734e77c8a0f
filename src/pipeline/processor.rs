//! Message processor: parses raw mail, validates it and dispatches the reply.
//!
//! Flow:
//! 1. Parse (malformed input is logged and dropped)
//! 2. Self-loop check against the gate's own address
//! 3. Validate subject + body
//! 4. Success or failure reply, sent in the background
//!
//! Nothing in here propagates an error: one bad message never stops the poller.

use std::sync::Arc;

use mail_parser::MessageParser;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::channels::transport::MessageUid;
use crate::error::ParseError;
use crate::pipeline::notifier::Notifier;
use crate::pipeline::types::{ParsedMessage, ProcessOutcome, UNKNOWN_SENDER};
use crate::pipeline::validator::Validator;

/// Characters of body shown in the processing log line.
const BODY_PREVIEW_CHARS: usize = 100;

/// Turns raw messages into replies.
pub struct MessageProcessor {
    validator: Validator,
    notifier: Arc<Notifier>,
    own_address: String,
    replies: JoinSet<()>,
}

impl MessageProcessor {
    pub fn new(validator: Validator, notifier: Arc<Notifier>, own_address: impl Into<String>) -> Self {
        Self {
            validator,
            notifier,
            own_address: own_address.into(),
            replies: JoinSet::new(),
        }
    }

    /// Handle one raw message. The reply, if any, is dispatched in the background.
    pub fn process(&mut self, raw: &[u8], uid: MessageUid) -> ProcessOutcome {
        let parsed = match parse_message(raw, uid) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(uid = %uid, error = %e, "Failed to parse message");
                return ProcessOutcome::Unparseable;
            }
        };

        info!(
            uid = %uid,
            sender = %parsed.sender,
            subject = %parsed.subject,
            preview = %preview(&parsed.body),
            "Processing new message"
        );

        if parsed.sender.eq_ignore_ascii_case(&self.own_address) {
            debug!(uid = %uid, "Skipping self-sent message");
            return ProcessOutcome::SkippedSelf;
        }

        let verdict = self.validator.validate(&parsed.subject, &parsed.body);
        let notifier = Arc::clone(&self.notifier);
        let to = parsed.sender;

        match verdict.reason {
            None => {
                info!(uid = %uid, to = %to, "Message accepted, sending success reply");
                let recipient = to.clone();
                self.replies.spawn(async move {
                    if let Err(e) = notifier.send_success(&recipient).await {
                        error!(to = %recipient, error = %e, "Failed to send success reply");
                    }
                });
                ProcessOutcome::Accepted { to }
            }
            Some(reason) => {
                info!(uid = %uid, to = %to, reason = %reason, "Message rejected, sending failure reply");
                let recipient = to.clone();
                let why = reason.clone();
                self.replies.spawn(async move {
                    if let Err(e) = notifier.send_failure(&recipient, &why).await {
                        error!(to = %recipient, error = %e, "Failed to send failure reply");
                    }
                });
                ProcessOutcome::Rejected { to, reason }
            }
        }
    }

    /// Number of replies still in flight.
    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }

    /// Collect replies that already finished, without waiting.
    pub fn reap_replies(&mut self) {
        while let Some(result) = self.replies.try_join_next() {
            log_reply_join(result);
        }
    }

    /// Wait for every outstanding reply.
    pub async fn drain_replies(&mut self) {
        while let Some(result) = self.replies.join_next().await {
            log_reply_join(result);
        }
    }
}

fn log_reply_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        warn!(error = %e, "Reply task did not complete");
    }
}

/// Parse raw bytes into the fields the gate validates.
pub fn parse_message(raw: &[u8], uid: MessageUid) -> Result<ParsedMessage, ParseError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty { uid });
    }

    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or(ParseError::Malformed { uid })?;

    Ok(ParsedMessage {
        sender: extract_sender(&parsed),
        subject: parsed.subject().unwrap_or_default().to_string(),
        body: extract_text(&parsed),
    })
}

/// First `From` address, or [`UNKNOWN_SENDER`].
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| UNKNOWN_SENDER.into())
}

/// Readable text: the plain part, else the HTML part stripped of tags.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn preview(body: &str) -> String {
    let mut chars = body.chars();
    let head: String = chars.by_ref().take(BODY_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
