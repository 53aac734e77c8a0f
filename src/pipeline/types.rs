//! Types flowing through the message pipeline.

/// Sender placeholder when a message has no usable `From` address.
pub const UNKNOWN_SENDER: &str = "unknown";

/// The fields of an inbound message the gate cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    /// Sender address, or [`UNKNOWN_SENDER`].
    pub sender: String,
    /// Subject line (empty when absent).
    pub subject: String,
    /// Readable body text.
    pub body: String,
}

/// Result of checking a message against the gate rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub valid: bool,
    /// Every failed check, in rule order. `None` when valid.
    pub reason: Option<String>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// What the processor did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The raw bytes could not be parsed; nothing was sent.
    Unparseable,
    /// Sent by the gate's own address; nothing was sent.
    SkippedSelf,
    /// Passed validation; a success reply was dispatched.
    Accepted { to: String },
    /// Failed validation; a failure reply was dispatched.
    Rejected { to: String, reason: String },
}

impl ProcessOutcome {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unparseable => "unparseable",
            Self::SkippedSelf => "skipped_self",
            Self::Accepted { .. } => "accepted",
            Self::Rejected { .. } => "rejected",
        }
    }
}
