//! Subject/content rule check.
//!
//! A message passes when its subject contains the required subject and its
//! body contains the required content, both compared case-insensitively.

use tracing::debug;

use crate::config::RulesConfig;
use crate::pipeline::types::Verdict;

/// Prefix of every rejection reason.
pub const REASON_PREFIX: &str = "Message rejected: ";

/// Checks messages against the configured rules.
#[derive(Debug, Clone)]
pub struct Validator {
    required_subject: String,
    required_content: String,
    subject_needle: String,
    content_needle: String,
}

impl Validator {
    pub fn new(required_subject: impl Into<String>, required_content: impl Into<String>) -> Self {
        let required_subject = required_subject.into();
        let required_content = required_content.into();
        Self {
            subject_needle: required_subject.to_lowercase(),
            content_needle: required_content.to_lowercase(),
            required_subject,
            required_content,
        }
    }

    pub fn from_rules(rules: &RulesConfig) -> Self {
        Self::new(&rules.required_subject, &rules.required_content)
    }

    pub fn validate(&self, subject: &str, body: &str) -> Verdict {
        let subject_ok = subject.to_lowercase().contains(&self.subject_needle);
        let content_ok = body.to_lowercase().contains(&self.content_needle);

        debug!(
            subject_ok,
            content_ok,
            required_subject = %self.required_subject,
            received_subject = %subject,
            "Validated message"
        );

        if subject_ok && content_ok {
            return Verdict::pass();
        }

        let mut reason = String::from(REASON_PREFIX);
        if !subject_ok {
            reason.push_str(&self.subject_clause());
        }
        if !content_ok {
            reason.push_str(&self.content_clause());
        }
        Verdict::fail(reason)
    }

    /// Reason clause for a failed subject check.
    pub fn subject_clause(&self) -> String {
        format!("subject must contain \"{}\"; ", self.required_subject)
    }

    /// Reason clause for a failed content check.
    pub fn content_clause(&self) -> String {
        format!("content must contain \"{}\"; ", self.required_content)
    }
}
