//! Message pipeline.
//!
//! Every unseen message flows through:
//! 1. `DedupLedger::add()` skips ids already handled this session
//! 2. `parse_message()` extracts sender, subject and body
//! 3. `Validator::validate()` checks the required subject and content
//! 4. `Notifier` sends the success or failure reply

pub mod ledger;
pub mod notifier;
pub mod processor;
pub mod types;
pub mod validator;

pub use ledger::DedupLedger;
pub use notifier::Notifier;
pub use processor::MessageProcessor;
pub use types::{ParsedMessage, ProcessOutcome, Verdict};
pub use validator::Validator;
