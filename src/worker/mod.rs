//! Mailbox session worker.
//!
//! - `state`: session state machine, observable through a watch channel
//! - `poller`: one task per session, runs discovery cycles
//! - `supervisor`: connects, runs the poller, reconnects after it ends

pub mod poller;
pub mod state;
pub mod supervisor;

pub use poller::{DisconnectCause, MailboxPoller, SessionReport};
pub use state::{SessionState, StateCell};
pub use supervisor::ConnectionSupervisor;
