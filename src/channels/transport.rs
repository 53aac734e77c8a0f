//! Transport contracts consumed by the gate core.
//!
//! The poller and processor only talk to these traits; `imap` and `smtp`
//! provide the production implementations and tests plug in fakes.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{ConnectionError, DeliveryError, FlagError, MailboxError};

/// Identifier of a message inside one mailbox session (an IMAP UID).
///
/// Not guaranteed stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageUid(pub u32);

impl fmt::Display for MessageUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the server reported when the inbox was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxInfo {
    /// Total number of messages in the mailbox.
    pub exists: u32,
    pub uid_validity: Option<u32>,
}

/// Unsolicited events pushed by the inbound transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxEvent {
    /// This many new messages arrived.
    NewMail(u32),
    /// The connection failed.
    Error(String),
    /// The server ended the session.
    SessionEnd,
}

/// Body of one message, delivered in chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ConnectionError>> + Send>>;

/// Receiving half of a transport's event feed.
pub type MailboxEvents = mpsc::UnboundedReceiver<MailboxEvent>;

/// Opens inbound sessions.
#[async_trait]
pub trait MailboxConnector: Send + Sync + 'static {
    type Transport: MailboxTransport;

    /// Connect and authenticate, returning the session and its event feed.
    async fn connect(&self) -> Result<(Self::Transport, MailboxEvents), ConnectionError>;
}

/// An authenticated inbound session.
#[async_trait]
pub trait MailboxTransport: Send + 'static {
    /// Open the inbox read-write.
    async fn open_inbox(&mut self) -> Result<MailboxInfo, MailboxError>;

    /// List identifiers of messages without the `\Seen` flag.
    async fn search_unseen(&mut self) -> Result<Vec<MessageUid>, ConnectionError>;

    /// Fetch the full raw message without marking it seen.
    async fn fetch_body(&mut self, uid: MessageUid) -> Result<BodyStream, ConnectionError>;

    /// Set the `\Seen` flag.
    async fn mark_seen(&mut self, uid: MessageUid) -> Result<(), FlagError>;

    /// Ask the server to push new-mail notifications until the next command.
    async fn listen(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

/// A reply ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

/// Outbound mail delivery.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// Deliver a message, returning its message id.
    async fn send(&self, mail: OutgoingMail) -> Result<String, DeliveryError>;

    /// Check that the server accepts connections and credentials.
    async fn verify_connection(&self) -> Result<(), DeliveryError>;
}
