//! Error types for mail-gate.

use std::time::Duration;

use crate::channels::transport::MessageUid;

/// Top-level error type for the gate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Reconnect gave up after {attempts} consecutive failures")]
    RetriesExhausted { attempts: u32 },
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Inbound transport failures.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Connection closed by server")]
    Closed,

    #[error("Authentication failed for {user}: {reason}")]
    AuthFailed { user: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server rejected {command}: {response}")]
    CommandRejected { command: String, response: String },

    #[error("No body returned for message {uid}")]
    MissingBody { uid: MessageUid },
}

impl ConnectionError {
    /// Whether the session can no longer be used after this error.
    ///
    /// A rejected command or a missing body concerns a single message; every
    /// other variant means the connection itself is gone or untrustworthy.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, Self::CommandRejected { .. } | Self::MissingBody { .. })
    }
}

/// Failures opening the inbox.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to open {mailbox}: {reason}")]
    OpenFailed { mailbox: String, reason: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// A raw message that could not be parsed.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Message {uid} is empty")]
    Empty { uid: MessageUid },

    #[error("Message {uid} is not a valid RFC 5322 message")]
    Malformed { uid: MessageUid },
}

/// Outbound delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Invalid {field} address {address:?}: {reason}")]
    InvalidAddress {
        field: &'static str,
        address: String,
        reason: String,
    },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("SMTP transport error: {0}")]
    Transport(String),

    #[error("SMTP server {host} is not reachable")]
    Unreachable { host: String },
}

/// Failure to set the `\Seen` flag on a processed message.
#[derive(Debug, thiserror::Error)]
#[error("Failed to flag message {uid} as seen: {source}")]
pub struct FlagError {
    pub uid: MessageUid,
    #[source]
    pub source: ConnectionError,
}

/// Result type alias for the gate.
pub type Result<T> = std::result::Result<T, Error>;
