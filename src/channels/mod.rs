//! Mail transports: IMAP for inbound, SMTP for outbound.

pub mod imap;
pub mod imap_protocol;
pub mod smtp;
pub mod transport;

pub use imap::ImapConnector;
pub use smtp::SmtpOutbound;
pub use transport::*;
