//! SMTP outbound transport via lettre.

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::channels::transport::{OutboundTransport, OutgoingMail};
use crate::config::SmtpConfig;
use crate::error::DeliveryError;

/// Outbound transport backed by an async lettre SMTP relay.
pub struct SmtpOutbound {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl SmtpOutbound {
    /// Build the relay. No connection is made until the first send or verify.
    pub fn new(config: &SmtpConfig) -> Result<Self, DeliveryError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let builder = if config.implicit_tls() {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        }
        .map_err(|e| DeliveryError::Transport(format!("SMTP relay error: {e}")))?;

        let transport = builder.port(config.port).credentials(creds).build();

        Ok(Self {
            transport,
            host: config.host.clone(),
        })
    }
}

#[async_trait]
impl OutboundTransport for SmtpOutbound {
    async fn send(&self, mail: OutgoingMail) -> Result<String, DeliveryError> {
        let message_id = generate_message_id(&mail.from);
        let email = build_message(&mail, &message_id)?;

        self.transport
            .send(email)
            .await
            .map_err(|e| DeliveryError::Transport(format!("SMTP send failed: {e}")))?;

        tracing::info!(to = %mail.to, message_id = %message_id, "Email sent");
        Ok(message_id)
    }

    async fn verify_connection(&self) -> Result<(), DeliveryError> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(DeliveryError::Unreachable {
                host: self.host.clone(),
            }),
            Err(e) => Err(DeliveryError::Transport(format!(
                "SMTP connection test failed: {e}"
            ))),
        }
    }
}

/// Assemble a multipart/alternative message.
fn build_message(mail: &OutgoingMail, message_id: &str) -> Result<Message, DeliveryError> {
    let from = parse_mailbox("from", &mail.from)?;
    let to = parse_mailbox("to", &mail.to)?;

    Message::builder()
        .from(from)
        .to(to)
        .subject(mail.subject.as_str())
        .message_id(Some(message_id.to_string()))
        .multipart(MultiPart::alternative_plain_html(
            mail.text_body.clone(),
            mail.html_body.clone(),
        ))
        .map_err(|e| DeliveryError::Build(e.to_string()))
}

fn parse_mailbox(field: &'static str, address: &str) -> Result<Mailbox, DeliveryError> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| DeliveryError::InvalidAddress {
            field,
            address: address.to_string(),
            reason: e.to_string(),
        })
}

/// `<uuid@domain>`, using the sender's domain when it has one.
fn generate_message_id(from: &str) -> String {
    let domain = from
        .rsplit_once('@')
        .map(|(_, d)| d.trim_end_matches('>'))
        .filter(|d| !d.is_empty())
        .unwrap_or("localhost");
    format!("<{}@{}>", Uuid::new_v4(), domain)
}
