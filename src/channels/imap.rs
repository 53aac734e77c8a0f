//! IMAP inbound transport: raw IMAP4rev1 over TLS.
//!
//! A reader task owns the read half of the socket. It frames every server
//! response, hands frames to the command side, and turns unsolicited
//! mailbox growth into `MailboxEvent::NewMail`. The command side
//! (`ImapSession`) issues one command at a time and collects frames until
//! the tagged completion.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

use crate::channels::imap_protocol::{
    ResponseFrame, Status, TagGenerator, has_capability, parse_search, parse_select,
    quote, read_frame, take_fetch_body,
};
use crate::channels::transport::{
    BodyStream, MailboxConnector, MailboxEvent, MailboxEvents, MailboxInfo, MailboxTransport,
    MessageUid,
};
use crate::config::ImapConfig;
use crate::error::{ConnectionError, FlagError, MailboxError};

/// Upper bound for any single command round-trip.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Mailbox the gate watches.
const INBOX: &str = "INBOX";

/// Opens TLS IMAP sessions for one account.
pub struct ImapConnector {
    config: ImapConfig,
    tls: TlsConnector,
}

impl ImapConnector {
    /// Uses the webpki root store; requires a process-level rustls crypto provider.
    pub fn new(config: ImapConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    type Transport = ImapSession<TlsStream<TcpStream>>;

    async fn connect(&self) -> Result<(Self::Transport, MailboxEvents), ConnectionError> {
        let host = self.config.host.clone();
        info!(host = %host, port = self.config.port, "Connecting to IMAP server");

        let tcp = with_timeout("TCP connect", TcpStream::connect((host.as_str(), self.config.port)))
            .await??;

        let server_name = rustls::pki_types::ServerName::try_from(host)
            .map_err(|e| ConnectionError::Tls(e.to_string()))?;
        let tls = with_timeout("TLS handshake", self.tls.connect(server_name, tcp)).await??;

        let (mut session, events) = ImapSession::start(tls).await?;
        session
            .login(&self.config.username, self.config.password.expose_secret())
            .await?;
        session.probe_capabilities().await?;

        info!(user = %self.config.username, idle = session.supports_idle, "IMAP login successful");
        Ok((session, events))
    }
}

/// An authenticated IMAP connection.
pub struct ImapSession<S> {
    writer: WriteHalf<S>,
    frames: mpsc::UnboundedReceiver<ResponseFrame>,
    reader: JoinHandle<()>,
    tags: TagGenerator,
    supports_idle: bool,
    /// Tag of the running IDLE command, if any.
    idle_tag: Option<String>,
}

impl<S> ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Spawn the reader and consume the server greeting.
    pub async fn start(stream: S) -> Result<(Self, MailboxEvents), ConnectionError> {
        let (read_half, writer) = tokio::io::split(stream);
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_responses(
            BufReader::new(read_half),
            frame_tx,
            event_tx,
        ));

        let mut session = Self {
            writer,
            frames,
            reader,
            tags: TagGenerator::default(),
            supports_idle: false,
            idle_tag: None,
        };

        let greeting = session.next_frame("greeting").await?;
        if greeting.is_bye() || greeting.status() != Some(Status::Ok) {
            return Err(ConnectionError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.text
            )));
        }

        Ok((session, events))
    }

    async fn login(&mut self, user: &str, password: &str) -> Result<(), ConnectionError> {
        let command = format!("LOGIN {} {}", quote(user), quote(password));
        match self.execute("LOGIN", &command).await {
            Ok(_) => Ok(()),
            Err(ConnectionError::CommandRejected { response, .. }) => {
                Err(ConnectionError::AuthFailed {
                    user: user.to_string(),
                    reason: response,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn probe_capabilities(&mut self) -> Result<(), ConnectionError> {
        let frames = self.execute("CAPABILITY", "CAPABILITY").await?;
        self.supports_idle = has_capability(&frames, "IDLE");
        Ok(())
    }

    /// Send a command and collect its untagged responses.
    ///
    /// `name` is what appears in errors and logs; `command` may carry secrets.
    async fn execute(
        &mut self,
        name: &str,
        command: &str,
    ) -> Result<Vec<ResponseFrame>, ConnectionError> {
        self.end_idle().await?;
        let tag = self.tags.next_tag();
        debug!(tag = %tag, command = name, "IMAP command");
        self.write_line(&format!("{tag} {command}")).await?;
        self.collect_until_tagged(&tag, name).await
    }

    async fn collect_until_tagged(
        &mut self,
        tag: &str,
        name: &str,
    ) -> Result<Vec<ResponseFrame>, ConnectionError> {
        let mut frames = Vec::new();
        loop {
            let frame = self.next_frame(name).await?;
            if frame.is_tagged(tag) {
                return match frame.status() {
                    Some(Status::Ok) => Ok(frames),
                    _ => Err(ConnectionError::CommandRejected {
                        command: name.to_string(),
                        response: frame.text,
                    }),
                };
            }
            frames.push(frame);
        }
    }

    async fn next_frame(&mut self, operation: &str) -> Result<ResponseFrame, ConnectionError> {
        with_timeout(operation, self.frames.recv())
            .await?
            .ok_or(ConnectionError::Closed)
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Leave IDLE so a regular command can be sent.
    async fn end_idle(&mut self) -> Result<(), ConnectionError> {
        if let Some(tag) = self.idle_tag.take() {
            self.write_line("DONE").await?;
            self.collect_until_tagged(&tag, "IDLE").await?;
        }
        Ok(())
    }
}

impl<S> Drop for ImapSession<S> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl<S> MailboxTransport for ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn open_inbox(&mut self) -> Result<MailboxInfo, MailboxError> {
        let command = format!("SELECT {}", quote(INBOX));
        match self.execute("SELECT", &command).await {
            Ok(frames) => Ok(parse_select(&frames)),
            Err(ConnectionError::CommandRejected { response, .. }) => {
                Err(MailboxError::OpenFailed {
                    mailbox: INBOX.to_string(),
                    reason: response,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn search_unseen(&mut self) -> Result<Vec<MessageUid>, ConnectionError> {
        let frames = self.execute("UID SEARCH", "UID SEARCH UNSEEN").await?;
        Ok(parse_search(&frames))
    }

    async fn fetch_body(&mut self, uid: MessageUid) -> Result<BodyStream, ConnectionError> {
        let frames = self
            .execute("UID FETCH", &format!("UID FETCH {uid} BODY.PEEK[]"))
            .await?;
        let body = take_fetch_body(frames).ok_or(ConnectionError::MissingBody { uid })?;
        Ok(Box::pin(futures::stream::once(async move { Ok(body) })))
    }

    async fn mark_seen(&mut self, uid: MessageUid) -> Result<(), FlagError> {
        self.execute("UID STORE", &format!("UID STORE {uid} +FLAGS.SILENT (\\Seen)"))
            .await
            .map(|_| ())
            .map_err(|source| FlagError { uid, source })
    }

    async fn listen(&mut self) -> Result<(), ConnectionError> {
        if !self.supports_idle || self.idle_tag.is_some() {
            return Ok(());
        }

        let tag = self.tags.next_tag();
        self.write_line(&format!("{tag} IDLE")).await?;
        loop {
            let frame = self.next_frame("IDLE").await?;
            if frame.is_continuation() {
                self.idle_tag = Some(tag);
                return Ok(());
            }
            if frame.is_tagged(&tag) {
                warn!(response = %frame.text, "Server refused IDLE; relying on polling");
                self.supports_idle = false;
                return Ok(());
            }
        }
    }
}

/// Reader loop: frames responses until EOF or error.
async fn read_responses<R>(
    mut reader: R,
    frames: mpsc::UnboundedSender<ResponseFrame>,
    events: mpsc::UnboundedSender<MailboxEvent>,
) where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut known_exists: Option<u32> = None;

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if let Some(count) = frame.exists_count() {
                    if let Some(arrived) = new_arrivals(&mut known_exists, count) {
                        debug!(arrived, total = count, "Mailbox grew");
                        let _ = events.send(MailboxEvent::NewMail(arrived));
                    }
                }
                if frame.expunged_seq().is_some() {
                    forget_expunged(&mut known_exists);
                }
                if frame.is_bye() {
                    info!(response = %frame.text, "Server is closing the session");
                }
                if frames.send(frame).is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = events.send(MailboxEvent::SessionEnd);
                return;
            }
            Err(e) => {
                let _ = events.send(MailboxEvent::Error(e.to_string()));
                return;
            }
        }
    }
}

/// Track the `EXISTS` count; the first report is the baseline.
fn new_arrivals(known: &mut Option<u32>, count: u32) -> Option<u32> {
    let previous = known.replace(count)?;
    (count > previous).then(|| count - previous)
}

/// Each `EXPUNGE` shrinks the mailbox by one message.
fn forget_expunged(known: &mut Option<u32>) {
    if let Some(count) = known.as_mut() {
        *count = count.saturating_sub(1);
    }
}

async fn with_timeout<F, T>(operation: &str, future: F) -> Result<T, ConnectionError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(COMMAND_TIMEOUT, future)
        .await
        .map_err(|_| ConnectionError::Timeout {
            operation: operation.to_string(),
            timeout: COMMAND_TIMEOUT,
        })
}
