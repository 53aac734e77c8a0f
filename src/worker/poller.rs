//! Mailbox poller: one task per mailbox session.
//!
//! The poller owns the transport, the dedup ledger and the processor, so every
//! discovery cycle runs on this single task and cycles never overlap. A cycle
//! is triggered by:
//! 1. reaching Ready (the interval's first tick fires immediately)
//! 2. every poll interval tick
//! 3. a new-mail push signal, after a short settle delay

use std::time::Duration;

use futures::TryStreamExt;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::channels::transport::{
    BodyStream, MailboxEvent, MailboxEvents, MailboxTransport, MessageUid,
};
use crate::config::PollConfig;
use crate::error::ConnectionError;
use crate::pipeline::ledger::DedupLedger;
use crate::pipeline::processor::MessageProcessor;
use crate::worker::state::{SessionState, StateCell};

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Connection, mailbox or transport error.
    Error(String),
    /// The server closed the session.
    Ended,
}

/// How a session went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Whether the inbox was opened (the session reached Ready).
    pub opened: bool,
    pub cause: DisconnectCause,
}

/// What woke the poller up.
enum Trigger {
    Tick,
    NewMail,
    Event(Option<MailboxEvent>),
}

/// Drives discovery cycles for one connected mailbox.
pub struct MailboxPoller<T> {
    transport: T,
    events: MailboxEvents,
    ledger: DedupLedger,
    processor: MessageProcessor,
    poll: PollConfig,
    state: StateCell,
}

impl<T> MailboxPoller<T>
where
    T: MailboxTransport,
{
    /// A poller with a fresh ledger.
    pub fn new(
        transport: T,
        events: MailboxEvents,
        processor: MessageProcessor,
        poll: PollConfig,
        state: StateCell,
    ) -> Self {
        Self {
            transport,
            events,
            ledger: DedupLedger::new(),
            processor,
            poll,
            state,
        }
    }

    /// Open the inbox and poll until the session ends.
    ///
    /// Replies still in flight are awaited before returning.
    pub async fn run(mut self) -> SessionReport {
        let report = self.run_session().await;
        debug!(pending = self.processor.pending_replies(), "Waiting for outstanding replies");
        self.processor.drain_replies().await;
        self.state.transition(SessionState::Disconnected);
        info!(
            handled = self.ledger.len(),
            cause = ?report.cause,
            "Mailbox session finished"
        );
        report
    }

    async fn run_session(&mut self) -> SessionReport {
        match self.transport.open_inbox().await {
            Ok(info) => {
                info!(total = info.exists, uid_validity = ?info.uid_validity, "Inbox opened");
            }
            Err(e) => {
                error!(error = %e, "Failed to open inbox");
                return SessionReport {
                    opened: false,
                    cause: DisconnectCause::Error(e.to_string()),
                };
            }
        }
        self.state.transition(SessionState::Ready);

        let cause = self.poll_loop().await;
        SessionReport {
            opened: true,
            cause,
        }
    }

    async fn poll_loop(&mut self) -> DisconnectCause {
        let mut tick = tokio::time::interval(self.poll.check_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let settle = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(settle);
        let mut settle_armed = false;

        loop {
            let trigger = tokio::select! {
                _ = tick.tick() => Trigger::Tick,
                () = &mut settle, if settle_armed => Trigger::NewMail,
                event = self.events.recv() => Trigger::Event(event),
            };

            match trigger {
                Trigger::Tick => debug!("Poll interval elapsed"),
                Trigger::NewMail => settle_armed = false,
                Trigger::Event(Some(MailboxEvent::NewMail(count))) => {
                    info!(count, "New mail signalled");
                    if !settle_armed {
                        settle.as_mut().reset(Instant::now() + self.poll.new_mail_delay);
                        settle_armed = true;
                    }
                    continue;
                }
                Trigger::Event(Some(MailboxEvent::Error(reason))) => {
                    error!(reason = %reason, "IMAP connection error");
                    return DisconnectCause::Error(reason);
                }
                Trigger::Event(Some(MailboxEvent::SessionEnd) | None) => {
                    info!("IMAP connection closed");
                    return DisconnectCause::Ended;
                }
            }

            if let Err(e) = self.check().await {
                error!(error = %e, "Discovery cycle failed");
                return self.failure_cause(e);
            }
        }
    }

    /// Cause for a cycle that failed mid-command.
    ///
    /// A hangup surfaces both as `SessionEnd` on the event channel and as a
    /// failed command; the event decides, then the error kind.
    fn failure_cause(&mut self, err: ConnectionError) -> DisconnectCause {
        while let Ok(event) = self.events.try_recv() {
            match event {
                MailboxEvent::Error(reason) => return DisconnectCause::Error(reason),
                MailboxEvent::SessionEnd => return DisconnectCause::Ended,
                MailboxEvent::NewMail(_) => {}
            }
        }
        match err {
            ConnectionError::Closed => DisconnectCause::Ended,
            other => DisconnectCause::Error(other.to_string()),
        }
    }

    /// One discovery cycle.
    async fn check(&mut self) -> Result<(), ConnectionError> {
        self.state.transition(SessionState::Checking);

        let unseen = self.transport.search_unseen().await?;
        if unseen.is_empty() {
            debug!("No new mail");
        } else {
            info!(count = unseen.len(), "Found unseen messages");
        }

        for uid in unseen {
            self.handle(uid).await?;
        }

        self.processor.reap_replies();
        self.state.transition(SessionState::Idle);
        self.transport.listen().await
    }

    /// Record, fetch, process and flag one message.
    async fn handle(&mut self, uid: MessageUid) -> Result<(), ConnectionError> {
        if !self.ledger.add(uid) {
            debug!(uid = %uid, "Already handled, skipping");
            return Ok(());
        }

        let raw = match self.fetch(uid).await {
            Ok(raw) => raw,
            Err(e) if !e.is_session_fatal() => {
                warn!(uid = %uid, error = %e, "Skipping message that could not be fetched");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let outcome = self.processor.process(&raw, uid);
        debug!(uid = %uid, outcome = outcome.label(), "Message handled");

        if let Err(e) = self.transport.mark_seen(uid).await {
            warn!(uid = %uid, error = %e, "Failed to mark message as seen");
        }
        Ok(())
    }

    async fn fetch(&mut self, uid: MessageUid) -> Result<Vec<u8>, ConnectionError> {
        let body = self.transport.fetch_body(uid).await?;
        collect_body(body).await
    }
}

/// Concatenate every chunk of a body; a failed chunk fails the whole body.
pub async fn collect_body(body: BodyStream) -> Result<Vec<u8>, ConnectionError> {
    body.try_fold(Vec::new(), |mut buf, chunk| async move {
        buf.extend_from_slice(&chunk);
        Ok(buf)
    })
    .await
}
