//! End-to-end tests for the mailbox session.
//!
//! Each test runs a real `ConnectionSupervisor` against an in-memory mailbox
//! and a recording outbound transport, with tokio time paused so poll
//! intervals and reconnect delays elapse instantly.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use mail_gate::channels::{
    BodyStream, MailboxConnector, MailboxEvent, MailboxEvents, MailboxInfo, MailboxTransport,
    MessageUid, OutboundTransport, OutgoingMail,
};
use mail_gate::config::{DEFAULT_REQUIRED_CONTENT, DEFAULT_REQUIRED_SUBJECT, GateConfig};
use mail_gate::error::{ConnectionError, DeliveryError, Error, FlagError, MailboxError};
use mail_gate::pipeline::Notifier;
use mail_gate::pipeline::notifier::{FAILURE_SUBJECT, SUCCESS_SUBJECT};
use mail_gate::worker::{ConnectionSupervisor, SessionState, StateCell};

const OWN: &str = "gate@example.com";
const LINK: &str = "https://example.com/next";

/// Upper bound on polling iterations in `wait_for` (10ms of virtual time each).
const MAX_WAIT_STEPS: usize = 2_000;

// ── Fakes ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct MailboxState {
    messages: BTreeMap<u32, (Vec<u8>, bool)>,
    unflaggable: HashSet<u32>,
    rejected_fetches: HashSet<u32>,
    /// Search number on which the server hangs up mid-command.
    hangup_on_search: Option<usize>,
    hung_up_at: Option<Instant>,
    connected_at: Vec<Instant>,
    fetches: HashMap<u32, usize>,
    searches: usize,
    connects: u32,
    failing_connects: u32,
    chunk_size: usize,
    events: Option<mpsc::UnboundedSender<MailboxEvent>>,
}

/// In-memory mailbox shared by the connector and every session it opens.
#[derive(Clone, Default)]
struct FakeMailbox {
    state: Arc<Mutex<MailboxState>>,
}

impl FakeMailbox {
    fn new() -> Self {
        let mailbox = Self::default();
        mailbox.state.lock().unwrap().chunk_size = 16;
        mailbox
    }

    fn deliver(&self, uid: u32, raw: Vec<u8>) {
        self.state.lock().unwrap().messages.insert(uid, (raw, false));
    }

    fn is_seen(&self, uid: u32) -> bool {
        self.state.lock().unwrap().messages.get(&uid).is_some_and(|(_, seen)| *seen)
    }

    fn fetches(&self, uid: u32) -> usize {
        self.state.lock().unwrap().fetches.get(&uid).copied().unwrap_or(0)
    }

    fn searches(&self) -> usize {
        self.state.lock().unwrap().searches
    }

    fn connects(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    fn push(&self, event: MailboxEvent) {
        let state = self.state.lock().unwrap();
        state.events.as_ref().expect("no live session").send(event).unwrap();
    }

    fn with<R>(&self, f: impl FnOnce(&mut MailboxState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

#[async_trait]
impl MailboxConnector for FakeMailbox {
    type Transport = FakeSession;

    async fn connect(&self) -> Result<(FakeSession, MailboxEvents), ConnectionError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        state.connected_at.push(Instant::now());
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(ConnectionError::Timeout {
                operation: "connect".into(),
                timeout: Duration::from_secs(30),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.events = Some(tx);
        Ok((FakeSession { mailbox: self.clone() }, rx))
    }
}

struct FakeSession {
    mailbox: FakeMailbox,
}

#[async_trait]
impl MailboxTransport for FakeSession {
    async fn open_inbox(&mut self) -> Result<MailboxInfo, MailboxError> {
        let exists = self.mailbox.with(|s| s.messages.len() as u32);
        Ok(MailboxInfo {
            exists,
            uid_validity: Some(1),
        })
    }

    async fn search_unseen(&mut self) -> Result<Vec<MessageUid>, ConnectionError> {
        self.mailbox.with(|s| {
            s.searches += 1;
            if s.hangup_on_search == Some(s.searches) {
                if let Some(events) = &s.events {
                    let _ = events.send(MailboxEvent::SessionEnd);
                }
                s.hung_up_at = Some(Instant::now());
                return Err(ConnectionError::Closed);
            }
            Ok(s.messages
                .iter()
                .filter(|(_, (_, seen))| !seen)
                .map(|(uid, _)| MessageUid(*uid))
                .collect())
        })
    }

    async fn fetch_body(&mut self, uid: MessageUid) -> Result<BodyStream, ConnectionError> {
        let (raw, chunk_size) = self.mailbox.with(|s| {
            *s.fetches.entry(uid.0).or_default() += 1;
            if s.rejected_fetches.contains(&uid.0) {
                return (None, 0);
            }
            (s.messages.get(&uid.0).map(|(raw, _)| raw.clone()), s.chunk_size)
        });
        let raw = raw.ok_or(ConnectionError::CommandRejected {
            command: "UID FETCH".into(),
            response: format!("NO message {uid} is gone"),
        })?;
        let chunks: Vec<Result<Vec<u8>, ConnectionError>> =
            raw.chunks(chunk_size).map(|c| Ok(c.to_vec())).collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn mark_seen(&mut self, uid: MessageUid) -> Result<(), FlagError> {
        self.mailbox.with(|s| {
            if s.unflaggable.contains(&uid.0) {
                return Err(FlagError {
                    uid,
                    source: ConnectionError::CommandRejected {
                        command: "UID STORE".into(),
                        response: "NO read-only".into(),
                    },
                });
            }
            if let Some((_, seen)) = s.messages.get_mut(&uid.0) {
                *seen = true;
            }
            Ok(())
        })
    }
}

#[derive(Default)]
struct RecordingOutbound {
    sent: Mutex<Vec<OutgoingMail>>,
}

impl RecordingOutbound {
    fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboundTransport for RecordingOutbound {
    async fn send(&self, mail: OutgoingMail) -> Result<String, DeliveryError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(mail);
        Ok(format!("<{}@test>", sent.len()))
    }

    async fn verify_connection(&self) -> Result<(), DeliveryError> {
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn config() -> GateConfig {
    GateConfig::from_lookup(|key| match key {
        "EMAIL_USER" => Some(OWN.into()),
        "EMAIL_PASS" => Some("secret".into()),
        "GATE_SUCCESS_LINK" => Some(LINK.into()),
        _ => None,
    })
    .unwrap()
}

fn raw(from: &str, subject: &str, body: &str) -> Vec<u8> {
    format!(
        "From: {from}\r\nTo: {OWN}\r\nSubject: {subject}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{body}\r\n"
    )
    .into_bytes()
}

fn valid_from(from: &str) -> Vec<u8> {
    raw(from, DEFAULT_REQUIRED_SUBJECT, &format!("Hi!\n{DEFAULT_REQUIRED_CONTENT}"))
}

struct Gate {
    mailbox: FakeMailbox,
    outbound: Arc<RecordingOutbound>,
    state: StateCell,
    handle: tokio::task::JoinHandle<Result<(), Error>>,
}

fn start(mailbox: FakeMailbox, config: GateConfig) -> Gate {
    let outbound = Arc::new(RecordingOutbound::default());
    let notifier = Arc::new(Notifier::new(outbound.clone(), OWN, LINK));
    let supervisor = ConnectionSupervisor::new(mailbox.clone(), notifier, &config);
    let state = supervisor.state();
    let handle = tokio::spawn(async move { supervisor.run().await });
    Gate {
        mailbox,
        outbound,
        state,
        handle,
    }
}

/// Step virtual time until `cond` holds.
async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..MAX_WAIT_STEPS {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn valid_message_gets_success_reply() {
    let mailbox = FakeMailbox::new();
    mailbox.deliver(1, valid_from("alice@example.org"));
    let gate = start(mailbox, config());

    wait_for("success reply", || gate.outbound.sent().len() == 1).await;
    let sent = gate.outbound.sent();
    assert_eq!(sent[0].to, "alice@example.org");
    assert_eq!(sent[0].from, OWN);
    assert_eq!(sent[0].subject, SUCCESS_SUBJECT);
    assert!(sent[0].text_body.contains(LINK));

    wait_for("message flagged", || gate.mailbox.is_seen(1)).await;
    gate.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn invalid_message_gets_failure_reply() {
    let mailbox = FakeMailbox::new();
    mailbox.deliver(1, raw("bob@example.org", "hello", "..."));
    let gate = start(mailbox, config());

    wait_for("failure reply", || gate.outbound.sent().len() == 1).await;
    let sent = gate.outbound.sent();
    assert_eq!(sent[0].to, "bob@example.org");
    assert_eq!(sent[0].subject, FAILURE_SUBJECT);
    assert!(!sent[0].text_body.contains(LINK));
    gate.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn self_sent_message_is_flagged_without_reply() {
    let mailbox = FakeMailbox::new();
    mailbox.deliver(1, valid_from(OWN));
    let gate = start(mailbox, config());

    wait_for("message flagged", || gate.mailbox.is_seen(1)).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(gate.outbound.sent().is_empty());
    gate.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn body_split_across_many_chunks_is_reassembled() {
    let mailbox = FakeMailbox::new();
    mailbox.with(|s| s.chunk_size = 1);
    mailbox.deliver(1, valid_from("carol@example.org"));
    let gate = start(mailbox, config());

    wait_for("reply", || gate.outbound.sent().len() == 1).await;
    assert_eq!(gate.outbound.sent()[0].subject, SUCCESS_SUBJECT);
    gate.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn mixed_batch_gets_one_reply_per_foreign_sender() {
    let mailbox = FakeMailbox::new();
    mailbox.deliver(3, raw("bob@example.org", DEFAULT_REQUIRED_SUBJECT, "wrong body"));
    mailbox.deliver(5, valid_from("alice@example.org"));
    mailbox.deliver(8, valid_from(OWN));
    let gate = start(mailbox, config());

    wait_for("all flagged", || [3, 5, 8].into_iter().all(|uid| gate.mailbox.is_seen(uid))).await;
    wait_for("two replies", || gate.outbound.sent().len() == 2).await;

    let mut by_recipient: Vec<(String, String)> = gate
        .outbound
        .sent()
        .into_iter()
        .map(|m| (m.to, m.subject))
        .collect();
    by_recipient.sort();
    assert_eq!(
        by_recipient,
        vec![
            ("alice@example.org".to_string(), SUCCESS_SUBJECT.to_string()),
            ("bob@example.org".to_string(), FAILURE_SUBJECT.to_string()),
        ]
    );
    gate.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn repeated_cycles_do_not_reprocess() {
    let mut config = config();
    config.poll.check_interval = Duration::from_millis(100);

    let mailbox = FakeMailbox::new();
    mailbox.deliver(1, valid_from("alice@example.org"));
    let gate = start(mailbox, config);

    wait_for("several cycles", || gate.mailbox.searches() >= 5).await;
    assert_eq!(gate.mailbox.fetches(1), 1);
    assert_eq!(gate.outbound.sent().len(), 1);
    gate.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn unflaggable_message_is_answered_once_per_session() {
    let mut config = config();
    config.poll.check_interval = Duration::from_millis(100);

    let mailbox = FakeMailbox::new();
    mailbox.deliver(1, valid_from("alice@example.org"));
    mailbox.with(|s| {
        s.unflaggable.insert(1);
    });
    let gate = start(mailbox, config);

    wait_for("several cycles", || gate.mailbox.searches() >= 5).await;
    assert!(!gate.mailbox.is_seen(1));
    assert_eq!(gate.mailbox.fetches(1), 1);
    assert_eq!(gate.outbound.sent().len(), 1);
    assert_eq!(gate.mailbox.connects(), 1);
    gate.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn new_mail_signal_triggers_check_before_next_tick() {
    let mut config = config();
    config.poll.check_interval = Duration::from_secs(3600);

    let mailbox = FakeMailbox::new();
    let gate = start(mailbox, config);

    wait_for("first cycle", || gate.mailbox.searches() == 1 && gate.state.get() == SessionState::Idle).await;

    gate.mailbox.deliver(7, valid_from("dave@example.org"));
    let signalled = Instant::now();
    gate.mailbox.push(MailboxEvent::NewMail(1));
    gate.mailbox.push(MailboxEvent::NewMail(1));

    wait_for("reply to new mail", || gate.outbound.sent().len() == 1).await;
    let waited = signalled.elapsed();
    assert!(waited >= Duration::from_secs(1), "checked too early: {waited:?}");
    assert!(waited < Duration::from_secs(60), "waited for the interval: {waited:?}");
    // Back-to-back signals coalesce into one cycle.
    assert_eq!(gate.mailbox.searches(), 2);
    gate.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn error_event_reconnects_with_fresh_ledger() {
    let mailbox = FakeMailbox::new();
    mailbox.deliver(1, valid_from("alice@example.org"));
    mailbox.with(|s| {
        s.unflaggable.insert(1);
    });
    let gate = start(mailbox, config());

    wait_for("first reply", || gate.outbound.sent().len() == 1).await;
    wait_for("idle", || gate.state.get() == SessionState::Idle).await;

    let failed_at = Instant::now();
    gate.mailbox.push(MailboxEvent::Error("connection reset".into()));
    wait_for("disconnect", || gate.state.get() == SessionState::Disconnected).await;
    assert_eq!(gate.mailbox.connects(), 1);

    wait_for("reconnect", || gate.mailbox.connects() == 2).await;
    assert!(failed_at.elapsed() >= Duration::from_secs(5));

    // The message was never flagged, so the new session answers it again.
    wait_for("second reply", || gate.outbound.sent().len() == 2).await;
    assert_eq!(gate.mailbox.fetches(1), 2);
    gate.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn session_end_reconnects_after_shorter_delay() {
    let gate = start(FakeMailbox::new(), config());

    wait_for("idle", || gate.state.get() == SessionState::Idle).await;
    let ended_at = Instant::now();
    gate.mailbox.push(MailboxEvent::SessionEnd);

    wait_for("reconnect", || gate.mailbox.connects() == 2).await;
    let waited = ended_at.elapsed();
    assert!(waited >= Duration::from_secs(3), "reconnected too early: {waited:?}");
    assert!(waited < Duration::from_secs(5), "used the error delay: {waited:?}");
    gate.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn hangup_during_cycle_reconnects_after_end_delay() {
    let mut config = config();
    config.poll.check_interval = Duration::from_secs(10);

    let mailbox = FakeMailbox::new();
    mailbox.with(|s| s.hangup_on_search = Some(2));
    let gate = start(mailbox, config);

    wait_for("reconnect", || gate.mailbox.connects() == 2).await;
    let (hung_up_at, reconnected_at) = gate
        .mailbox
        .with(|s| (s.hung_up_at.expect("server never hung up"), s.connected_at[1]));
    let waited = reconnected_at - hung_up_at;
    assert!(waited >= Duration::from_secs(3), "reconnected too early: {waited:?}");
    assert!(waited < Duration::from_secs(5), "used the error delay: {waited:?}");
    gate.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn broken_messages_do_not_stop_their_batch() {
    let mut config = config();
    config.poll.check_interval = Duration::from_millis(100);

    let mailbox = FakeMailbox::new();
    mailbox.deliver(1, b"\r\n   \r\n".to_vec());
    mailbox.deliver(2, valid_from("bob@example.org"));
    mailbox.deliver(3, valid_from("alice@example.org"));
    mailbox.with(|s| {
        s.rejected_fetches.insert(2);
    });
    let gate = start(mailbox, config);

    wait_for("valid message flagged", || gate.mailbox.is_seen(3)).await;
    wait_for("reply", || gate.outbound.sent().len() == 1).await;
    wait_for("more cycles", || gate.mailbox.searches() >= 5).await;

    let sent = gate.outbound.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "alice@example.org");
    assert_eq!(sent[0].subject, SUCCESS_SUBJECT);

    // Unparseable mail is still flagged; the rejected fetch stays unseen.
    assert!(gate.mailbox.is_seen(1));
    assert!(!gate.mailbox.is_seen(2));
    assert_eq!(gate.mailbox.fetches(2), 1);
    assert_eq!(gate.mailbox.connects(), 1);
    assert_eq!(gate.state.get(), SessionState::Idle);
    gate.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn connect_failures_exhaust_configured_retries() {
    let mut config = config();
    config.reconnect.max_retries = Some(2);

    let mailbox = FakeMailbox::new();
    mailbox.with(|s| s.failing_connects = u32::MAX);
    let gate = start(mailbox, config);

    let result = tokio::time::timeout(Duration::from_secs(60), gate.handle)
        .await
        .expect("supervisor kept retrying")
        .unwrap();
    assert!(matches!(result, Err(Error::RetriesExhausted { attempts: 3 })));
    assert_eq!(gate.mailbox.connects(), 3);
    assert_eq!(gate.state.get(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn connect_failure_then_recovery() {
    let mailbox = FakeMailbox::new();
    mailbox.deliver(1, valid_from("erin@example.org"));
    mailbox.with(|s| s.failing_connects = 2);
    let gate = start(mailbox, config());

    wait_for("reply after recovery", || gate.outbound.sent().len() == 1).await;
    assert_eq!(gate.mailbox.connects(), 3);
    gate.handle.abort();
}
