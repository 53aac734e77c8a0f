//! Connection supervisor: owns the session lifecycle and reconnects.
//!
//! Each session runs in its own task so a panic in the session can be
//! observed here and treated like any other connection error.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::channels::transport::MailboxConnector;
use crate::config::{GateConfig, PollConfig, ReconnectPolicy};
use crate::error::Error;
use crate::pipeline::notifier::Notifier;
use crate::pipeline::processor::MessageProcessor;
use crate::pipeline::validator::Validator;
use crate::worker::poller::{DisconnectCause, MailboxPoller, SessionReport};
use crate::worker::state::{SessionState, StateCell};

/// Keeps one mailbox session alive at a time.
pub struct ConnectionSupervisor<C> {
    connector: Arc<C>,
    notifier: Arc<Notifier>,
    validator: Validator,
    own_address: String,
    poll: PollConfig,
    policy: ReconnectPolicy,
    state: StateCell,
}

impl<C> ConnectionSupervisor<C>
where
    C: MailboxConnector,
{
    pub fn new(connector: C, notifier: Arc<Notifier>, config: &GateConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            notifier,
            validator: Validator::from_rules(&config.rules),
            own_address: config.own_address.clone(),
            poll: config.poll,
            policy: config.reconnect,
            state: StateCell::new(),
        }
    }

    /// Handle to the observable session state.
    pub fn state(&self) -> StateCell {
        self.state.clone()
    }

    /// Run sessions forever, reconnecting after each one ends.
    ///
    /// Only returns when a retry limit is configured and exceeded.
    pub async fn run(&self) -> Result<(), Error> {
        let mut failures: u32 = 0;

        loop {
            let report = self.run_session().await;

            if report.opened {
                failures = 0;
            } else {
                failures += 1;
                if self.policy.max_retries.is_some_and(|max| failures > max) {
                    error!(attempts = failures, "Giving up on the mailbox connection");
                    return Err(Error::RetriesExhausted { attempts: failures });
                }
            }

            let delay = reconnect_delay(&self.policy, &report.cause, failures);
            match &report.cause {
                DisconnectCause::Error(reason) => {
                    warn!(reason = %reason, delay = ?delay, "Mailbox session failed, reconnecting")
                }
                DisconnectCause::Ended => {
                    info!(delay = ?delay, "Mailbox session ended, reconnecting")
                }
            }

            tokio::time::sleep(delay).await;
            info!("Attempting to reconnect");
        }
    }

    /// Connect, open the inbox and poll until the session ends.
    pub async fn run_session(&self) -> SessionReport {
        self.state.transition(SessionState::Connecting);

        let connector = Arc::clone(&self.connector);
        let processor = MessageProcessor::new(
            self.validator.clone(),
            Arc::clone(&self.notifier),
            self.own_address.clone(),
        );
        let poll = self.poll;
        let state = self.state.clone();

        let session = tokio::spawn(async move {
            let (transport, events) = match connector.connect().await {
                Ok(connected) => connected,
                Err(e) => {
                    error!(error = %e, "Failed to connect to mailbox");
                    return SessionReport {
                        opened: false,
                        cause: DisconnectCause::Error(e.to_string()),
                    };
                }
            };
            info!("Connected to mailbox");
            MailboxPoller::new(transport, events, processor, poll, state)
                .run()
                .await
        });

        let report = match session.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Mailbox session task failed");
                SessionReport {
                    opened: false,
                    cause: DisconnectCause::Error(e.to_string()),
                }
            }
        };

        self.state.transition(SessionState::Disconnected);
        report
    }
}

/// Delay before the next connection attempt.
///
/// `failures` counts consecutive sessions that never opened the inbox; the
/// base delay grows by `backoff_factor` for each one past the first.
pub fn reconnect_delay(policy: &ReconnectPolicy, cause: &DisconnectCause, failures: u32) -> Duration {
    let base = match cause {
        DisconnectCause::Error(_) => policy.error_delay,
        DisconnectCause::Ended => policy.end_delay,
    };
    if failures <= 1 || policy.backoff_factor <= 1.0 {
        return base;
    }

    let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
    let scaled = base.as_secs_f64() * policy.backoff_factor.powi(exponent);
    if !scaled.is_finite() || scaled >= policy.max_delay.as_secs_f64() {
        policy.max_delay
    } else {
        Duration::from_secs_f64(scaled)
    }
}
