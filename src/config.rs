//! Configuration types, built once from environment variables.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Subject every accepted message must contain.
pub const DEFAULT_REQUIRED_SUBJECT: &str = "CCDC25_verify";

/// Content every accepted message body must contain.
pub const DEFAULT_REQUIRED_CONTENT: &str = "祝coco编辑器四周年快乐!";

/// Link sent back to senders that pass validation.
pub const DEFAULT_SUCCESS_LINK: &str = "http://43.159.147.70:16392";

/// IMAP (inbound) connection settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

/// SMTP (outbound) connection settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

impl SmtpConfig {
    /// Port 465 speaks TLS from the first byte; everything else upgrades via STARTTLS.
    pub fn implicit_tls(&self) -> bool {
        self.port == 465
    }
}

/// What an incoming message must contain to pass.
#[derive(Debug, Clone)]
pub struct RulesConfig {
    pub required_subject: String,
    pub required_content: String,
    /// Follow-up link included in success replies.
    pub success_link: String,
}

/// Polling cadence for a connected mailbox.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// Interval between periodic discovery cycles.
    pub check_interval: Duration,
    /// Delay between a new-mail push signal and the cycle it triggers.
    pub new_mail_delay: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(30_000),
            new_mail_delay: Duration::from_millis(1_000),
        }
    }
}

/// Reconnect behaviour of the connection supervisor.
///
/// The defaults retry forever with a fixed delay per disconnect cause.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Delay after a connection or mailbox error.
    pub error_delay: Duration,
    /// Delay after the server ended the session.
    pub end_delay: Duration,
    /// Give up after this many consecutive failed sessions (`None` = never).
    pub max_retries: Option<u32>,
    /// Multiplier applied per consecutive failure (1.0 = fixed delay).
    pub backoff_factor: f64,
    /// Upper bound for a grown delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            error_delay: Duration::from_millis(5_000),
            end_delay: Duration::from_millis(3_000),
            max_retries: None,
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(300_000),
        }
    }
}

/// Full gate configuration. Static for the process lifetime.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub imap: ImapConfig,
    pub smtp: SmtpConfig,
    /// The mailbox's own address: reply sender and self-loop filter.
    pub own_address: String,
    pub rules: RulesConfig,
    pub poll: PollConfig,
    pub reconnect: ReconnectPolicy,
}

impl GateConfig {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let username = env.required("EMAIL_USER")?;
        let password = env.required("EMAIL_PASS")?;

        let imap = ImapConfig {
            host: env.string_or("EMAIL_IMAP_HOST", "imap.feishu.cn"),
            port: env.parse_or("EMAIL_IMAP_PORT", 993)?,
            username: username.clone(),
            password: SecretString::from(password.clone()),
        };

        let smtp = SmtpConfig {
            host: env.string_or("EMAIL_SMTP_HOST", "smtp.feishu.cn"),
            port: env.parse_or("EMAIL_SMTP_PORT", 465)?,
            username: env.string_or("EMAIL_SMTP_USER", &username),
            password: SecretString::from(env.string_or("EMAIL_SMTP_PASS", &password)),
        };

        let own_address = env.string_or("EMAIL_FROM_ADDRESS", &username);

        let rules = RulesConfig {
            required_subject: env.string_or("GATE_REQUIRED_SUBJECT", DEFAULT_REQUIRED_SUBJECT),
            required_content: env.string_or("GATE_REQUIRED_CONTENT", DEFAULT_REQUIRED_CONTENT),
            success_link: env.string_or("GATE_SUCCESS_LINK", DEFAULT_SUCCESS_LINK),
        };

        let defaults = PollConfig::default();
        let poll = PollConfig {
            check_interval: env.millis_or("GATE_CHECK_INTERVAL_MS", defaults.check_interval)?,
            new_mail_delay: env.millis_or("GATE_NEW_MAIL_DELAY_MS", defaults.new_mail_delay)?,
        };
        if poll.check_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "GATE_CHECK_INTERVAL_MS".into(),
                message: "must be greater than zero".into(),
            });
        }

        let defaults = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            error_delay: env.millis_or("GATE_RECONNECT_ERROR_DELAY_MS", defaults.error_delay)?,
            end_delay: env.millis_or("GATE_RECONNECT_END_DELAY_MS", defaults.end_delay)?,
            max_retries: env.parse_opt("GATE_RECONNECT_MAX_RETRIES")?,
            backoff_factor: env.parse_or("GATE_RECONNECT_BACKOFF", defaults.backoff_factor)?,
            max_delay: env.millis_or("GATE_RECONNECT_MAX_DELAY_MS", defaults.max_delay)?,
        };
        if !reconnect.backoff_factor.is_finite() || reconnect.backoff_factor < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "GATE_RECONNECT_BACKOFF".into(),
                message: format!("must be >= 1.0, got {}", reconnect.backoff_factor),
            });
        }

        Ok(Self {
            imap,
            smtp,
            own_address,
            rules,
            poll,
            reconnect,
        })
    }
}

/// Typed access to a key lookup.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse_opt<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("{raw:?}: {e}"),
                })
            })
            .transpose()
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse_opt(key)?.unwrap_or(default))
    }

    fn millis_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .parse_opt::<u64>(key)?
            .map_or(default, Duration::from_millis))
    }
}
