//! Configuration types.
//!
//! Everything is read from the environment at startup; sub-configs for
//! optional integrations return `None` when their variables are absent.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the libSQL database file.
    pub db_path: String,
    /// Port for the inbound webhook server.
    pub bind_port: u16,
    /// Intent classifier settings.
    pub classifier: ClassifierConfig,
    /// SMS transport settings. `None` disables real sends (log-only).
    pub transport: Option<TransportConfig>,
    /// Deferred job scheduler settings.
    pub scheduler: SchedulerConfig,
}

/// External intent-classification service settings.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Endpoint that accepts the context envelope and returns
    /// `{action, extracted_params, confidence}`.
    pub endpoint: String,
    /// Bearer token for the classifier service.
    pub api_key: SecretString,
    /// Model selector sent when the inbound request carries none.
    pub default_model: String,
    /// Per-call timeout. A timed-out call fails the whole invocation.
    pub timeout: Duration,
}

/// SMS transport provider settings (Twilio-shaped REST API).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base API URL, e.g. `https://api.twilio.com/2010-04-01`.
    pub api_url: String,
    /// Account identifier.
    pub account_id: String,
    /// API auth token.
    pub auth_token: SecretString,
    /// Sender number, normalized.
    pub from_number: String,
    /// Per-send timeout.
    pub timeout: Duration,
}

/// How often the scheduler scans the job queue.
#[derive(Debug, Clone)]
pub enum Cadence {
    /// Fixed interval between scans.
    Interval(Duration),
    /// Cron expression (seconds granularity, `cron` crate syntax).
    Cron(String),
}

/// Deferred job scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub cadence: Cadence,
    /// Max jobs claimed per scan.
    pub claim_batch: usize,
    /// Delay between poll start and the reminder job.
    pub reminder_offset: chrono::Duration,
    /// Delay between the reminder and the pause check.
    pub pause_offset: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cadence: Cadence::Interval(Duration::from_secs(60)),
            claim_batch: 10,
            reminder_offset: chrono::Duration::hours(24),
            pause_offset: chrono::Duration::hours(24),
        }
    }
}

impl AppConfig {
    /// Build configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path =
            std::env::var("HUDDLE_DB_PATH").unwrap_or_else(|_| "./data/huddle.db".to_string());

        let bind_port = parse_var("HUDDLE_PORT", 8080_u16)?;

        let classifier = ClassifierConfig {
            endpoint: std::env::var("HUDDLE_CLASSIFIER_URL")
                .map_err(|_| ConfigError::MissingEnvVar("HUDDLE_CLASSIFIER_URL".into()))?,
            api_key: SecretString::from(
                std::env::var("HUDDLE_CLASSIFIER_API_KEY")
                    .map_err(|_| ConfigError::MissingEnvVar("HUDDLE_CLASSIFIER_API_KEY".into()))?,
            ),
            default_model: std::env::var("HUDDLE_CLASSIFIER_MODEL")
                .unwrap_or_else(|_| "intent-v2".to_string()),
            timeout: Duration::from_secs(parse_var("HUDDLE_CLASSIFIER_TIMEOUT_SECS", 15_u64)?),
        };

        let transport = TransportConfig::from_env()?;

        let cadence = match std::env::var("HUDDLE_SCHEDULER_CRON") {
            Ok(expr) => Cadence::Cron(expr),
            Err(_) => Cadence::Interval(Duration::from_secs(parse_var(
                "HUDDLE_SCHEDULER_INTERVAL_SECS",
                60_u64,
            )?)),
        };

        let scheduler = SchedulerConfig {
            cadence,
            claim_batch: parse_var("HUDDLE_SCHEDULER_BATCH", 10_usize)?,
            reminder_offset: chrono::Duration::hours(parse_var("HUDDLE_REMINDER_HOURS", 24_i64)?),
            pause_offset: chrono::Duration::hours(parse_var("HUDDLE_PAUSE_HOURS", 24_i64)?),
        };

        Ok(Self {
            db_path,
            bind_port,
            classifier,
            transport,
            scheduler,
        })
    }
}

impl TransportConfig {
    /// Build transport config from the environment, or `None` if the
    /// provider variables are unset (sends become log-only).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(account_id) = std::env::var("HUDDLE_SMS_ACCOUNT") else {
            return Ok(None);
        };

        let auth_token = std::env::var("HUDDLE_SMS_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("HUDDLE_SMS_TOKEN".into()))?;
        let from_number = std::env::var("HUDDLE_SMS_FROM")
            .map_err(|_| ConfigError::MissingEnvVar("HUDDLE_SMS_FROM".into()))?;
        let from_number = crate::phone::normalize(&from_number).ok_or_else(|| {
            ConfigError::InvalidValue {
                key: "HUDDLE_SMS_FROM".into(),
                message: "not a valid phone number".into(),
            }
        })?;

        Ok(Some(Self {
            api_url: std::env::var("HUDDLE_SMS_API_URL")
                .unwrap_or_else(|_| "https://api.twilio.com/2010-04-01".to_string()),
            account_id,
            auth_token: SecretString::from(auth_token),
            from_number,
            timeout: Duration::from_secs(parse_var("HUDDLE_SMS_TIMEOUT_SECS", 10_u64)?),
        }))
    }
}

/// Parse an env var with a default, erroring on malformed values.
fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}
