//! Chat service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket and control API bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default broker channel for chat traffic.
pub const DEFAULT_CHAT_CHANNEL: &str = "chat";

/// Default broker channel for notifications.
pub const DEFAULT_NOTIFICATION_CHANNEL: &str = "notification";

/// Default per-frame write timeout in milliseconds.
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;

/// Default broker publish timeout in milliseconds.
pub const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 2000;

/// Default outbound queue depth per connection.
pub const DEFAULT_CONNECTION_BUFFER: usize = 256;

/// Default number of entries kept per offline mailbox.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 100;

/// Default offline mailbox retention (7 days).
pub const DEFAULT_MAILBOX_RETENTION_SECONDS: u64 = 604_800;

/// Default maximum chat content length in characters.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 1000;

/// Default presence TTL: an instance silent this long is treated as gone.
pub const DEFAULT_PRESENCE_TTL_SECONDS: u64 = 30;

/// Default number of broker publish attempts.
pub const DEFAULT_PUBLISH_MAX_ATTEMPTS: u32 = 3;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "chat";

/// Where rooms, mailboxes, presence and fanout live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Shared Redis: required for more than one instance.
    Redis,
    /// Process-local maps and an in-process broker (single node).
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(ConfigError::InvalidValue(format!(
                "CHAT_STORE_BACKEND must be 'redis' or 'memory', got '{other}'"
            ))),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::InvalidValue(format!(
                "CHAT_LOG_FORMAT must be 'text' or 'json', got '{other}'"
            ))),
        }
    }
}

/// Chat service configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Storage and fanout backend (default: redis).
    pub store_backend: StoreBackend,

    /// Redis connection URL. Required for the redis backend.
    /// Protected by `SecretString` since it may carry a password.
    pub redis_url: Option<SecretString>,

    /// WebSocket and control API bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this instance. Tags its presence entries.
    pub instance_id: String,

    /// Broker channel for chat, typing and room events.
    pub chat_channel: String,

    /// Broker channel for notifications.
    pub notification_channel: String,

    /// Bound on one outbound frame write.
    pub write_timeout: Duration,

    /// Bound on one broker publish, retries included.
    pub publish_timeout: Duration,

    /// Broker publish attempts when the connection is refused.
    pub publish_max_attempts: u32,

    /// Outbound queue depth per connection.
    pub connection_buffer: usize,

    /// Entries kept per offline mailbox; the oldest are dropped beyond this.
    pub mailbox_capacity: usize,

    /// How long mailbox entries are kept.
    pub mailbox_retention: Duration,

    /// How long an instance's users stay online without a heartbeat. The
    /// heartbeat runs at a third of this.
    pub presence_ttl: Duration,

    /// Maximum chat content length in characters.
    pub max_content_length: usize,

    /// HS256 secret for user bearer tokens. Bearer auth is disabled when unset.
    pub jwt_secret: Option<SecretString>,

    /// Accept `?userId=` on the WebSocket handshake.
    pub allow_query_identity: bool,

    /// Service token for the control API. Every control call is rejected
    /// when unset.
    pub control_api_token: Option<SecretString>,

    /// Persistence endpoint for completed Chat/Notification envelopes.
    pub archive_url: Option<String>,

    /// Log output format (default: text).
    pub log_format: LogFormat,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("store_backend", &self.store_backend)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("instance_id", &self.instance_id)
            .field("chat_channel", &self.chat_channel)
            .field("notification_channel", &self.notification_channel)
            .field("write_timeout", &self.write_timeout)
            .field("publish_timeout", &self.publish_timeout)
            .field("publish_max_attempts", &self.publish_max_attempts)
            .field("connection_buffer", &self.connection_buffer)
            .field("mailbox_capacity", &self.mailbox_capacity)
            .field("mailbox_retention", &self.mailbox_retention)
            .field("presence_ttl", &self.presence_ttl)
            .field("max_content_length", &self.max_content_length)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "[REDACTED]"))
            .field("allow_query_identity", &self.allow_query_identity)
            .field(
                "control_api_token",
                &self.control_api_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("archive_url", &self.archive_url)
            .field("log_format", &self.log_format)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}: cannot parse '{raw}'"))),
    }
}

fn string_or(vars: &HashMap<String, String>, key: &str, default: &str) -> String {
    vars.get(key)
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn secret(vars: &HashMap<String, String>, key: &str) -> Option<SecretString> {
    vars.get(key)
        .filter(|v| !v.trim().is_empty())
        .map(|v| SecretString::from(v.clone()))
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let store_backend = match vars.get("CHAT_STORE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => StoreBackend::Redis,
        };

        let redis_url = secret(vars, "REDIS_URL");
        if store_backend == StoreBackend::Redis && redis_url.is_none() {
            return Err(ConfigError::MissingEnvVar("REDIS_URL".to_string()));
        }

        let log_format = match vars.get("CHAT_LOG_FORMAT") {
            Some(raw) => raw.parse()?,
            None => LogFormat::Text,
        };

        let chat_channel = string_or(vars, "CHAT_CHANNEL", DEFAULT_CHAT_CHANNEL);
        let notification_channel =
            string_or(vars, "CHAT_NOTIFICATION_CHANNEL", DEFAULT_NOTIFICATION_CHANNEL);
        if chat_channel.trim().is_empty() || notification_channel.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "broker channel names must not be empty".to_string(),
            ));
        }
        if chat_channel == notification_channel {
            return Err(ConfigError::InvalidValue(
                "CHAT_CHANNEL and CHAT_NOTIFICATION_CHANNEL must differ".to_string(),
            ));
        }

        let write_timeout_ms = parse_or(vars, "CHAT_WRITE_TIMEOUT_MS", DEFAULT_WRITE_TIMEOUT_MS)?;
        let publish_timeout_ms =
            parse_or(vars, "CHAT_PUBLISH_TIMEOUT_MS", DEFAULT_PUBLISH_TIMEOUT_MS)?;
        let publish_max_attempts = parse_or(
            vars,
            "CHAT_PUBLISH_MAX_ATTEMPTS",
            DEFAULT_PUBLISH_MAX_ATTEMPTS,
        )?;
        let connection_buffer =
            parse_or(vars, "CHAT_CONNECTION_BUFFER", DEFAULT_CONNECTION_BUFFER)?;
        let mailbox_capacity = parse_or(vars, "CHAT_MAILBOX_CAPACITY", DEFAULT_MAILBOX_CAPACITY)?;
        let mailbox_retention_seconds = parse_or(
            vars,
            "CHAT_MAILBOX_RETENTION_SECONDS",
            DEFAULT_MAILBOX_RETENTION_SECONDS,
        )?;
        let presence_ttl_seconds = parse_or(
            vars,
            "CHAT_PRESENCE_TTL_SECONDS",
            DEFAULT_PRESENCE_TTL_SECONDS,
        )?;
        let max_content_length =
            parse_or(vars, "CHAT_MAX_CONTENT_LENGTH", DEFAULT_MAX_CONTENT_LENGTH)?;
        let allow_query_identity = parse_or(vars, "CHAT_ALLOW_QUERY_IDENTITY", true)?;

        for (key, value) in [
            ("CHAT_WRITE_TIMEOUT_MS", write_timeout_ms),
            ("CHAT_PUBLISH_TIMEOUT_MS", publish_timeout_ms),
            ("CHAT_PUBLISH_MAX_ATTEMPTS", u64::from(publish_max_attempts)),
            ("CHAT_CONNECTION_BUFFER", connection_buffer as u64),
            ("CHAT_MAILBOX_CAPACITY", mailbox_capacity as u64),
            ("CHAT_MAILBOX_RETENTION_SECONDS", mailbox_retention_seconds),
            ("CHAT_PRESENCE_TTL_SECONDS", presence_ttl_seconds),
            ("CHAT_MAX_CONTENT_LENGTH", max_content_length as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "{key} must be greater than zero"
                )));
            }
        }

        let instance_id = vars.get("CHAT_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            store_backend,
            redis_url,
            bind_address: string_or(vars, "CHAT_BIND_ADDRESS", DEFAULT_BIND_ADDRESS),
            health_bind_address: string_or(
                vars,
                "CHAT_HEALTH_BIND_ADDRESS",
                DEFAULT_HEALTH_BIND_ADDRESS,
            ),
            instance_id,
            chat_channel,
            notification_channel,
            write_timeout: Duration::from_millis(write_timeout_ms),
            publish_timeout: Duration::from_millis(publish_timeout_ms),
            publish_max_attempts,
            connection_buffer,
            mailbox_capacity,
            mailbox_retention: Duration::from_secs(mailbox_retention_seconds),
            presence_ttl: Duration::from_secs(presence_ttl_seconds),
            max_content_length,
            jwt_secret: secret(vars, "CHAT_JWT_SECRET"),
            allow_query_identity,
            control_api_token: secret(vars, "CHAT_CONTROL_API_TOKEN"),
            archive_url: vars
                .get("CHAT_ARCHIVE_URL")
                .filter(|v| !v.trim().is_empty())
                .cloned(),
            log_format,
        })
    }
}
