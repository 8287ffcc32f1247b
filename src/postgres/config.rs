use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::QuoteStoreError;

const DEFAULT_MAX_OPEN_CONNS: u32 = 10;
const DEFAULT_IDLE_LIFETIME: Duration = Duration::from_secs(60);
const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(60 * 60);
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection and pool parameters for the quote database.
///
/// `host` may carry a port (`db.internal:6432`, `[::1]:5432`). Durations are
/// humantime strings in config files; a zero idle or max lifetime disables the limit.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub host: String,
    pub db_name: String,
    pub user: String,
    pub password: String,
    pub max_open_conns: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    pub conn_idle_lifetime: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub conn_max_lifetime: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub acquire_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    pub auto_migrate: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            host: "localhost:5432".to_string(),
            db_name: "quotes".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
            conn_idle_lifetime: DEFAULT_IDLE_LIFETIME,
            conn_max_lifetime: DEFAULT_MAX_LIFETIME,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auto_migrate: false,
        }
    }
}

// Keeps the password out of logs.
impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("host", &self.host)
            .field("db_name", &self.db_name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("max_open_conns", &self.max_open_conns)
            .field("conn_idle_lifetime", &self.conn_idle_lifetime)
            .field("conn_max_lifetime", &self.conn_max_lifetime)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("auto_migrate", &self.auto_migrate)
            .finish()
    }
}

/// Pool limits derived from [`StorageConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_open_conns: u32,
    pub conn_idle_lifetime: Option<Duration>,
    pub conn_max_lifetime: Option<Duration>,
    pub acquire_timeout: Duration,
}

impl PoolSettings {
    /// # Errors
    /// Returns `ConfigError` for a zero pool size or a zero acquire timeout.
    pub fn validate(&self) -> Result<(), QuoteStoreError> {
        if self.max_open_conns == 0 {
            return Err(QuoteStoreError::ConfigError(
                "max_open_conns must be at least 1".to_string(),
            ));
        }
        if self.acquire_timeout.is_zero() {
            return Err(QuoteStoreError::ConfigError(
                "acquire_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl StorageConfig {
    /// Check required fields before anything touches the network.
    ///
    /// # Errors
    /// Returns `ConfigError` naming the first missing or invalid field.
    pub fn validate(&self) -> Result<(), QuoteStoreError> {
        if self.host.trim().is_empty() {
            return Err(QuoteStoreError::ConfigError("host is required".to_string()));
        }
        if self.db_name.trim().is_empty() {
            return Err(QuoteStoreError::ConfigError(
                "db_name is required".to_string(),
            ));
        }
        if self.user.trim().is_empty() {
            return Err(QuoteStoreError::ConfigError("user is required".to_string()));
        }
        self.pool_settings().validate()
    }

    #[must_use]
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_open_conns: self.max_open_conns,
            conn_idle_lifetime: non_zero(self.conn_idle_lifetime),
            conn_max_lifetime: non_zero(self.conn_max_lifetime),
            acquire_timeout: self.acquire_timeout,
        }
    }

    /// Assemble a libpq-style `key=value` connection string.
    ///
    /// # Errors
    /// Returns `ConfigError` when the port part of `host` is not a valid port number.
    pub fn dsn(&self) -> Result<String, QuoteStoreError> {
        let (host, port) = split_host_port(&self.host)?;
        let mut parts = vec![format!("host={}", quote_value(host))];
        if let Some(port) = port {
            parts.push(format!("port={port}"));
        }
        parts.push(format!("dbname={}", quote_value(&self.db_name)));
        parts.push(format!("user={}", quote_value(&self.user)));
        if !self.password.is_empty() {
            parts.push(format!("password={}", quote_value(&self.password)));
        }
        if !self.connect_timeout.is_zero() {
            let secs = self.connect_timeout.as_secs().max(1);
            parts.push(format!("connect_timeout={secs}"));
        }
        parts.push("application_name=quote-service".to_string());
        Ok(parts.join(" "))
    }

    /// Validate, assemble and parse the connection string.
    ///
    /// # Errors
    /// Returns `ConfigError` if validation fails or the driver rejects the string.
    pub fn pg_config(&self) -> Result<tokio_postgres::Config, QuoteStoreError> {
        self.validate()?;
        self.dsn()?.parse::<tokio_postgres::Config>().map_err(|e| {
            QuoteStoreError::ConfigError(format!("invalid connection string: {e}"))
        })
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    if d.is_zero() { None } else { Some(d) }
}

fn split_host_port(raw: &str) -> Result<(&str, Option<u16>), QuoteStoreError> {
    let raw = raw.trim();
    // unix socket directory
    if raw.starts_with('/') {
        return Ok((raw, None));
    }

    let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
        match rest.split_once(']') {
            Some((host, "")) => (host, None),
            Some((host, tail)) => match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => {
                    return Err(QuoteStoreError::ConfigError(format!(
                        "invalid host {raw:?}"
                    )));
                }
            },
            None => {
                return Err(QuoteStoreError::ConfigError(format!(
                    "invalid host {raw:?}: missing ']'"
                )));
            }
        }
    } else if raw.matches(':').count() == 1 {
        let (host, port) = raw.split_once(':').unwrap_or((raw, ""));
        (host, Some(port))
    } else {
        (raw, None)
    };

    let port = port
        .map(|p| {
            p.parse::<u16>().map_err(|_| {
                QuoteStoreError::ConfigError(format!("invalid port {p:?} in host {raw:?}"))
            })
        })
        .transpose()?;
    if host.is_empty() {
        return Err(QuoteStoreError::ConfigError("host is required".to_string()));
    }
    Ok((host, port))
}

fn quote_value(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| !c.is_whitespace() && c != '\'' && c != '\\');
    if plain {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Accepts humantime strings (`"90s"`, `"1h 30m"`) or plain seconds.
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Secs(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Text(s) => humantime::parse_duration(s.trim()).map_err(serde::de::Error::custom),
        Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
    }
}
