//! Service configuration loading from a TOML file and environment variables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::postgres::StorageConfig;
use crate::postgres::config::deserialize_duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub rest: RestConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Upper bound on each request's storage work; zero disables it.
    #[serde(deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,
}

impl RestConfig {
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 8080,
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `quote_service=debug,info`.
    pub level: String,
    pub json: bool,
    /// Log lines are also appended here when set.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {reason}")]
    Env { var: &'static str, reason: String },
}

/// Load `path` (defaults when it is absent or missing), then apply environment
/// overrides.
///
/// Recognised variables: `STORAGE_HOST`, `STORAGE_DB_NAME`, `STORAGE_USER`,
/// `STORAGE_PASSWORD`, `STORAGE_MAX_OPEN_CONNS`, `STORAGE_CONN_IDLE_LIFETIME`,
/// `STORAGE_CONN_MAX_LIFETIME`, `STORAGE_ACQUIRE_TIMEOUT`, `STORAGE_CONNECT_TIMEOUT`,
/// `STORAGE_AUTO_MIGRATE`, `REST_HOST`, `REST_PORT`, `REST_REQUEST_TIMEOUT`,
/// `LOG_LEVEL`, `LOG_JSON`, `LOG_FILE`.
///
/// # Errors
/// Returns `ConfigLoadError` if the file exists but cannot be read or parsed, or
/// an override does not parse.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigLoadError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %p.display(), "config file not found, using defaults");
                Config::default()
            }
            Err(source) => {
                return Err(ConfigLoadError::FileRead {
                    path: p.to_path_buf(),
                    source,
                });
            }
        },
        None => Config::default(),
    };
    apply_env(&mut config, |var| std::env::var(var).ok())?;
    Ok(config)
}

fn apply_env(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigLoadError> {
    let storage = &mut config.storage;
    if let Some(v) = lookup("STORAGE_HOST") {
        storage.host = v;
    }
    if let Some(v) = lookup("STORAGE_DB_NAME") {
        storage.db_name = v;
    }
    if let Some(v) = lookup("STORAGE_USER") {
        storage.user = v;
    }
    if let Some(v) = lookup("STORAGE_PASSWORD") {
        storage.password = v;
    }
    if let Some(v) = lookup("STORAGE_MAX_OPEN_CONNS") {
        storage.max_open_conns = parse("STORAGE_MAX_OPEN_CONNS", &v)?;
    }
    if let Some(v) = lookup("STORAGE_CONN_IDLE_LIFETIME") {
        storage.conn_idle_lifetime = duration("STORAGE_CONN_IDLE_LIFETIME", &v)?;
    }
    if let Some(v) = lookup("STORAGE_CONN_MAX_LIFETIME") {
        storage.conn_max_lifetime = duration("STORAGE_CONN_MAX_LIFETIME", &v)?;
    }
    if let Some(v) = lookup("STORAGE_ACQUIRE_TIMEOUT") {
        storage.acquire_timeout = duration("STORAGE_ACQUIRE_TIMEOUT", &v)?;
    }
    if let Some(v) = lookup("STORAGE_CONNECT_TIMEOUT") {
        storage.connect_timeout = duration("STORAGE_CONNECT_TIMEOUT", &v)?;
    }
    if let Some(v) = lookup("STORAGE_AUTO_MIGRATE") {
        storage.auto_migrate = flag("STORAGE_AUTO_MIGRATE", &v)?;
    }

    if let Some(v) = lookup("REST_HOST") {
        config.rest.host = parse("REST_HOST", &v)?;
    }
    if let Some(v) = lookup("REST_PORT") {
        config.rest.port = parse("REST_PORT", &v)?;
    }
    if let Some(v) = lookup("REST_REQUEST_TIMEOUT") {
        config.rest.request_timeout = duration("REST_REQUEST_TIMEOUT", &v)?;
    }

    if let Some(v) = lookup("LOG_LEVEL") {
        config.logging.level = v;
    }
    if let Some(v) = lookup("LOG_JSON") {
        config.logging.json = flag("LOG_JSON", &v)?;
    }
    if let Some(v) = lookup("LOG_FILE") {
        config.logging.file = (!v.is_empty()).then(|| PathBuf::from(v));
    }
    Ok(())
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, ConfigLoadError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigLoadError::Env {
        var,
        reason: e.to_string(),
    })
}

/// humantime (`"90s"`) or bare seconds (`"90"`).
fn duration(var: &'static str, raw: &str) -> Result<Duration, ConfigLoadError> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(raw).map_err(|e| ConfigLoadError::Env {
        var,
        reason: e.to_string(),
    })
}

fn flag(var: &'static str, raw: &str) -> Result<bool, ConfigLoadError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigLoadError::Env {
            var,
            reason: format!("expected a boolean, got {other:?}"),
        }),
    }
}
