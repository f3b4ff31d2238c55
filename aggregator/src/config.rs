use serde_json::json;
use url::Url;

pub const DEFAULT_MAX_TIMEOUT_MS: u64 = 27_000;
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SIGNALING_TTL_SECS: u64 = 300;
const DEFAULT_RESOURCE_URL: &str = "http://localhost:8080";

#[derive(Clone, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SignalingConfig {
    pub ttl_seconds: u64,
    /// Opaque ICE server configuration echoed to clients at session
    /// creation; the gateway never interprets it.
    pub ice_servers: serde_json::Value,
}

/// Runtime configuration, sourced from environment variables.
#[derive(Clone, Debug)]
pub struct Config {
    pub listener: Listener,
    /// Public URL of this gateway's callback endpoint, handed to resources
    /// so they can post results back.
    pub callback_url: String,
    pub resource_urls: Vec<Url>,
    /// Cap applied to client-requested timeouts.
    pub max_timeout_ms: u64,
    pub signaling: SignalingConfig,
    pub metrics: Option<MetricsConfig>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: &'static str, message: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the config from an arbitrary variable source so tests can
    /// inject values without mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = parse_var(&lookup, "SERVER_PORT", DEFAULT_PORT)?;
        let host = lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let callback_url = lookup("AGGREGATOR_CALLBACK_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingVar("AGGREGATOR_CALLBACK_URL"))?;

        let resource_urls = parse_resource_urls(lookup("RESOURCE_URLS").as_deref())?;

        let max_timeout_ms =
            parse_var(&lookup, "AGGREGATOR_TIMEOUT_MAX_MS", DEFAULT_MAX_TIMEOUT_MS)?;

        let ttl_seconds =
            parse_var(&lookup, "SIGNALING_TTL_SECONDS", DEFAULT_SIGNALING_TTL_SECS)?;
        let ice_servers = match lookup("SIGNALING_ICE_SERVERS") {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                var: "SIGNALING_ICE_SERVERS",
                message: e.to_string(),
            })?,
            None => default_ice_servers(),
        };

        let metrics = match lookup("STATSD_HOST") {
            Some(statsd_host) => Some(MetricsConfig {
                statsd_host,
                statsd_port: parse_var(&lookup, "STATSD_PORT", 8125)?,
            }),
            None => None,
        };

        Ok(Config {
            listener: Listener { host, port },
            callback_url,
            resource_urls,
            max_timeout_ms,
            signaling: SignalingConfig {
                ttl_seconds,
                ice_servers,
            },
            metrics,
        })
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            var,
            message: format!("{e}"),
        }),
        None => Ok(default),
    }
}

fn parse_resource_urls(raw: Option<&str>) -> Result<Vec<Url>, ConfigError> {
    let raw = raw.unwrap_or("").trim();
    if raw.is_empty() {
        tracing::warn!(
            "RESOURCE_URLS not set, defaulting to a single resource at {DEFAULT_RESOURCE_URL}"
        );
        return Ok(vec![Url::parse(DEFAULT_RESOURCE_URL).expect("default resource URL")]);
    }

    raw.split(',')
        .map(|entry| {
            Url::parse(entry.trim()).map_err(|e| ConfigError::InvalidValue {
                var: "RESOURCE_URLS",
                message: format!("{entry:?}: {e}"),
            })
        })
        .collect()
}

fn default_ice_servers() -> serde_json::Value {
    json!([{ "urls": ["stun:stun.l.google.com:19302"] }])
}
