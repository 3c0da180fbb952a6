use std::path::PathBuf;

use crate::model::Ms;
use crate::pricing::AddOnPolicy;
use crate::storefront::StorefrontOptions;

/// Server settings, read once from `VELOCITA_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    /// `None` disables pending expiry.
    pub pending_ttl_ms: Option<Ms>,
    pub add_on_policy: AddOnPolicy,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "velocita".into(),
            max_connections: 256,
            compact_threshold: 1000,
            pending_ttl_ms: Some(1800 * 1000),
            add_on_policy: AddOnPolicy::Drop,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys keep their defaults;
    /// set-but-unparseable keys are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("VELOCITA_PORT") {
            config.port = parse(v, "VELOCITA_PORT")?;
        }
        if let Some(v) = get("VELOCITA_BIND") {
            config.bind = v;
        }
        if let Some(v) = get("VELOCITA_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("VELOCITA_PASSWORD") {
            config.password = v;
        }
        if let Some(v) = get("VELOCITA_MAX_CONNECTIONS") {
            config.max_connections = parse(v, "VELOCITA_MAX_CONNECTIONS")?;
        }
        if let Some(v) = get("VELOCITA_COMPACT_THRESHOLD") {
            config.compact_threshold = parse(v, "VELOCITA_COMPACT_THRESHOLD")?;
        }
        if let Some(v) = get("VELOCITA_PENDING_TTL_SECS") {
            let secs: u32 = parse(v, "VELOCITA_PENDING_TTL_SECS")?;
            config.pending_ttl_ms = (secs > 0).then(|| Ms::from(secs) * 1000);
        }
        if let Some(v) = get("VELOCITA_UNKNOWN_ADDONS") {
            config.add_on_policy = v
                .parse()
                .map_err(|e: String| ConfigError::Invalid("VELOCITA_UNKNOWN_ADDONS", e))?;
        }
        if let Some(v) = get("VELOCITA_METRICS_PORT") {
            config.metrics_port = Some(parse(v, "VELOCITA_METRICS_PORT")?);
        }
        config.tls_cert = get("VELOCITA_TLS_CERT");
        config.tls_key = get("VELOCITA_TLS_KEY");
        if config.tls_cert.is_some() != config.tls_key.is_some() {
            return Err(ConfigError::Invalid(
                "VELOCITA_TLS_CERT",
                "VELOCITA_TLS_CERT and VELOCITA_TLS_KEY must be set together".into(),
            ));
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn storefront_options(&self) -> StorefrontOptions {
        StorefrontOptions {
            compact_threshold: self.compact_threshold,
            pending_ttl_ms: self.pending_ttl_ms,
            add_on_policy: self.add_on_policy,
        }
    }
}

fn parse<T: std::str::FromStr>(raw: String, key: &'static str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::Invalid(key, format!("{raw:?}: {e}")))
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid(key, msg) => write!(f, "invalid {key}: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
