use crate::content::DEFAULT_FETCH_TIMEOUT;
use crate::pipeline::DEFAULT_MARKER;
use crate::verification::{DEFAULT_SCHEME, DEFAULT_TOLERANCE_SECS};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: `{value}`")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub webhook_secret: String,
    pub content_api_token: String,
    pub content_api_base_url: String,
    pub bind_addr: String,
    /// Where store snapshots live. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub signature_tolerance_secs: i64,
    pub signature_scheme: String,
    pub signature_header: String,
    pub proof_marker: String,
    pub fetch_timeout: Duration,
    pub payment_link: String,
    pub allowed_origin: String,
    pub audit_enabled: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| var(name).ok_or(ConfigError::Missing(name));

        Ok(Self {
            webhook_secret: required("WEBHOOK_SECRET")?,
            content_api_token: required("CONTENT_API_TOKEN")?,
            content_api_base_url: var("CONTENT_API_BASE_URL")
                .unwrap_or_else(|| "https://api.twitter.com".to_string()),
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8787".to_string()),
            data_dir: var("DATA_DIR").map(PathBuf::from),
            signature_tolerance_secs: parse_var(&var, "SIGNATURE_TOLERANCE_SECS")?
                .unwrap_or(DEFAULT_TOLERANCE_SECS),
            signature_scheme: var("SIGNATURE_SCHEME").unwrap_or_else(|| DEFAULT_SCHEME.to_string()),
            signature_header: var("SIGNATURE_HEADER")
                .unwrap_or_else(|| "stripe-signature".to_string())
                .to_ascii_lowercase(),
            proof_marker: var("PROOF_MARKER").unwrap_or_else(|| DEFAULT_MARKER.to_string()),
            fetch_timeout: parse_var(&var, "FETCH_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_FETCH_TIMEOUT),
            payment_link: var("PAYMENT_LINK").unwrap_or_default(),
            allowed_origin: var("ALLOWED_ORIGIN")
                .unwrap_or_else(|| "https://twitter.com".to_string()),
            audit_enabled: parse_var(&var, "AUDIT_ENABLED")?.unwrap_or(true),
        })
    }
}

fn parse_var<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    var(name)
        .map(|value| {
            value.trim().parse().map_err(|_| ConfigError::Invalid {
                name,
                value: value.clone(),
            })
        })
        .transpose()
}
