use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Posts created before 2020-11-04T01:32:55.232Z are rejected outright.
pub const PROOF_CUTOFF_MILLIS: i64 = 1_604_453_575_232;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

const SNIPPET_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid post identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("content provider did not answer within {0:?}")]
    Timeout(Duration),
    #[error("content provider request failed: {0}")]
    Transport(String),
    #[error("content provider returned status {status}: {snippet}")]
    Status { status: u16, snippet: String },
    #[error("post {id} not found in provider response: {snippet}")]
    MissingPost { id: String, snippet: String },
    #[error("could not decode provider response: {0}")]
    Decode(String),
    #[error("post {id} was created at {created_at}, before the proof cutoff")]
    PredatesCutoff { id: String, created_at: String },
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier(_) => "invalid_identifier",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::Status { .. } => "status",
            Self::MissingPost { .. } => "missing_post",
            Self::Decode(_) => "decode",
            Self::PredatesCutoff { .. } => "predates_cutoff",
        }
    }

    /// True when asking again cannot produce a different answer.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::InvalidIdentifier(_) | Self::MissingPost { .. } | Self::PredatesCutoff { .. } => {
                true
            }
            Self::Status { status, .. } => matches!(status, 404 | 410),
            Self::Timeout(_) | Self::Transport(_) | Self::Decode(_) => false,
        }
    }
}

/// Makes exactly one attempt per call; retrying is left to the webhook sender.
#[async_trait]
pub trait ContentClient: Send + Sync {
    async fn fetch_proof_text(&self, identifier: &str) -> Result<String, FetchError>;
}

pub struct HttpContentClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    timeout: Duration,
    cutoff_millis: i64,
}

impl HttpContentClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            timeout,
            cutoff_millis: PROOF_CUTOFF_MILLIS,
        })
    }

    pub fn with_cutoff_millis(mut self, cutoff_millis: i64) -> Self {
        self.cutoff_millis = cutoff_millis;
        self
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl ContentClient for HttpContentClient {
    async fn fetch_proof_text(&self, identifier: &str) -> Result<String, FetchError> {
        if identifier.is_empty()
            || !identifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(FetchError::InvalidIdentifier(identifier.to_string()));
        }

        let url = format!(
            "{}/2/timeline/conversation/{identifier}.json",
            self.base_url
        );
        debug!(%url, "fetching proof post");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.classify(e))?;

        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                snippet: snippet(&body),
            });
        }

        let document: Value =
            serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))?;
        let post = document
            .get("globalObjects")
            .and_then(|g| g.get("tweets"))
            .and_then(|t| t.get(identifier))
            .ok_or_else(|| FetchError::MissingPost {
                id: identifier.to_string(),
                snippet: snippet(&body),
            })?;

        let text = post
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::Decode(format!("post {identifier} has no text")))?;
        let raw_created = post
            .get("created_at")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::Decode(format!("post {identifier} has no created_at")))?;
        let created_at = parse_created_at(raw_created).ok_or_else(|| {
            FetchError::Decode(format!("unrecognised created_at `{raw_created}`"))
        })?;

        if created_at.timestamp_millis() < self.cutoff_millis {
            return Err(FetchError::PredatesCutoff {
                id: identifier.to_string(),
                created_at: raw_created.to_string(),
            });
        }

        Ok(text.to_string())
    }
}

/// Accepts the provider's legacy format as well as RFC 3339 and RFC 2822.
fn parse_created_at(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(raw, "%a %b %d %H:%M:%S %z %Y")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .ok()
}

fn snippet(body: &str) -> String {
    body.chars().take(SNIPPET_CHARS).collect()
}
