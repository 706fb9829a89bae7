use crate::types::WebhookEvent;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::{Choice, ConstantTimeEq};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOLERANCE_SECS: i64 = 300;
pub const DEFAULT_SCHEME: &str = "v1";
const TIMESTAMP_TAG: &str = "t";

/// What a successfully verified payload decodes into.
pub type ParsedPayload = WebhookEvent;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("unable to extract timestamp from signature header")]
    MalformedHeader,
    #[error("no signatures found with expected scheme `{0}`")]
    NoSignaturesForScheme(String),
    #[error("no signatures found matching the expected signature for payload")]
    SignatureMismatch,
    #[error("timestamp outside the tolerance zone (age {age}s, tolerance {tolerance}s)")]
    StaleTimestamp { age: i64, tolerance: i64 },
    #[error("payload could not be decoded: {0}")]
    MalformedPayload(String),
}

impl VerificationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedHeader => "malformed_header",
            Self::NoSignaturesForScheme(_) => "no_signatures_for_scheme",
            Self::SignatureMismatch => "signature_mismatch",
            Self::StaleTimestamp { .. } => "stale_timestamp",
            Self::MalformedPayload(_) => "malformed_payload",
        }
    }
}

/// `t=<unix-seconds>,v1=<hex>[,v1=<hex>...]`; several signatures appear while
/// the sender rotates secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

impl SignatureHeader {
    /// Parse a `key=value,key=value` header. The first `t` pair wins; every
    /// pair tagged with `scheme` is kept in order.
    pub fn parse(header: &str, scheme: &str) -> Result<Self, VerificationError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for item in header.split(',') {
            let Some((key, value)) = item.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            if key == TIMESTAMP_TAG {
                if timestamp.is_none() {
                    let parsed = value
                        .parse::<i64>()
                        .map_err(|_| VerificationError::MalformedHeader)?;
                    timestamp = Some(parsed);
                }
            } else if key == scheme {
                signatures.push(value.to_string());
            }
        }

        let timestamp = timestamp.ok_or(VerificationError::MalformedHeader)?;
        if signatures.is_empty() {
            return Err(VerificationError::NoSignaturesForScheme(scheme.to_string()));
        }

        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Constant-time equality for digests.
///
/// Lengths are public (a hex SHA-256 digest is always 64 bytes), but a
/// candidate of the wrong length still costs one full comparison so the
/// work done never depends on where the inputs first differ.
pub fn constant_time_eq(expected: &[u8], candidate: &[u8]) -> Choice {
    let same_len = (expected.len() as u64).ct_eq(&(candidate.len() as u64));
    let probe = if candidate.len() == expected.len() {
        candidate
    } else {
        expected
    };
    expected.ct_eq(probe) & same_len
}

/// Lowercase hex HMAC-SHA256 of `"<timestamp>.<payload>"`.
pub fn sign(secret: &str, timestamp: i64, payload: &str) -> Result<String, VerificationError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::SignatureMismatch)?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Stateless verifier; cheap to clone and safe to share across tasks.
#[derive(Debug, Clone)]
pub struct Verifier {
    scheme: String,
    tolerance_secs: i64,
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEME, DEFAULT_TOLERANCE_SECS)
    }
}

impl Verifier {
    /// A tolerance of zero or less disables the freshness check.
    pub fn new(scheme: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            scheme: scheme.into(),
            tolerance_secs,
        }
    }

    pub fn verify(
        &self,
        payload: &[u8],
        header: &str,
        secret: &str,
    ) -> Result<ParsedPayload, VerificationError> {
        self.verify_at(payload, header, secret, Utc::now().timestamp())
    }

    /// Same as [`Verifier::verify`] with an explicit notion of "now".
    pub fn verify_at(
        &self,
        payload: &[u8],
        header: &str,
        secret: &str,
        now: i64,
    ) -> Result<ParsedPayload, VerificationError> {
        let details = SignatureHeader::parse(header, &self.scheme)?;

        let payload = std::str::from_utf8(payload)
            .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;

        let expected = sign(secret, details.timestamp, payload)?;

        // Every candidate is compared; no early exit on the first match.
        let matched = details
            .signatures
            .iter()
            .fold(Choice::from(0), |found, candidate| {
                found | constant_time_eq(expected.as_bytes(), candidate.as_bytes())
            });
        if !bool::from(matched) {
            return Err(VerificationError::SignatureMismatch);
        }

        let age = now.saturating_sub(details.timestamp);
        if self.tolerance_secs > 0 && age > self.tolerance_secs {
            return Err(VerificationError::StaleTimestamp {
                age,
                tolerance: self.tolerance_secs,
            });
        }

        serde_json::from_str(payload).map_err(|e| VerificationError::MalformedPayload(e.to_string()))
    }
}

/// Verify with the default `v1` scheme and the given tolerance.
pub fn verify(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
) -> Result<ParsedPayload, VerificationError> {
    Verifier::new(DEFAULT_SCHEME, tolerance_secs).verify(payload, header, secret)
}
