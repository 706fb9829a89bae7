use crate::store::{get_json, PutOptions, StateStore, StoreError};
use crate::types::{
    pending_key, verified_key, LookupResponse, PendingRecord, Survey, VerifiedRecord,
    PENDING_TTL_SECS,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// Serialized pending records larger than this are refused.
pub const MAX_PENDING_BYTES: usize = 2000;

const PROOF_URL_PREFIX: &str = "https://twitter.com/";

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("proof must link to a post: https://twitter.com/<user>/status/<id>")]
    InvalidProofUrl,
    #[error("claim is {0} bytes, limit is {max}", max = MAX_PENDING_BYTES)]
    TooLarge(usize),
    #[error("`{0}` is already verified")]
    AlreadyVerified(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode claim: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaimRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub proof: Option<String>,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub love: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub ye: Option<String>,
    #[serde(default)]
    pub literal: Option<String>,
    #[serde(default)]
    pub judge: Option<String>,
}

fn required(value: Option<String>, name: &'static str) -> Result<String, ClaimError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(ClaimError::MissingField(name))
}

/// Extract `(user, post id)` from a post URL.
pub fn parse_proof_url(url: &str) -> Option<(&str, &str)> {
    let start = url.find(PROOF_URL_PREFIX)?;
    let rest = &url[start + PROOF_URL_PREFIX.len()..];
    let (user, tail) = rest.split_once('/')?;
    let tail = tail.strip_prefix("status/")?;
    let digits = tail
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(tail.len());
    let post_id = &tail[..digits];
    if user.is_empty() || post_id.is_empty() {
        return None;
    }
    Some((user, post_id))
}

/// Validate a claim and store it as pending for a week.
pub async fn submit_claim(
    store: &dyn StateStore,
    request: ClaimRequest,
    payment_link: &str,
) -> Result<PendingRecord, ClaimError> {
    let email = required(request.email, "email")?;
    let proof = required(request.proof, "proof")?;
    let emoji = required(request.emoji, "emoji")?;
    let survey = Survey {
        love: required(request.love, "love")?,
        literal: required(request.literal, "literal")?,
        ye: required(request.ye, "ye")?,
        reason: required(request.reason, "reason")?,
        judge: required(request.judge, "judge")?,
    };

    let (user, post_id) = parse_proof_url(&proof).ok_or(ClaimError::InvalidProofUrl)?;

    let record = PendingRecord {
        email,
        proof: post_id.to_string(),
        emoji,
        user: user.to_string(),
        creation_date: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        survey,
        payment_link: payment_link.to_string(),
    };

    let encoded = serde_json::to_string(&record)?;
    if encoded.len() > MAX_PENDING_BYTES {
        return Err(ClaimError::TooLarge(encoded.len()));
    }

    if store.get(&verified_key(&record.user)).await?.is_some() {
        return Err(ClaimError::AlreadyVerified(record.user));
    }

    store
        .put(
            &pending_key(&record.email),
            encoded,
            PutOptions::expiring_after(PENDING_TTL_SECS),
        )
        .await?;
    info!(user = %record.user, "pending claim stored");
    Ok(record)
}

pub async fn lookup(store: &dyn StateStore, handle: &str) -> Result<LookupResponse, StoreError> {
    let record: Option<VerifiedRecord> = get_json(store, &verified_key(handle)).await?;
    Ok(LookupResponse::from_record(record.as_ref()))
}
