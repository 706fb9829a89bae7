use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type the payment provider sends once a checkout has been paid.
pub const PAYMENT_COMPLETED: &str = "checkout.session.completed";

/// Pending claims expire after a week if payment never arrives.
pub const PENDING_TTL_SECS: i64 = 60 * 60 * 24 * 7;

/// How long lookup clients may cache a positive answer.
pub const VERIFIED_LOOKUP_TTL_SECS: u64 = 24 * 60 * 60;

/// How long lookup clients may cache a negative answer.
pub const UNVERIFIED_LOOKUP_TTL_SECS: u64 = 30 * 60;

pub fn pending_key(email: &str) -> String {
    format!("pending:{email}")
}

pub fn verified_key(user: &str) -> String {
    format!("verified:{user}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Survey {
    pub love: String,
    pub literal: String,
    pub ye: String,
    pub reason: String,
    pub judge: String,
}

/// A claim that has been submitted but not yet paid for and confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecord {
    pub email: String,
    /// Identifier of the proof post on the content provider.
    pub proof: String,
    pub emoji: String,
    /// The claimed handle.
    pub user: String,
    pub creation_date: String,
    pub survey: Survey,
    pub payment_link: String,
}

/// The immutable result of a completed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedRecord {
    pub email: String,
    pub user: String,
    pub emoji: String,
    pub proof: String,
    pub survey: Survey,
}

impl From<PendingRecord> for VerifiedRecord {
    fn from(pending: PendingRecord) -> Self {
        Self {
            email: pending.email,
            user: pending.user,
            emoji: pending.emoji,
            proof: pending.proof,
            survey: pending.survey,
        }
    }
}

/// Decoded body of an authenticated webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: EventData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Shape depends on the event type, so it stays untyped.
    #[serde(default)]
    pub object: Value,
}

impl WebhookEvent {
    pub fn is_payment_completed(&self) -> bool {
        self.event_type == PAYMENT_COMPLETED
    }

    /// Customer email from `data.object.customer_details.email`, if present and non-empty.
    pub fn customer_email(&self) -> Option<&str> {
        self.data
            .object
            .get("customer_details")
            .and_then(|details| details.get("email"))
            .and_then(Value::as_str)
            .filter(|email| !email.is_empty())
    }
}

/// Response body served to third parties asking whether a handle is verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResponse {
    #[serde(rename = "TTL")]
    pub ttl: u64,
    pub data: Option<LookupData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupData {
    pub proof: String,
    pub emoji: String,
}

impl LookupResponse {
    pub fn from_record(record: Option<&VerifiedRecord>) -> Self {
        match record {
            Some(record) => Self {
                ttl: VERIFIED_LOOKUP_TTL_SECS,
                data: Some(LookupData {
                    proof: record.proof.clone(),
                    emoji: record.emoji.clone(),
                }),
            },
            None => Self {
                ttl: UNVERIFIED_LOOKUP_TTL_SECS,
                data: None,
            },
        }
    }
}
