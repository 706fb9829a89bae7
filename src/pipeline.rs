use crate::content::{ContentClient, FetchError};
use crate::store::{get_json, put_json, PutOptions, StateStore, StoreError};
use crate::types::{pending_key, verified_key, PendingRecord, VerifiedRecord};
use crate::verification::{VerificationError, Verifier};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MARKER: &str = "zabaglione";

#[derive(Debug)]
pub enum Outcome {
    /// The claim was promoted.
    Verified { user: String },
    /// Not a payment-completed event, or no customer email on it.
    Ignored { event_type: String },
    NoPendingClaim { email: String },
    DuplicateClaim { user: String },
    ContentMismatch { user: String },
    AuthenticationFailed(VerificationError),
    FetchFailed(FetchError),
    StoreFailed(StoreError),
}

/// How the sender should be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed or safely ignored; the sender must not retry.
    Acknowledged,
    /// Authentication failed.
    Rejected,
    /// Transient failure; the sender may retry.
    Failed,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Verified { .. } => "verified",
            Self::Ignored { .. } => "ignored",
            Self::NoPendingClaim { .. } => "no_pending_claim",
            Self::DuplicateClaim { .. } => "duplicate_claim",
            Self::ContentMismatch { .. } => "content_mismatch",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::FetchFailed(_) => "fetch_failed",
            Self::StoreFailed(_) => "store_failed",
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Verified { .. }
            | Self::Ignored { .. }
            | Self::NoPendingClaim { .. }
            | Self::DuplicateClaim { .. }
            | Self::ContentMismatch { .. } => Disposition::Acknowledged,
            Self::AuthenticationFailed(_) => Disposition::Rejected,
            Self::FetchFailed(_) | Self::StoreFailed(_) => Disposition::Failed,
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            Self::AuthenticationFailed(e) => Some(e.to_string()),
            Self::FetchFailed(e) => Some(e.to_string()),
            Self::StoreFailed(e) => Some(e.to_string()),
            _ => None,
        }
    }
}

/// The result of handling one webhook delivery, plus the diagnostic trail
/// gathered on the way.
#[derive(Debug)]
pub struct Delivery {
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub trail: Map<String, Value>,
}

impl Delivery {
    /// Audit document for this delivery; `None` on success.
    pub fn audit_entry(&self) -> Option<Value> {
        if self.outcome.is_success() {
            return None;
        }
        let mut entry = self.trail.clone();
        entry.insert("delivery_id".into(), json!(self.id));
        entry.insert("received_at".into(), json!(self.received_at.to_rfc3339()));
        entry.insert("outcome".into(), json!(self.outcome.kind()));
        if let Some(detail) = self.outcome.detail() {
            entry.insert("detail".into(), json!(detail));
        }
        Some(Value::Object(entry))
    }
}

pub struct Pipeline {
    verifier: Verifier,
    store: Arc<dyn StateStore>,
    content: Arc<dyn ContentClient>,
    marker: String,
}

impl Pipeline {
    pub fn new(
        verifier: Verifier,
        store: Arc<dyn StateStore>,
        content: Arc<dyn ContentClient>,
        marker: &str,
    ) -> Self {
        Self {
            verifier,
            store,
            content,
            marker: marker.to_lowercase(),
        }
    }

    pub async fn handle_webhook(
        &self,
        raw_payload: &[u8],
        signature_header: &str,
        secret: &str,
    ) -> Delivery {
        let mut trail = Map::new();
        let outcome = self
            .process(raw_payload, signature_header, secret, &mut trail)
            .await;
        Delivery {
            id: Uuid::new_v4().to_string(),
            received_at: Utc::now(),
            outcome,
            trail,
        }
    }

    async fn process(
        &self,
        raw_payload: &[u8],
        signature_header: &str,
        secret: &str,
        trail: &mut Map<String, Value>,
    ) -> Outcome {
        let event = match self.verifier.verify(raw_payload, signature_header, secret) {
            Ok(event) => event,
            Err(err) => {
                warn!(kind = err.kind(), "webhook authentication failed");
                trail.insert("webhook_error".into(), json!(err.kind()));
                return Outcome::AuthenticationFailed(err);
            }
        };

        trail.insert("event_type".into(), json!(event.event_type));
        if !event.is_payment_completed() {
            debug!(event_type = %event.event_type, "ignoring event");
            return Outcome::Ignored {
                event_type: event.event_type,
            };
        }
        trail.insert("payment_received".into(), json!(true));

        let Some(email) = event.customer_email() else {
            debug!("payment event carries no customer email");
            return Outcome::Ignored {
                event_type: event.event_type.clone(),
            };
        };
        trail.insert("email".into(), json!(email));

        match self.promote(email, trail).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%email, error = %err, "state store failure");
                Outcome::StoreFailed(err)
            }
        }
    }

    async fn promote(
        &self,
        email: &str,
        trail: &mut Map<String, Value>,
    ) -> Result<Outcome, StoreError> {
        let pending_key = pending_key(email);
        let Some(pending) = get_json::<PendingRecord>(&*self.store, &pending_key).await?
        else {
            info!(%email, "no pending claim for payment");
            return Ok(Outcome::NoPendingClaim {
                email: email.to_string(),
            });
        };
        trail.insert("pending_record".into(), json!(pending));

        let verified_key = verified_key(&pending.user);
        if self.store.get(&verified_key).await?.is_some() {
            warn!(%email, user = %pending.user, "duplicate purchase for verified user");
            trail.insert(
                "duplicate_purchase".into(),
                json!({ "email": email, "user": pending.user }),
            );
            return Ok(Outcome::DuplicateClaim { user: pending.user });
        }

        let text = match self.content.fetch_proof_text(&pending.proof).await {
            Ok(text) => text,
            Err(err) if err.is_permanent() => {
                info!(user = %pending.user, kind = err.kind(), "proof post unusable");
                trail.insert("fetch_error".into(), json!(err.to_string()));
                return Ok(Outcome::ContentMismatch { user: pending.user });
            }
            Err(err) => {
                warn!(user = %pending.user, kind = err.kind(), error = %err, "proof fetch failed");
                trail.insert("fetch_error".into(), json!(err.to_string()));
                return Ok(Outcome::FetchFailed(err));
            }
        };
        trail.insert("proof_text".into(), json!(text));

        if !text.to_lowercase().contains(&self.marker) {
            info!(user = %pending.user, "proof post lacks marker");
            return Ok(Outcome::ContentMismatch { user: pending.user });
        }

        // Write before delete: a crash in between leaves a pending record that
        // the duplicate guard above will absorb.
        let record = VerifiedRecord::from(pending);
        put_json(&*self.store, &verified_key, &record, PutOptions::default()).await?;
        self.store.delete(&pending_key).await?;

        info!(user = %record.user, "claim verified");
        Ok(Outcome::Verified { user: record.user })
    }
}
