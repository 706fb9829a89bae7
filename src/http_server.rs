use crate::audit::AuditLog;
use crate::claims::{self, ClaimError, ClaimRequest};
use crate::pipeline::{Disposition, Outcome, Pipeline};
use crate::store::StateStore;
use crate::types::PendingRecord;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Clone)]
pub struct ServerState {
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<dyn StateStore>,
    pub audit: Arc<AuditLog>,
    pub webhook_secret: Arc<str>,
    /// Lowercase name of the header carrying the webhook signature.
    pub signature_header: Arc<str>,
    pub payment_link: Arc<str>,
    pub allowed_origin: Arc<str>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/webhooks/payment", post(handle_webhook))
        .route("/claims", post(handle_claim))
        .route("/verification/{handle}", get(handle_lookup))
        .with_state(state)
}

/// Bind `addr`, spawn the server and return the bound address with the
/// server task handle.
pub async fn start(
    addr: &str,
    state: ServerState,
) -> Result<(SocketAddr, JoinHandle<()>), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(%local, "HTTP server bound");

    let app = router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP server error");
        }
    });

    Ok((local, handle))
}

async fn handle_webhook(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let signature = headers
        .get(&*state.signature_header)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let delivery = state
        .pipeline
        .handle_webhook(&body, signature, &state.webhook_secret)
        .await;
    state.audit.record(&delivery).await;

    // Callers only learn the broad class of failure.
    match delivery.outcome.disposition() {
        Disposition::Acknowledged => match delivery.outcome {
            Outcome::Verified { .. } => (StatusCode::OK, "Verified."),
            _ => (StatusCode::OK, "Acknowledged."),
        },
        Disposition::Rejected => (StatusCode::BAD_REQUEST, "Webhook rejected."),
        Disposition::Failed => (StatusCode::INTERNAL_SERVER_ERROR, "Try again later."),
    }
}

async fn handle_claim(
    State(state): State<ServerState>,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<PendingRecord>, (StatusCode, String)> {
    claims::submit_claim(&*state.store, request, &state.payment_link)
        .await
        .map(Json)
        .map_err(|err| {
            let status = match &err {
                ClaimError::MissingField(_) | ClaimError::InvalidProofUrl => StatusCode::BAD_REQUEST,
                ClaimError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
                ClaimError::AlreadyVerified(_) => StatusCode::CONFLICT,
                ClaimError::Store(_) | ClaimError::Encode(_) => {
                    error!(error = %err, "claim intake failed");
                    return (StatusCode::INTERNAL_SERVER_ERROR, "Try again later.".to_string());
                }
            };
            (status, err.to_string())
        })
}

async fn handle_lookup(
    State(state): State<ServerState>,
    Path(handle): Path<String>,
) -> Response {
    let cors = [(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        state.allowed_origin.to_string(),
    )];
    match claims::lookup(&*state.store, &handle).await {
        Ok(response) => (cors, Json(response)).into_response(),
        Err(e) => {
            error!(%handle, error = %e, "lookup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, cors).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{payment_payload, signed_header, FakeContent, SECRET};
    use crate::pipeline::DEFAULT_MARKER;
    use crate::store::{put_json, KvStore, PutOptions};
    use crate::types::tests::sample_pending;
    use crate::types::{pending_key, verified_key, LookupResponse, PENDING_TTL_SECS};
    use crate::verification::Verifier;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    struct Harness {
        store: Arc<KvStore>,
        audit: Arc<KvStore>,
        app: Router,
    }

    fn harness(content: FakeContent) -> Harness {
        let store = Arc::new(KvStore::in_memory("state"));
        let audit = Arc::new(KvStore::in_memory("audit"));
        let pipeline = Pipeline::new(
            Verifier::default(),
            store.clone(),
            Arc::new(content),
            DEFAULT_MARKER,
        );
        let state = ServerState {
            pipeline: Arc::new(pipeline),
            store: store.clone(),
            audit: Arc::new(AuditLog::new(audit.clone())),
            webhook_secret: Arc::from(SECRET),
            signature_header: Arc::from("stripe-signature"),
            payment_link: Arc::from("https://pay.example.com/link"),
            allowed_origin: Arc::from("https://twitter.com"),
        };
        Harness {
            store,
            audit,
            app: router(state),
        }
    }

    fn webhook_request(payload: Vec<u8>, signature: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhooks/payment")
            .header("content-type", "application/json")
            .header("stripe-signature", signature)
            .body(Body::from(payload))
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn paid_claim_with_marker_is_verified() {
        let pending = sample_pending();
        let h = harness(FakeContent::with_post(&pending.proof, "zabaglione forever"));
        put_json(
            &*h.store,
            &pending_key(&pending.email),
            &pending,
            PutOptions::expiring_after(PENDING_TTL_SECS),
        )
        .await
        .unwrap();

        let payload = payment_payload(&pending.email);
        let signature = signed_header(&payload);
        let response = h
            .app
            .clone()
            .oneshot(webhook_request(payload, &signature))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "Verified.");
        assert!(h.audit.keys().await.is_empty());

        let lookup = h
            .app
            .oneshot(
                Request::builder()
                    .uri("/verification/feelingblue")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(lookup.status(), StatusCode::OK);
        assert_eq!(
            lookup.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://twitter.com"
        );
        let body: LookupResponse = serde_json::from_str(&body_string(lookup).await).unwrap();
        assert_eq!(body.ttl, 86_400);
        assert_eq!(body.data.unwrap().proof, pending.proof);
        assert!(h.store.get(&verified_key("feelingblue")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn forged_webhook_gets_generic_rejection() {
        let h = harness(FakeContent::default());
        let payload = payment_payload("blue@example.com");
        let timestamp = chrono::Utc::now().timestamp();
        let response = h
            .app
            .oneshot(webhook_request(
                payload,
                &format!("t={timestamp},v1={}", "a".repeat(64)),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "Webhook rejected.");
        assert_eq!(h.audit.keys().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_signature_header_is_rejected() {
        let h = harness(FakeContent::default());
        let response = h
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/payment")
                    .body(Body::from(payment_payload("blue@example.com")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_payment_is_acknowledged_and_audited() {
        let h = harness(FakeContent::default());
        let payload = payment_payload("stranger@example.com");
        let signature = signed_header(&payload);
        let response = h
            .app
            .oneshot(webhook_request(payload, &signature))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "Acknowledged.");

        let keys = h.audit.keys().await;
        assert_eq!(keys.len(), 1);
        let entry: serde_json::Value =
            serde_json::from_str(&h.audit.get(&keys[0]).await.unwrap().unwrap()).unwrap();
        assert_eq!(entry["outcome"], "no_pending_claim");
        assert_eq!(entry["email"], "stranger@example.com");
    }

    async fn post_signed_payment(content: FakeContent) -> (Harness, Response) {
        let pending = sample_pending();
        let h = harness(content);
        put_json(
            &*h.store,
            &pending_key(&pending.email),
            &pending,
            PutOptions::default(),
        )
        .await
        .unwrap();

        let payload = payment_payload(&pending.email);
        let signature = signed_header(&payload);
        let response = h
            .app
            .clone()
            .oneshot(webhook_request(payload, &signature))
            .await
            .unwrap();
        (h, response)
    }

    #[tokio::test]
    async fn provider_outage_is_a_server_error() {
        let (_, response) = post_signed_payment(FakeContent {
            unavailable: true,
            ..FakeContent::default()
        })
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "Try again later.");
    }

    #[tokio::test]
    async fn missing_proof_post_is_acknowledged() {
        let (h, response) = post_signed_payment(FakeContent::default()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "Acknowledged.");
        assert!(h
            .store
            .get(&pending_key(&sample_pending().email))
            .await
            .unwrap()
            .is_some());
        assert_eq!(h.audit.keys().await.len(), 1);
    }

    #[tokio::test]
    async fn claim_intake_statuses() {
        let h = harness(FakeContent::default());
        let claim = json!({
            "email": "blue@example.com",
            "proof": "https://twitter.com/feelingblue/status/1325888821286776832",
            "emoji": "🔵",
            "love": "yes", "reason": "because", "ye": "sometimes",
            "literal": "no", "judge": "never"
        });
        let post = |body: serde_json::Value| {
            Request::builder()
                .method("POST")
                .uri("/claims")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let created = h.app.clone().oneshot(post(claim.clone())).await.unwrap();
        assert_eq!(created.status(), StatusCode::OK);
        let record: PendingRecord = serde_json::from_str(&body_string(created).await).unwrap();
        assert_eq!(record.user, "feelingblue");
        assert_eq!(record.payment_link, "https://pay.example.com/link");

        let mut incomplete = claim.clone();
        incomplete["judge"] = json!("");
        let response = h.app.clone().oneshot(post(incomplete)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        put_json(
            &*h.store,
            &verified_key("feelingblue"),
            &crate::types::VerifiedRecord::from(record),
            PutOptions::default(),
        )
        .await
        .unwrap();
        let response = h.app.oneshot(post(claim)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn lookup_miss_has_short_ttl() {
        let h = harness(FakeContent::default());
        let response = h
            .app
            .oneshot(
                Request::builder()
                    .uri("/verification/nobody")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body: LookupResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body.ttl, 1800);
        assert_eq!(body.data, None);
    }
}
