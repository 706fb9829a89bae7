use crate::pipeline::Delivery;
use crate::store::{PutOptions, StateStore};
use chrono::SecondsFormat;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const MAX_AUDIT_ENTRIES: usize = 500;

/// Entries older than this expire even when the cap is never reached.
pub const AUDIT_TTL_SECS: i64 = 30 * 24 * 3600;

/// Best-effort trail of deliveries that did not end in a verification.
pub struct AuditLog {
    sink: Option<Arc<dyn StateStore>>,
    max_entries: usize,
    /// Keys written so far, oldest first.
    written: Mutex<VecDeque<String>>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn StateStore>) -> Self {
        Self {
            sink: Some(sink),
            max_entries: MAX_AUDIT_ENTRIES,
            written: Mutex::new(VecDeque::new()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            sink: None,
            max_entries: 0,
            written: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// Take over entries left by a previous run so they count against the cap.
    /// Keys sort chronologically, see [`AuditLog::key_for`].
    pub fn with_existing(mut self, mut keys: Vec<String>) -> Self {
        keys.sort();
        self.written = Mutex::new(keys.into());
        self
    }

    /// Key is the receive time (RFC 3339, milliseconds) plus a delivery id
    /// prefix so concurrent deliveries never collide.
    pub fn key_for(delivery: &Delivery) -> String {
        let short_id: String = delivery.id.chars().take(8).collect();
        format!(
            "{}#{short_id}",
            delivery
                .received_at
                .to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }

    /// Never fails: a broken audit sink must not affect the delivery.
    pub async fn record(&self, delivery: &Delivery) {
        let Some(sink) = &self.sink else {
            return;
        };
        let Some(entry) = delivery.audit_entry() else {
            return;
        };

        let key = Self::key_for(delivery);
        let mut written = self.written.lock().await;
        let options = PutOptions::expiring_after(AUDIT_TTL_SECS);
        match sink.put(&key, entry.to_string(), options).await {
            Ok(()) => debug!(%key, outcome = delivery.outcome.kind(), "audit entry written"),
            Err(err) => {
                warn!(%key, error = %err, "failed to write audit entry");
                return;
            }
        }
        written.push_back(key);

        while written.len() > self.max_entries {
            let Some(oldest) = written.pop_front() else {
                break;
            };
            if let Err(err) = sink.delete(&oldest).await {
                warn!(key = %oldest, error = %err, "failed to drop old audit entry");
            }
        }
    }
}
