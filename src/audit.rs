use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error};

use crate::ledger::models::{NewVerificationLog, VerificationLog};
use crate::ledger::RevenueStore;

/// Append-only audit trail of every verification attempt
///
/// Writing the log never fails the caller: a broken audit write is reported
/// through tracing with the full entry so it can still be recovered from logs.
pub struct AuditLogger {
    store: Arc<dyn RevenueStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn RevenueStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, entry: NewVerificationLog) -> Option<VerificationLog> {
        let digest = payload_digest(&entry.payload);

        debug!(
            action = ?entry.action,
            status = ?entry.status,
            deal_id = ?entry.deal_id,
            connection_id = ?entry.connection_id,
            "audit: {}",
            entry.message.as_deref().unwrap_or("")
        );

        let action = entry.action;
        let snapshot = entry.payload.clone();
        match self.store.append_verification_log(entry, digest).await {
            Ok(row) => Some(row),
            Err(e) => {
                error!(
                    "❌ Failed to write verification log ({:?}): {} payload={}",
                    action, e, snapshot
                );
                None
            }
        }
    }
}

/// SHA-256 over the canonical JSON encoding of the payload
pub fn payload_digest(payload: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}
