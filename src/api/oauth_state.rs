use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

use crate::error::AppError;
use crate::ledger::models::SourceType;

/// How long an issued authorization `state` can be redeemed
const STATE_TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone)]
struct PendingAuthorization {
    business_id: Uuid,
    source: SourceType,
    issued_at: DateTime<Utc>,
}

/// One-time OAuth `state` values handed out by the authorize endpoint
///
/// A callback is accepted only with a state issued for the same business and
/// source within the TTL; redeeming removes it.
pub struct PendingAuthorizations {
    ttl: Duration,
    pending: Mutex<HashMap<String, PendingAuthorization>>,
}

impl Default for PendingAuthorizations {
    fn default() -> Self {
        Self::new(Duration::minutes(STATE_TTL_MINUTES))
    }
}

impl PendingAuthorizations {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn issue(&self, business_id: Uuid, source: SourceType) -> String {
        let now = Utc::now();
        let state = format!("{}.{}", business_id, Uuid::new_v4().simple());

        let mut pending = self.pending.lock();
        pending.retain(|_, p| now - p.issued_at < self.ttl);
        pending.insert(
            state.clone(),
            PendingAuthorization {
                business_id,
                source,
                issued_at: now,
            },
        );
        state
    }

    /// Consume `state`; any mismatch is treated as an unauthorized callback
    pub fn redeem(&self, state: &str, business_id: Uuid, source: SourceType) -> Result<(), AppError> {
        let issued = self.pending.lock().remove(state);

        match issued {
            Some(p) if p.business_id == business_id && p.source == source && Utc::now() - p.issued_at < self.ttl => {
                Ok(())
            }
            Some(_) => {
                warn!("⚠️ OAuth state for {} does not match business {} or has expired", source, business_id);
                Err(AppError::Unauthorized)
            }
            None => {
                warn!("⚠️ Unknown OAuth state presented for {} callback", source);
                Err(AppError::Unauthorized)
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }
}
