//! Per-subject atomic rate limiting over the shared key-value store (spec
//! §4.4). v1 policy: only `send_sms` is limited, keyed by `patient_id`,
//! `limit=1`, `window=3600s`.

use std::sync::Arc;

use crate::error::GatewayError;
use crate::kv::{KeyValueStore, RateLimitOutcome};

pub const SEND_SMS_WINDOW_SECONDS: u64 = 3600;
pub const SEND_SMS_LIMIT: u64 = 1;

pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// `check_and_consume(key, window_seconds, limit)` per spec §4.4,
    /// surfacing store failure as `RateLimitUnavailable` rather than masking
    /// it as `Exceeded` — the orchestrator decides the fail-closed tag.
    pub async fn check_and_consume(
        &self,
        key: &str,
        window_seconds: u64,
        limit: u64,
    ) -> Result<RateLimitOutcome, GatewayError> {
        self.store.check_and_consume(key, window_seconds, limit).await
    }

    pub fn send_sms_key(patient_id: &str) -> String {
        format!("ratelimit:send_sms:{patient_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryStore;

    #[tokio::test]
    async fn only_one_send_sms_per_window() {
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()));
        let key = RateLimiter::send_sms_key("p1");
        assert_eq!(
            limiter
                .check_and_consume(&key, SEND_SMS_WINDOW_SECONDS, SEND_SMS_LIMIT)
                .await
                .unwrap(),
            RateLimitOutcome::Allowed
        );
        assert_eq!(
            limiter
                .check_and_consume(&key, SEND_SMS_WINDOW_SECONDS, SEND_SMS_LIMIT)
                .await
                .unwrap(),
            RateLimitOutcome::Exceeded
        );
    }

    #[tokio::test]
    async fn distinct_patients_have_independent_budgets() {
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()));
        for patient in ["p1", "p2"] {
            let key = RateLimiter::send_sms_key(patient);
            assert_eq!(
                limiter
                    .check_and_consume(&key, SEND_SMS_WINDOW_SECONDS, SEND_SMS_LIMIT)
                    .await
                    .unwrap(),
                RateLimitOutcome::Allowed
            );
        }
    }
}
